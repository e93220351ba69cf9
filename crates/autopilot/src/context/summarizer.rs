//! Incremental summarization for context compaction.
//!
//! Keeps a running summary across compactions. Each compaction sends the
//! previous summary plus the selected messages in one LLM call and the result
//! replaces the previous summary entirely.

use crate::llm::{LlmClient, collect_completion};
use crate::{Message, MessageRole, TokenUsage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What was accomplished (completed subtasks, files modified)
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- File paths and function names mentioned
- Current plan state and what remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary that replaces the existing one entirely.";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Per-message character cap in the transcript sent to the model.
    pub max_message_chars: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            max_message_chars: 4_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct Summarizer {
    summary: Option<String>,
    compactions: usize,
    config: SummarizerConfig,
}

impl Summarizer {
    pub fn new(config: SummarizerConfig) -> Self {
        Self {
            summary: None,
            compactions: 0,
            config,
        }
    }

    /// The running summary, if any compaction has happened.
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn compactions(&self) -> usize {
        self.compactions
    }

    /// Build the (system, user) pair for a one-shot summarization call.
    pub fn build_request(&self, span: &[Message]) -> Vec<Message> {
        let mut content = String::new();

        if let Some(existing) = &self.summary {
            content.push_str("=== EXISTING SUMMARY ===\n");
            content.push_str(existing);
            content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
        }

        for msg in span {
            content.push_str(&self.render(msg));
            content.push_str("\n\n");
        }

        vec![
            Message::system(SUMMARIZATION_PROMPT),
            Message::user(content),
        ]
    }

    fn render(&self, msg: &Message) -> String {
        let mut text: String = msg.text().chars().take(self.config.max_message_chars).collect();
        if msg.text().chars().count() > self.config.max_message_chars {
            text.push_str(" [truncated]");
        }
        match msg.role {
            MessageRole::Assistant if msg.has_tool_calls() => {
                let calls: Vec<String> = msg
                    .tool_calls
                    .iter()
                    .flatten()
                    .map(|c| format!("{}({})", c.function.name, c.function.arguments))
                    .collect();
                format!("[assistant]: {text} [calls: {}]", calls.join(", "))
            }
            MessageRole::Tool if msg.is_error => format!("[tool error]: {text}"),
            role if text.is_empty() => format!("[{role}]: [no content]"),
            role => format!("[{role}]: {text}"),
        }
    }

    /// Record a new running summary.
    pub fn apply_summary(&mut self, summary: String) {
        self.summary = Some(summary);
        self.compactions += 1;
    }

    /// Summarize `span` with `llm`, merging into the running summary.
    ///
    /// Returns the new summary and the tokens the call consumed.
    pub async fn summarize(
        &mut self,
        llm: &dyn LlmClient,
        span: &[Message],
    ) -> Result<(String, TokenUsage), String> {
        let request = self.build_request(span);
        debug!("Summarizing {} messages", span.len());
        let stream = llm
            .chat_completion(&request, None)
            .await
            .map_err(|e| format!("Failed to request summary: {e}"))?;
        let (summary, usage) = collect_completion(stream).await?;
        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err("Summarizer returned an empty summary".into());
        }
        info!(
            "Summarized {} messages into {} chars",
            span.len(),
            summary.chars().count()
        );
        self.apply_summary(summary.clone());
        Ok((summary, usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    #[test]
    fn build_request_without_existing_summary() {
        let summarizer = Summarizer::default();
        let messages = vec![
            Message::user("Read file src/main.rs"),
            Message::tool_result("c1", "fn main() { ... }"),
        ];

        let request = summarizer.build_request(&messages);
        assert_eq!(request.len(), 2);
        assert!(request[0].text().contains("Summarize"));
        assert!(request[1].text().contains("[user]: Read file src/main.rs"));
        assert!(!request[1].text().contains("EXISTING SUMMARY"));
    }

    #[test]
    fn build_request_merges_existing_summary() {
        let mut summarizer = Summarizer::default();
        summarizer.apply_summary("Previously: read main.rs.".into());

        let request = summarizer.build_request(&[Message::user("Now read lib.rs")]);
        assert!(request[1].text().contains("EXISTING SUMMARY"));
        assert!(request[1].text().contains("Previously:"));
        assert_eq!(summarizer.compactions(), 1);
    }

    #[test]
    fn tool_calls_and_long_content_rendered() {
        let summarizer = Summarizer::new(SummarizerConfig {
            max_message_chars: 10,
        });
        let messages = vec![
            Message::assistant_tool_calls(
                None,
                vec![ToolCall::new("c1", "read_file", r#"{"path":"a.rs"}"#)],
            ),
            Message::tool_result("c1", "x".repeat(50)),
        ];
        let user = summarizer.build_request(&messages)[1].text().to_string();
        assert!(user.contains(r#"[calls: read_file({"path":"a.rs"})]"#));
        assert!(user.contains(&format!("{} [truncated]", "x".repeat(10))));
    }
}
