//! Agent runtime: the [`TurnLoop`] and its supporting modules.
//!
//! - [`turn_loop`] drives one run: stream, dispatch tools, repeat. Start here.
//! - [`events`] carries [`AgentEvent`]s from the loop to a consumer.
//! - [`repetition`] notices a model stuck repeating an action.
//! - [`session`] persists conversation snapshots and checkpoints.
//! - [`shared_context`] holds notes shared across sessions.

pub mod events;
pub mod repetition;
pub mod session;
pub mod shared_context;
pub mod turn_loop;

pub use events::{AgentEvent, EventSender, EventStream};
pub use repetition::RepetitionDetector;
pub use session::{SessionSnapshot, SessionStore, SessionSummary};
pub use shared_context::SharedContextStore;
pub use turn_loop::{TurnConfig, TurnLoop, TurnOutcome, TurnState};
