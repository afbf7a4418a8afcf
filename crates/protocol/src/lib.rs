//! Groundstation Protocol
//!
//! Wire types for the agent event-stream protocol. Events arrive as
//! newline-delimited JSON on a streaming HTTP response; control requests
//! and responses are plain JSON bodies.

use uuid::Uuid;

// Re-exports
pub mod events;
pub mod types;

pub use events::{parse_event_line, AgentEvent};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
