//! Typed CM event surface (§4.2), replacing the informal `emit(name,
//! payload)` / `eprintln!` pattern the teacher uses in `collector/runner.rs`
//! with an enumerated event type observers subscribe to (§9 redesign note).

use serde_json::Value;

use crate::connection::ConnectionState;

#[derive(Debug, Clone)]
pub enum CmEvent {
    RawMessage(Value),
    StateChange { from: ConnectionState, to: ConnectionState },
    StreamAdded(String),
    StreamRemoved(String),
    Reconnecting { attempt: u32 },
    Reconnected,
    Error { kind: &'static str, message: String },
}
