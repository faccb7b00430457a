//! Error types for mirror operations
//!
//! Simple, flat error hierarchy. Consistency gaps are not errors: an event
//! naming a node the mirror never saw is logged and absorbed by the caller.

use crate::types::StableId;
use cdp::CDPError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DomError>;

#[derive(Debug, Error)]
pub enum DomError {
    /// A remote command failed; the registry was left untouched
    #[error("{method} failed: {source}")]
    Transport {
        method: String,
        #[source]
        source: CDPError,
    },

    /// Protocol/version mismatch; never an ordinary race
    #[error("Malformed node descriptor: {0}")]
    MalformedDescriptor(String),

    /// A command completed after the document was reset
    #[error("Stale response from generation {started} (current {current})")]
    Stale { started: u64, current: u64 },

    #[error("No document loaded")]
    NotReady,

    #[error("Node not found: {0}")]
    NodeNotFound(StableId),

    #[error("Unexpected {method} response: {detail}")]
    UnexpectedResponse { method: String, detail: String },

    #[error("Invalid {method} event: {source}")]
    InvalidEvent {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
}
