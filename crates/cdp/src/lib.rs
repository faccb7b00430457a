//! CDP (Chrome DevTools Protocol) Client Implementation
//!
//! Core principle: Single WebSocket connection, multiplexed sessions.
//! No locks in hot path - use message passing instead.
//!
//! This crate is transport only: it delivers commands and ordered event
//! streams. Interpreting DOM payloads is left to its consumers.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::{CDPClient, CDPError, Result};
pub use protocol::{CDPEvent, ProtocolError, SessionId, TargetId};
pub use session::{page_targets, CDPSession, TargetInfo};
