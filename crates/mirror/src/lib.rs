//! DOM Mirror Library
//!
//! Keeps a local, identity-preserving copy of a remote browser document in
//! sync through the DevTools `DOM` domain.
//!
//! ## Core Design
//!
//! ```text
//! DOM.getDocument ─► NodeDescriptor ─► NodeRegistry (arena) ◄─ DOM.* events
//!                                           │
//!                          StableId ────────┤──── VolatileId
//!                                           ▼
//!                                      DomSerializer ─► SerializedNode
//! ```
//!
//! Nodes are keyed by the remote side's stable backend id. A node is the
//! same instance for as long as it lives in the mirror, no matter how many
//! times it is re-described or how often its volatile id changes.
//!
//! [`DomMirror`] owns the registry and serializes access to it; everything
//! that crosses an await is guarded by a document generation counter.

pub mod descriptor;
pub mod error;
pub mod events;
pub mod mirror;
pub mod node;
pub mod registry;
pub mod selector;
pub mod serializer;
pub mod transport;
pub mod types;

pub use descriptor::{BackendNode, NodeDescriptor};
pub use error::{DomError, Result};
pub use events::{DomEvent, MirrorUpdate};
pub use mirror::{DomMirror, MirrorConfig, MirrorPhase, NodeRef, WriteOrigin};
pub use node::{Kind, MirrorNode, NodeKind};
pub use registry::{InsertAt, NodeRegistry};
pub use serializer::{DomSerializer, SerializedElement, SerializedNode, SerializerConfig};
pub use transport::DomTransport;
pub use types::*;
