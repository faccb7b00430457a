//! Core type definitions shared by the registry, node model and coordinator
//!
//! Key design principles:
//! 1. Two identity spaces, two distinct types: a `VolatileId` can never be
//!    passed where a `StableId` is expected
//! 2. Use u32 for ids (CDP ids are 32-bit ints)
//! 3. Cross-references are ids resolved through the registry, never pointers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Long-lived node identity (CDP `backendNodeId`)
///
/// The only id safe to hold across time. Parent/child links use it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(pub u32);

/// Short-lived RPC handle (CDP `nodeId`)
///
/// Valid only within the current document generation. `0` on the wire means
/// "not assigned" and is never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolatileId(pub u32);

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for VolatileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Frame identifier from CDP
pub type FrameId = String;

/// Runtime remote object identifier from CDP
pub type RemoteObjectId = String;

/// One content quad: four (x, y) corners, clockwise from top-left
pub type Quad = [f64; 8];

/// Node type matching DOM specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeType {
    Element = 1,
    Attribute = 2,
    Text = 3,
    CdataSection = 4,
    EntityReference = 5,
    Entity = 6,
    ProcessingInstruction = 7,
    Comment = 8,
    Document = 9,
    DocumentType = 10,
    DocumentFragment = 11,
    Notation = 12,
}

impl NodeType {
    /// Standard node type codes 1..=12; anything else is not a DOM node
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(NodeType::Element),
            2 => Some(NodeType::Attribute),
            3 => Some(NodeType::Text),
            4 => Some(NodeType::CdataSection),
            5 => Some(NodeType::EntityReference),
            6 => Some(NodeType::Entity),
            7 => Some(NodeType::ProcessingInstruction),
            8 => Some(NodeType::Comment),
            9 => Some(NodeType::Document),
            10 => Some(NodeType::DocumentType),
            11 => Some(NodeType::DocumentFragment),
            12 => Some(NodeType::Notation),
            _ => None,
        }
    }
}

/// Shadow root type from CDP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShadowRootType {
    UserAgent,
    Open,
    Closed,
}

/// Rectangle with coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DomRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Axis-aligned bounding box of a set of quads; `None` when empty
    pub fn bounding(quads: &[Quad]) -> Option<Self> {
        let mut xs = quads.iter().flat_map(|q| q.iter().step_by(2).copied());
        let first_x = xs.next()?;
        let (min_x, max_x) = xs.fold((first_x, first_x), |(lo, hi), x| (lo.min(x), hi.max(x)));

        let mut ys = quads.iter().flat_map(|q| q.iter().skip(1).step_by(2).copied());
        let first_y = ys.next()?;
        let (min_y, max_y) = ys.fold((first_y, first_y), |(lo, hi), y| (lo.min(y), hi.max(y)));

        Some(Self::new(min_x, min_y, max_x - min_x, max_y - min_y))
    }
}
