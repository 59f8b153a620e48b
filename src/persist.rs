//! Persisted node identity.
//!
//! The original source keeps the claimed `NodeId` in a settings record saved
//! through an external key-value store and calls `save_queued()` once the
//! write is durable. `NodeIdStore` is that same seam as a trait, with an
//! in-memory default for tests and demos.

use crate::can::NodeId;

pub trait NodeIdStore: Send {
    fn load(&self) -> Option<NodeId>;
    fn save(&mut self, id: NodeId);
}

/// Keeps the claimed `NodeId` in memory only; state is lost on restart. Hosts
/// that need a real persisted identity provide their own `NodeIdStore`.
#[derive(Debug, Default)]
pub struct MemoryNodeIdStore {
    current: Option<NodeId>,
}

impl NodeIdStore for MemoryNodeIdStore {
    fn load(&self) -> Option<NodeId> {
        self.current
    }

    fn save(&mut self, id: NodeId) {
        self.current = Some(id);
    }
}
