//! Node directory: the persistence layer's view of registered nodes.
//!
//! The server only reads from it. [`MemoryDirectory`] backs tests and
//! stand-alone deployments.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::pixel::PixelFormat;

#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    pub id: u32,
    pub uuid: Uuid,
    pub secret: Vec<u8>,
    pub label: String,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// One output channel of a node, mapped onto a framebuffer region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeChannel {
    pub node_id: u32,
    pub index: u32,
    pub pixel_count: u32,
    pub fb_offset: u32,
    pub format: PixelFormat,
}

pub trait NodeDirectory: Send + Sync {
    fn find_node_by_uuid(&self, uuid: &Uuid) -> Option<Node>;
    fn channels_for_node(&self, node_id: u32) -> Vec<NodeChannel>;
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    nodes: RwLock<HashMap<Uuid, Node>>,
    channels: RwLock<HashMap<u32, Vec<NodeChannel>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node.
    pub fn insert_node(&self, node: Node) {
        self.nodes.write().insert(node.uuid, node);
    }

    /// Adds a channel, replacing any existing channel with the same index.
    pub fn insert_channel(&self, channel: NodeChannel) {
        let mut channels = self.channels.write();
        let list = channels.entry(channel.node_id).or_default();
        list.retain(|c| c.index != channel.index);
        list.push(channel);
        list.sort_by_key(|c| c.index);
    }

    pub fn remove_node(&self, uuid: &Uuid) -> Option<Node> {
        let node = self.nodes.write().remove(uuid)?;
        self.channels.write().remove(&node.id);
        Some(node)
    }
}

impl NodeDirectory for MemoryDirectory {
    fn find_node_by_uuid(&self, uuid: &Uuid) -> Option<Node> {
        self.nodes.read().get(uuid).cloned()
    }

    fn channels_for_node(&self, node_id: u32) -> Vec<NodeChannel> {
        self.channels
            .read()
            .get(&node_id)
            .cloned()
            .unwrap_or_default()
    }
}
