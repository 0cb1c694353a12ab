//! # Nodes Module
//!
//! Connections to the Lavalink servers that do the actual audio work.
//!
//! - [`Node`]: one server. Owns the persistent socket, counts REST calls and
//!   keeps the latest stats snapshot. Reconnects on its own with a capped
//!   exponential backoff.
//! - [`NodePool`]: the registered nodes and the two selection queries used
//!   to spread work (`least_used` for REST, `least_load` for players).
//! - [`Transport`]: the network seam. [`LavalinkTransport`] talks WebSocket
//!   and HTTP.
//!
//! Whatever a node reads from its socket is handed to a [`NodeHandler`]
//! without waiting on it, so a slow consumer never stalls the read loop.

mod node;
mod pool;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use self::node::{Node, NodeStatus};
pub use self::pool::NodePool;
pub use self::protocol::{NodeStats, Operation, PlayerUpdateState, TrackEndReason, TrackEvent};
pub use self::transport::{Connection, Handshake, LavalinkTransport, RestRequest, SocketEvent, Transport};

use serde_json::Value;

/// What a node reports upwards.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeMessage {
    Connected,
    Reconnecting { attempt: u32 },
    Disconnected {
        code: Option<u16>,
        reason: String,
        /// The node gave up and will not reconnect.
        terminal: bool,
    },
    Error(String),
    /// Every payload received, before it is interpreted.
    Raw(Value),
    Stats(NodeStats),
    PlayerUpdate { guild_id: String, state: PlayerUpdateState },
    Event(TrackEvent),
}

/// Receives node messages. Called from the node's read loop, so it must not block.
pub trait NodeHandler: Send + Sync + 'static {
    fn handle(&self, node: &Node, message: NodeMessage);
}
