//! # lavalink-manager
//!
//! Client-side orchestration of Lavalink audio nodes for a chat bot.
//!
//! The [`Manager`] keeps a pool of [`Node`]s (one persistent connection each,
//! reconnecting on their own) and one [`Player`] per guild. The host
//! application plugs in two things: a [`GatewaySender`] used to join and
//! leave voice channels, and the voice dispatches it receives from the
//! gateway, fed back through [`Manager::update_voice_state`]. Everything the
//! manager observes comes out of the [`EventReceiver`] returned by
//! [`Manager::new`].
//!
//! ```rust,no_run
//! use lavalink_manager::{Manager, ManagerEvent, ManagerOptions, NodeOptions};
//! use serde_json::Value;
//!
//! # async fn run() -> lavalink_manager::Result<()> {
//! let options = ManagerOptions {
//!     nodes: vec![NodeOptions::new("localhost", 2333, "youshallnotpass")],
//!     ..Default::default()
//! };
//!
//! let (manager, mut events) = Manager::new(options, |guild_id: &str, payload: Value| {
//!     // Reenviar al shard que atiende `guild_id`
//!     println!("{guild_id}: {payload}");
//! })?;
//! manager.init("123456789012345678")?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ManagerEvent::NodeConnect { node } = event {
//!         println!("node {node} ready");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
mod manager;
pub mod nodes;
mod search;
pub mod voice;

pub use crate::audio::{PlayOptions, Player, PlayerOptions, PlayerState, QueueTrack, Track, UnresolvedTrack};
pub use crate::config::{ManagerOptions, NodeOptions, SearchPlatform};
pub use crate::error::{Error, Result};
pub use crate::events::{EventReceiver, ManagerEvent};
pub use crate::gateway::GatewaySender;
pub use crate::manager::Manager;
pub use crate::nodes::{Node, NodeStatus};
pub use crate::voice::VoicePacket;
