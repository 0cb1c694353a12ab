//! # Audio Module
//!
//! Per-guild playback control. The audio itself is produced by the nodes;
//! this module keeps the state needed to drive them.
//!
//! ## Architecture
//!
//! ### [`player`] - Player
//! - One session per guild, assigned to a node
//! - Validates every control operation before it reaches the node
//! - Voice channel lifecycle through the host's gateway
//!
//! ### [`queue`] - Queue Management
//! - Pending tracks plus `current` and `previous`
//! - Insert, remove, range removal and shuffle
//!
//! ### [`track`] - Tracks
//! - Resolved tracks carry the node's opaque handle
//! - Unresolved tracks are matched by a search right before playing
//!
//! ### [`equalizer`] - Equalizer
//! - 15 bands, always sent to the node as a whole
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use lavalink_manager::audio::{PlayOptions, PlayerOptions, UnresolvedTrack};
//! use lavalink_manager::Manager;
//!
//! # async fn example(manager: Manager) -> lavalink_manager::Result<()> {
//! let player = manager.create(PlayerOptions::new("123456789").voice_channel("987654321"))?;
//! player.connect()?;
//!
//! // Se resuelve con una búsqueda justo antes de reproducir
//! let track = UnresolvedTrack::new("Never Gonna Give You Up").author("Rick Astley");
//! player.play(Some(track.into()), PlayOptions::default()).await?;
//!
//! player.set_volume(80)?;
//! player.pause(true)?;
//! # Ok(())
//! # }
//! ```

pub mod equalizer;
pub mod player;
pub mod queue;
pub mod track;

pub use self::equalizer::{Equalizer, EqualizerBand, BAND_COUNT};
pub use self::player::{PlayOptions, Player, PlayerOptions, PlayerState};
pub use self::queue::Queue;
pub use self::track::{
    LoadException, LoadType, PlaylistInfo, QueueTrack, SearchResult, Track, TrackData, TrackInfo,
    TrackSearcher, UnresolvedTrack,
};
