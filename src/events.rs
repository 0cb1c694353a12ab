//! Domain events emitted by the [`Manager`](crate::Manager).
//!
//! Every manager owns one unbounded channel; events from the same node or
//! player arrive in the order they were produced and are never dropped while
//! the receiver is alive.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::audio::track::{QueueTrack, Track};
use crate::nodes::TrackEndReason;

#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    // Nodos
    NodeCreate { node: String },
    NodeDestroy { node: String },
    NodeConnect { node: String },
    NodeReconnect { node: String, attempt: u32 },
    NodeDisconnect {
        node: String,
        code: Option<u16>,
        reason: String,
        terminal: bool,
    },
    NodeError { node: String, error: String },
    NodeRaw { node: String, payload: Value },

    // Players
    PlayerCreate { guild_id: String },
    PlayerDestroy { guild_id: String },
    PlayerMove {
        guild_id: String,
        old_channel: Option<String>,
        new_channel: Option<String>,
    },
    PlayerDisconnect {
        guild_id: String,
        old_channel: Option<String>,
    },

    // Reproducción
    TrackStart { guild_id: String, track: Option<Track> },
    TrackEnd {
        guild_id: String,
        track: Option<Track>,
        reason: TrackEndReason,
    },
    TrackStuck {
        guild_id: String,
        track: Option<Track>,
        threshold_ms: u64,
    },
    TrackError {
        guild_id: String,
        track: Option<QueueTrack>,
        error: String,
    },
    QueueEnd { guild_id: String, track: Option<Track> },
    SocketClosed {
        guild_id: String,
        code: u16,
        reason: String,
        by_remote: bool,
    },

    /// A player held half of its voice credentials for longer than
    /// `voice_update_timeout`.
    VoiceUpdateTimeout { guild_id: String },
}

pub type EventReceiver = mpsc::UnboundedReceiver<ManagerEvent>;

#[derive(Clone, Debug)]
pub(crate) struct EventSender {
    tx: mpsc::UnboundedSender<ManagerEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ManagerEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("Evento descartado (receptor cerrado): {:?}", e.0);
        }
    }
}
