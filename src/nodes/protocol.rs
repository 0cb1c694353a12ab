//! Messages exchanged with a node over its persistent socket.

use serde::{Deserialize, Serialize};

use crate::audio::equalizer::EqualizerBand;
use crate::voice::VoiceServer;

/// Operation written to a node. Serialized with an `op` tag, e.g.
/// `{"op":"pause","guildId":"123","pause":true}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Operation {
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        no_replace: Option<bool>,
    },
    Pause {
        guild_id: String,
        pause: bool,
    },
    Stop {
        guild_id: String,
    },
    Seek {
        guild_id: String,
        position: u64,
    },
    Volume {
        guild_id: String,
        volume: u16,
    },
    Equalizer {
        guild_id: String,
        bands: Vec<EqualizerBand>,
    },
    Destroy {
        guild_id: String,
    },
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: VoiceServer,
    },
}

impl Operation {
    pub fn guild_id(&self) -> &str {
        match self {
            Operation::Play { guild_id, .. }
            | Operation::Pause { guild_id, .. }
            | Operation::Stop { guild_id }
            | Operation::Seek { guild_id, .. }
            | Operation::Volume { guild_id, .. }
            | Operation::Equalizer { guild_id, .. }
            | Operation::Destroy { guild_id }
            | Operation::VoiceUpdate { guild_id, .. } => guild_id,
        }
    }
}

/// Snapshot of the node's load, refreshed by `stats` messages.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    /// Milliseconds since the node started.
    pub uptime: u64,
    pub memory: MemoryStats,
    /// `None` until the node sends its first snapshot.
    pub cpu: Option<CpuStats>,
    pub frame_stats: Option<FrameStats>,
}

impl NodeStats {
    /// System load as a percentage of the available cores. Nodes without CPU
    /// telemetry report 0.
    pub fn load(&self) -> f64 {
        match &self.cpu {
            Some(cpu) if cpu.cores > 0 => cpu.system_load / f64::from(cpu.cores) * 100.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// Why the node stopped a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct TrackException {
    pub message: Option<String>,
    pub severity: Option<String>,
    pub cause: Option<String>,
}

/// Playback telemetry carried by `{"op":"event"}` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum TrackEvent {
    #[serde(rename = "TrackStartEvent")]
    Start {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
    },
    #[serde(rename = "TrackEndEvent")]
    End {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
        reason: TrackEndReason,
    },
    #[serde(rename = "TrackExceptionEvent")]
    Exception {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
        #[serde(default)]
        exception: Option<TrackException>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "TrackStuckEvent")]
    Stuck {
        guild_id: String,
        #[serde(default)]
        track: Option<String>,
        #[serde(default)]
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent")]
    WebSocketClosed {
        guild_id: String,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
}

impl TrackEvent {
    pub fn guild_id(&self) -> &str {
        match self {
            TrackEvent::Start { guild_id, .. }
            | TrackEvent::End { guild_id, .. }
            | TrackEvent::Exception { guild_id, .. }
            | TrackEvent::Stuck { guild_id, .. }
            | TrackEvent::WebSocketClosed { guild_id, .. } => guild_id,
        }
    }
}

/// Position report carried by `{"op":"playerUpdate"}` messages.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdate {
    pub guild_id: String,
    pub state: PlayerUpdateState,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PlayerUpdateState {
    pub time: u64,
    pub position: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_operation_wire_format() {
        let play = Operation::Play {
            guild_id: "123".into(),
            track: "QAAA".into(),
            start_time: Some(5000),
            end_time: None,
            no_replace: None,
        };
        assert_eq!(
            serde_json::to_value(&play).unwrap(),
            json!({ "op": "play", "guildId": "123", "track": "QAAA", "startTime": 5000 })
        );

        let voice = Operation::VoiceUpdate {
            guild_id: "123".into(),
            session_id: "abc".into(),
            event: VoiceServer {
                token: "tok".into(),
                guild_id: "123".into(),
                endpoint: "eu.discord.media".into(),
            },
        };
        assert_eq!(
            serde_json::to_value(&voice).unwrap(),
            json!({
                "op": "voiceUpdate",
                "guildId": "123",
                "sessionId": "abc",
                "event": { "token": "tok", "guild_id": "123", "endpoint": "eu.discord.media" }
            })
        );
    }

    #[test]
    fn test_stats_load() {
        let stats: NodeStats = serde_json::from_value(json!({
            "op": "stats",
            "players": 3,
            "playingPlayers": 1,
            "uptime": 1000,
            "memory": { "free": 1, "used": 2, "allocated": 3, "reservable": 4 },
            "cpu": { "cores": 4, "systemLoad": 0.4, "lavalinkLoad": 0.1 }
        }))
        .unwrap();

        assert_eq!(stats.playing_players, 1);
        assert!((stats.load() - 10.0).abs() < 1e-9);
        assert_eq!(NodeStats::default().load(), 0.0);
    }

    #[test]
    fn test_track_event_parsing() {
        let end: TrackEvent = serde_json::from_value(json!({
            "op": "event",
            "type": "TrackEndEvent",
            "guildId": "123",
            "track": "QAAA",
            "reason": "LOAD_FAILED"
        }))
        .unwrap();
        assert_eq!(
            end,
            TrackEvent::End {
                guild_id: "123".into(),
                track: Some("QAAA".into()),
                reason: TrackEndReason::LoadFailed,
            }
        );

        let closed: TrackEvent = serde_json::from_value(json!({
            "op": "event",
            "type": "WebSocketClosedEvent",
            "guildId": "123",
            "code": 4006,
            "reason": "Session no longer valid",
            "byRemote": true
        }))
        .unwrap();
        assert_eq!(closed.guild_id(), "123");
        assert!(matches!(closed, TrackEvent::WebSocketClosed { code: 4006, by_remote: true, .. }));
    }

    #[test]
    fn test_unknown_end_reason() {
        let reason: TrackEndReason = serde_json::from_value(json!("SOMETHING_NEW")).unwrap();
        assert_eq!(reason, TrackEndReason::Unknown);
    }
}
