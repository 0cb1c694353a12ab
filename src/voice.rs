//! Voice credential fragments delivered by the chat gateway.
//!
//! A player can only be handed to its node once both halves are known: the
//! voice server (token + endpoint) and the session id from the bot's own
//! voice state. They arrive independently and in any order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::nodes::protocol::Operation;

/// `VOICE_SERVER_UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VoiceServer {
    pub token: String,
    pub guild_id: String,
    #[serde(default)]
    pub endpoint: String,
}

/// `VOICE_STATE_UPDATE` payload (only the fields the manager needs).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VoiceStateUpdate {
    pub guild_id: String,
    pub user_id: String,
    pub session_id: String,
    /// `None` when the user left (or was removed from) the channel.
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Gateway dispatch relevant to voice, discriminated by the `t` field.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "t", content = "d")]
pub enum VoicePacket {
    #[serde(rename = "VOICE_SERVER_UPDATE")]
    Server(VoiceServer),
    #[serde(rename = "VOICE_STATE_UPDATE")]
    State(VoiceStateUpdate),
}

impl VoicePacket {
    /// Parses a raw gateway dispatch. Returns `Ok(None)` for unrelated events
    /// and for voice dispatches outside a guild (direct-message calls).
    pub fn from_gateway(raw: &Value) -> Result<Option<Self>> {
        match raw.get("t").and_then(Value::as_str) {
            Some("VOICE_SERVER_UPDATE") | Some("VOICE_STATE_UPDATE") => {
                // Sin guild no hay player al que entregarlo
                if raw["d"]["guild_id"].is_null() {
                    return Ok(None);
                }
                Ok(Some(serde_json::from_value(raw.clone())?))
            }
            _ => Ok(None),
        }
    }

    pub fn guild_id(&self) -> &str {
        match self {
            VoicePacket::Server(server) => &server.guild_id,
            VoicePacket::State(state) => &state.guild_id,
        }
    }
}

/// Half-assembled credentials of a player.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceState {
    pub guild_id: Option<String>,
    pub event: Option<VoiceServer>,
    pub session_id: Option<String>,
}

impl VoiceState {
    pub fn is_complete(&self) -> bool {
        self.guild_id.is_some() && self.event.is_some() && self.session_id.is_some()
    }

    /// The merged `voiceUpdate` operation, once every key is present.
    pub fn to_operation(&self) -> Option<Operation> {
        match (&self.guild_id, &self.event, &self.session_id) {
            (Some(guild_id), Some(event), Some(session_id)) => Some(Operation::VoiceUpdate {
                guild_id: guild_id.clone(),
                session_id: session_id.clone(),
                event: event.clone(),
            }),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_from_gateway_discriminates_by_type() {
        let server = VoicePacket::from_gateway(&json!({
            "t": "VOICE_SERVER_UPDATE",
            "d": { "token": "tok", "guild_id": "1", "endpoint": "x.discord.media" }
        }))
        .unwrap()
        .unwrap();
        assert!(matches!(server, VoicePacket::Server(_)));
        assert_eq!(server.guild_id(), "1");

        let state = VoicePacket::from_gateway(&json!({
            "t": "VOICE_STATE_UPDATE",
            "d": { "guild_id": "1", "user_id": "2", "session_id": "s", "channel_id": null }
        }))
        .unwrap()
        .unwrap();
        assert_eq!(
            state,
            VoicePacket::State(VoiceStateUpdate {
                guild_id: "1".into(),
                user_id: "2".into(),
                session_id: "s".into(),
                channel_id: None,
            })
        );

        assert!(VoicePacket::from_gateway(&json!({ "t": "MESSAGE_CREATE", "d": {} }))
            .unwrap()
            .is_none());
        assert!(VoicePacket::from_gateway(&json!({ "t": "VOICE_STATE_UPDATE", "d": {} }))
            .unwrap()
            .is_none());
        assert!(VoicePacket::from_gateway(&json!({
            "t": "VOICE_STATE_UPDATE",
            "d": { "guild_id": null, "user_id": "2", "session_id": "s", "channel_id": "3" }
        }))
        .unwrap()
        .is_none());
        assert!(VoicePacket::from_gateway(&json!({
            "t": "VOICE_STATE_UPDATE",
            "d": { "guild_id": "1", "user_id": "2" }
        }))
        .is_err());
    }

    #[test]
    fn test_voice_state_completion() {
        let mut state = VoiceState::default();
        assert!(state.to_operation().is_none());

        state.session_id = Some("s".into());
        assert!(!state.is_complete());

        state.guild_id = Some("1".into());
        state.event = Some(VoiceServer {
            token: "t".into(),
            guild_id: "1".into(),
            endpoint: "e".into(),
        });
        assert!(state.is_complete());
        assert_eq!(state.to_operation().unwrap().guild_id(), "1");

        state.clear();
        assert_eq!(state, VoiceState::default());
    }
}
