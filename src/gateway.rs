//! Outbound link to the chat gateway, supplied by the host application.

use serde_json::{json, Value};

/// Forwards a payload to the gateway shard that owns `guild_id`.
///
/// Any `Fn(&str, Value)` closure works as a sender.
#[cfg_attr(test, mockall::automock)]
pub trait GatewaySender: Send + Sync + 'static {
    fn send(&self, guild_id: &str, payload: Value);
}

impl<F> GatewaySender for F
where
    F: Fn(&str, Value) + Send + Sync + 'static,
{
    fn send(&self, guild_id: &str, payload: Value) {
        self(guild_id, payload)
    }
}

/// Op 4 (voice state update): join `channel_id`, or leave when it is `None`.
pub fn voice_state_payload(
    guild_id: &str,
    channel_id: Option<&str>,
    self_mute: bool,
    self_deaf: bool,
) -> Value {
    json!({
        "op": 4,
        "d": {
            "guild_id": guild_id,
            "channel_id": channel_id,
            "self_mute": self_mute,
            "self_deaf": self_deaf,
        }
    })
}
