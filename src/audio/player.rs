use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::equalizer::{Equalizer, EqualizerBand, BAND_COUNT};
use super::queue::Queue;
use super::track::{QueueTrack, Track, TrackSearcher, UnresolvedTrack};
use crate::error::{validate_snowflake, Error, Result};
use crate::events::{EventSender, ManagerEvent};
use crate::gateway::{voice_state_payload, GatewaySender};
use crate::nodes::{Node, NodePool, Operation, TrackEndReason};
use crate::voice::{VoiceServer, VoiceState};

const MAX_VOLUME: i32 = 1000;
const DEFAULT_VOLUME: u16 = 100;

/// Options for [`Manager::create`](crate::Manager::create).
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerOptions {
    pub guild_id: String,
    pub text_channel: Option<String>,
    pub voice_channel: Option<String>,
    /// Identifier of the node to use. The least loaded node otherwise.
    pub node: Option<String>,
    pub volume: Option<i32>,
    pub self_mute: bool,
    pub self_deafen: bool,
}

impl PlayerOptions {
    pub fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            text_channel: None,
            voice_channel: None,
            node: None,
            volume: None,
            self_mute: false,
            self_deafen: false,
        }
    }

    pub fn voice_channel(mut self, channel: impl Into<String>) -> Self {
        self.voice_channel = Some(channel.into());
        self
    }

    pub fn text_channel(mut self, channel: impl Into<String>) -> Self {
        self.text_channel = Some(channel.into());
        self
    }

    pub fn node(mut self, identifier: impl Into<String>) -> Self {
        self.node = Some(identifier.into());
        self
    }

    pub fn volume(mut self, volume: i32) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn self_mute(mut self, mute: bool) -> Self {
        self.self_mute = mute;
        self
    }

    pub fn self_deafen(mut self, deafen: bool) -> Self {
        self.self_deafen = deafen;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_snowflake("guild_id", &self.guild_id)?;
        if let Some(channel) = &self.voice_channel {
            validate_snowflake("voice_channel", channel)?;
        }
        if let Some(channel) = &self.text_channel {
            validate_snowflake("text_channel", channel)?;
        }
        if matches!(self.node.as_deref(), Some("")) {
            return Err(Error::Validation("Node identifier must not be empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Connected,
    Connecting,
    Disconnected,
    Disconnecting,
    /// Terminal.
    Destroying,
}

/// Extra fields of a `play` operation. Times are in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayOptions {
    pub start_time: Option<u64>,
    pub end_time: Option<u64>,
    /// Keep the node's current track if one is already playing.
    pub no_replace: Option<bool>,
}

impl PlayOptions {
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.start_time, self.end_time) {
            if start >= end {
                return Err(Error::Validation(format!(
                    "start_time ({}) must be lower than end_time ({})",
                    start, end
                )));
            }
        }
        Ok(())
    }
}

/// What a `TrackEndEvent` did to the queue.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TrackEndOutcome {
    /// A new (or the same, when repeating) track is current and should be played.
    Advanced { ended: Option<Track> },
    /// Another `play` took over; the queue was left alone.
    Replaced { ended: Option<Track> },
    QueueEnd { ended: Option<Track> },
}

/// What a player needs from its manager, handed over at construction.
#[derive(Clone)]
pub(crate) struct PlayerContext {
    pub pool: NodePool,
    pub gateway: Arc<dyn GatewaySender>,
    pub events: EventSender,
    pub registry: Weak<DashMap<String, Player>>,
    pub searcher: Arc<dyn TrackSearcher>,
}

struct PlayerData {
    node: Option<Node>,
    state: PlayerState,
    destroyed: bool,
    voice_channel: Option<String>,
    text_channel: Option<String>,
    self_mute: bool,
    self_deafen: bool,
    volume: u16,
    equalizer: Equalizer,
    track_repeat: bool,
    queue_repeat: bool,
    playing: bool,
    paused: bool,
    /// Client-side estimate, in milliseconds.
    position: u64,
    queue: Queue,
    voice_state: VoiceState,
    voice_watch: bool,
    user_data: HashMap<String, Value>,
}

/// Playback session of one guild.
///
/// Handles are cheap to clone and all refer to the same session. Every
/// operation validates its input and sends to the node before touching the
/// local state, so a failed call leaves the player as it was.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

struct PlayerInner {
    guild_id: String,
    context: PlayerContext,
    data: RwLock<PlayerData>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.read();
        f.debug_struct("Player")
            .field("guild_id", &self.inner.guild_id)
            .field("state", &data.state)
            .field("node", &data.node.as_ref().map(Node::identifier))
            .field("voice_channel", &data.voice_channel)
            .field("queue", &data.queue.total_size())
            .finish()
    }
}

impl Player {
    pub(crate) fn new(options: PlayerOptions, node: Option<Node>, context: PlayerContext) -> Self {
        let volume = options
            .volume
            .map(|v| v.clamp(0, MAX_VOLUME) as u16)
            .unwrap_or(DEFAULT_VOLUME);

        Self {
            inner: Arc::new(PlayerInner {
                guild_id: options.guild_id,
                context,
                data: RwLock::new(PlayerData {
                    node,
                    state: PlayerState::Disconnected,
                    destroyed: false,
                    voice_channel: options.voice_channel,
                    text_channel: options.text_channel,
                    self_mute: options.self_mute,
                    self_deafen: options.self_deafen,
                    volume,
                    equalizer: Equalizer::new(),
                    track_repeat: false,
                    queue_repeat: false,
                    playing: false,
                    paused: false,
                    position: 0,
                    queue: Queue::new(),
                    voice_state: VoiceState::default(),
                    voice_watch: false,
                    user_data: HashMap::new(),
                }),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, PlayerData> {
        self.inner.data.read()
    }

    fn write(&self) -> RwLockWriteGuard<'_, PlayerData> {
        self.inner.data.write()
    }

    fn live(&self) -> Result<RwLockWriteGuard<'_, PlayerData>> {
        let data = self.write();
        if data.destroyed {
            return Err(Error::PlayerDestroyed(self.inner.guild_id.clone()));
        }
        Ok(data)
    }

    /// The assigned node, picking the least loaded one on first use.
    fn node_for(&self, data: &mut PlayerData) -> Result<Node> {
        if let Some(node) = &data.node {
            return Ok(node.clone());
        }

        let node = self
            .inner
            .context
            .pool
            .least_load()?
            .into_iter()
            .next()
            .ok_or(Error::NoAvailableNodes)?;

        info!("🎛️ Nodo '{}' asignado al player {}", node.identifier(), self.inner.guild_id);
        data.node = Some(node.clone());
        Ok(node)
    }

    fn dispatch(&self, data: &mut PlayerData, operation: Operation) -> Result<()> {
        self.node_for(data)?.send(&operation)
    }

    pub fn ptr_eq(&self, other: &Player) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn guild_id(&self) -> &str {
        &self.inner.guild_id
    }

    pub fn state(&self) -> PlayerState {
        self.read().state
    }

    pub fn node(&self) -> Option<Node> {
        self.read().node.clone()
    }

    pub fn voice_channel(&self) -> Option<String> {
        self.read().voice_channel.clone()
    }

    pub fn text_channel(&self) -> Option<String> {
        self.read().text_channel.clone()
    }

    pub fn volume(&self) -> u16 {
        self.read().volume
    }

    pub fn equalizer(&self) -> [f32; BAND_COUNT] {
        self.read().equalizer.gains()
    }

    pub fn track_repeat(&self) -> bool {
        self.read().track_repeat
    }

    pub fn queue_repeat(&self) -> bool {
        self.read().queue_repeat
    }

    pub fn playing(&self) -> bool {
        self.read().playing
    }

    pub fn paused(&self) -> bool {
        self.read().paused
    }

    pub fn position(&self) -> u64 {
        self.read().position
    }

    pub fn voice_state(&self) -> VoiceState {
        self.read().voice_state.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.read().destroyed
    }

    /// Snapshot of the queue.
    pub fn queue(&self) -> Queue {
        self.read().queue.clone()
    }

    /// Runs `f` with exclusive access to the queue.
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> R {
        f(&mut self.write().queue)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.write().user_data.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.read().user_data.get(key).cloned()
    }

    /// Sets the channel [`connect`](Self::connect) joins. Does not join it.
    pub fn set_voice_channel(&self, channel: impl Into<String>) -> Result<()> {
        let channel = channel.into();
        validate_snowflake("voice_channel", &channel)?;
        self.live()?.voice_channel = Some(channel);
        Ok(())
    }

    pub fn set_text_channel(&self, channel: impl Into<String>) -> Result<()> {
        let channel = channel.into();
        validate_snowflake("text_channel", &channel)?;
        self.live()?.text_channel = Some(channel);
        Ok(())
    }

    /// Asks the gateway to join the voice channel.
    ///
    /// Optimistic: the player counts as connected as soon as the request is
    /// handed to the gateway. The credentials arrive later through
    /// [`Manager::update_voice_state`](crate::Manager::update_voice_state).
    pub fn connect(&self) -> Result<()> {
        let payload = {
            let mut data = self.live()?;
            let channel = data
                .voice_channel
                .clone()
                .ok_or_else(|| Error::Validation("No voice channel has been set".into()))?;

            data.state = PlayerState::Connecting;
            voice_state_payload(&self.inner.guild_id, Some(&channel), data.self_mute, data.self_deafen)
        };

        self.inner.context.gateway.send(&self.inner.guild_id, payload);

        let mut data = self.write();
        if data.state == PlayerState::Connecting {
            data.state = PlayerState::Connected;
        }
        info!("🔊 Player {} conectándose al canal de voz", self.inner.guild_id);
        Ok(())
    }

    /// Leaves the voice channel. Does nothing if there is none.
    pub fn disconnect(&self) -> Result<()> {
        let payload = {
            let mut data = self.live()?;
            if data.voice_channel.is_none() {
                return Ok(());
            }

            data.state = PlayerState::Disconnecting;
            self.force_pause(&mut data);
            voice_state_payload(&self.inner.guild_id, None, data.self_mute, data.self_deafen)
        };

        self.inner.context.gateway.send(&self.inner.guild_id, payload);

        let mut data = self.write();
        data.voice_channel = None;
        data.state = PlayerState::Disconnected;
        info!("🔇 Player {} desconectado del canal de voz", self.inner.guild_id);
        Ok(())
    }

    /// Tears the player down and removes it from its manager. The handle
    /// rejects every later operation with [`Error::PlayerDestroyed`].
    pub fn destroy(&self, disconnect: bool) -> Result<()> {
        self.live()?.state = PlayerState::Destroying;

        if disconnect {
            self.disconnect()?;
        }

        let node = {
            let mut data = self.write();
            data.state = PlayerState::Destroying;
            data.destroyed = true;
            data.playing = false;
            data.node.clone()
        };

        if let Some(node) = node {
            let destroy = Operation::Destroy {
                guild_id: self.inner.guild_id.clone(),
            };
            if let Err(e) = node.send(&destroy) {
                debug!("No se pudo enviar destroy al nodo '{}': {}", node.identifier(), e);
            }
        }

        if let Some(registry) = self.inner.context.registry.upgrade() {
            registry.remove_if(&self.inner.guild_id, |_, player| player.ptr_eq(self));
        }

        self.inner.context.events.emit(ManagerEvent::PlayerDestroy {
            guild_id: self.inner.guild_id.clone(),
        });
        info!("🗑️ Player {} destruido", self.inner.guild_id);
        Ok(())
    }

    /// Plays `track`, or the current track when `None`.
    ///
    /// An unresolved track is searched first. If that fails a `TrackError`
    /// event is emitted and the next queued track is tried instead.
    pub async fn play(&self, track: Option<QueueTrack>, options: PlayOptions) -> Result<()> {
        options.validate()?;

        enum Step {
            Send(String),
            Resolve(UnresolvedTrack),
        }

        let mut next = track;
        // La siguiente pista solo sale de la cola cuando el nodo está disponible
        let mut advance = false;
        loop {
            let step = {
                let mut data = self.live()?;
                let node = self.node_for(&mut data)?;
                if !node.is_connected() {
                    return Err(Error::NodeNotConnected(node.identifier().to_string()));
                }

                if advance {
                    advance = false;
                    match data.queue.pop_front() {
                        Some(following) => data.queue.set_current(Some(following)),
                        None => {
                            data.queue.set_current(None);
                            data.playing = false;
                            return Ok(());
                        }
                    }
                } else if let Some(track) = next.take() {
                    data.queue.set_current(Some(track));
                }

                match data.queue.current() {
                    None => return Err(Error::NoCurrentTrack),
                    Some(QueueTrack::Resolved(track)) => Step::Send(track.track.clone()),
                    Some(QueueTrack::Unresolved(track)) => Step::Resolve(track.clone()),
                }
            };

            let unresolved = match step {
                Step::Send(encoded) => {
                    let mut data = self.live()?;
                    self.dispatch(
                        &mut data,
                        Operation::Play {
                            guild_id: self.inner.guild_id.clone(),
                            track: encoded,
                            start_time: options.start_time,
                            end_time: options.end_time,
                            no_replace: options.no_replace,
                        },
                    )?;
                    data.position = options.start_time.unwrap_or(0);
                    debug!("▶️ Player {}: play enviado", self.inner.guild_id);
                    return Ok(());
                }
                Step::Resolve(unresolved) => unresolved,
            };

            let expected = QueueTrack::Unresolved(unresolved.clone());

            match unresolved.resolve(self.inner.context.searcher.as_ref()).await {
                Ok(resolved) => {
                    self.live()?.queue.resolve_current(&expected, resolved);
                }
                Err(e) => {
                    warn!("❌ No se pudo resolver '{}': {}", expected.title(), e);
                    self.inner.context.events.emit(ManagerEvent::TrackError {
                        guild_id: self.inner.guild_id.clone(),
                        track: Some(expected.clone()),
                        error: e.to_string(),
                    });

                    let mut data = self.live()?;
                    if data.queue.front().is_none() {
                        data.queue.set_current(None);
                        data.playing = false;
                        return Ok(());
                    }
                    advance = true;
                }
            }
        }
    }

    /// Pauses or resumes. Does nothing if already in that state or if the
    /// queue is empty.
    pub fn pause(&self, pause: bool) -> Result<()> {
        let mut data = self.live()?;
        if data.paused == pause || data.queue.total_size() == 0 {
            return Ok(());
        }

        self.dispatch(
            &mut data,
            Operation::Pause {
                guild_id: self.inner.guild_id.clone(),
                pause,
            },
        )?;
        data.playing = !pause;
        data.paused = pause;
        Ok(())
    }

    /// Seeks within the current track, clamping into `[0, duration]`.
    /// Does nothing without a current track.
    pub fn seek(&self, position: i64) -> Result<()> {
        let mut data = self.live()?;
        let upper = match data.queue.current() {
            Some(track) => track.duration().unwrap_or(u64::MAX),
            None => return Ok(()),
        };

        let position = u64::try_from(position).unwrap_or(0).min(upper);
        self.dispatch(
            &mut data,
            Operation::Seek {
                guild_id: self.inner.guild_id.clone(),
                position,
            },
        )?;
        data.position = position;
        Ok(())
    }

    /// Stops the current track. With `count > 1`, also drops the next
    /// `count - 1` queued tracks first.
    pub fn stop(&self, count: Option<usize>) -> Result<()> {
        let count = count.unwrap_or(1);
        let mut data = self.live()?;

        if count > 1 && count > data.queue.len() {
            return Err(Error::Validation(format!(
                "Cannot skip {} tracks, the queue only has {}",
                count,
                data.queue.len()
            )));
        }

        self.dispatch(
            &mut data,
            Operation::Stop {
                guild_id: self.inner.guild_id.clone(),
            },
        )?;

        if count > 1 {
            data.queue.skip(count - 1);
        }
        Ok(())
    }

    /// Sets the volume, clamped into `0..=1000`.
    pub fn set_volume(&self, volume: i32) -> Result<()> {
        let volume = volume.clamp(0, MAX_VOLUME) as u16;
        let mut data = self.live()?;

        self.dispatch(
            &mut data,
            Operation::Volume {
                guild_id: self.inner.guild_id.clone(),
                volume,
            },
        )?;
        data.volume = volume;
        Ok(())
    }

    /// Overwrites the given bands and sends the whole equalizer.
    pub fn set_eq(&self, bands: &[EqualizerBand]) -> Result<()> {
        Equalizer::validate(bands)?;

        let mut data = self.live()?;
        let mut equalizer = data.equalizer.clone();
        equalizer.apply(bands)?;

        self.send_equalizer(&mut data, equalizer)
    }

    /// Same as [`set_eq`](Self::set_eq) for raw `{band, gain}` objects.
    pub fn set_eq_values(&self, bands: &[Value]) -> Result<()> {
        let bands = bands
            .iter()
            .map(EqualizerBand::from_value)
            .collect::<Result<Vec<_>>>()?;
        self.set_eq(&bands)
    }

    pub fn clear_eq(&self) -> Result<()> {
        let mut data = self.live()?;
        let mut equalizer = data.equalizer.clone();
        equalizer.reset();
        self.send_equalizer(&mut data, equalizer)
    }

    fn send_equalizer(&self, data: &mut PlayerData, equalizer: Equalizer) -> Result<()> {
        self.dispatch(
            data,
            Operation::Equalizer {
                guild_id: self.inner.guild_id.clone(),
                bands: equalizer.bands(),
            },
        )?;
        data.equalizer = equalizer;
        Ok(())
    }

    /// Repeats the current track. Turns queue repeat off.
    pub fn set_track_repeat(&self, repeat: bool) -> Result<()> {
        let mut data = self.live()?;
        data.track_repeat = repeat;
        data.queue_repeat = false;
        Ok(())
    }

    pub fn set_queue_repeat(&self, repeat: bool) -> Result<()> {
        let mut data = self.live()?;
        data.queue_repeat = repeat;
        data.track_repeat = false;
        Ok(())
    }

    /// Moves the player to another node. The old node gets a `destroy`, the
    /// new one the full voice state.
    pub fn move_node(&self, identifier: &str) -> Result<()> {
        let target = self
            .inner
            .context
            .pool
            .get(identifier)
            .ok_or_else(|| Error::NodeNotFound(identifier.to_string()))?;
        if !target.is_connected() {
            return Err(Error::NodeNotConnected(identifier.to_string()));
        }

        let mut data = self.live()?;
        if let Some(current) = &data.node {
            if current.ptr_eq(&target) {
                return Ok(());
            }

            let destroy = Operation::Destroy {
                guild_id: self.inner.guild_id.clone(),
            };
            if let Err(e) = current.send(&destroy) {
                debug!("Nodo anterior '{}' no disponible: {}", current.identifier(), e);
            }
        }

        if let Some(voice_update) = data.voice_state.to_operation() {
            target.send(&voice_update)?;
        }

        info!("🔀 Player {} movido al nodo '{}'", self.inner.guild_id, identifier);
        data.node = Some(target);
        Ok(())
    }

    fn force_pause(&self, data: &mut PlayerData) {
        if data.paused {
            return;
        }

        if data.queue.total_size() > 0 {
            if let Some(node) = &data.node {
                let pause = Operation::Pause {
                    guild_id: self.inner.guild_id.clone(),
                    pause: true,
                };
                if let Err(e) = node.send(&pause) {
                    debug!("Pausa no enviada para {}: {}", self.inner.guild_id, e);
                }
            }
        }

        data.playing = false;
        data.paused = true;
    }

    // Gateway y telemetría del nodo

    pub(crate) fn set_voice_server(&self, server: VoiceServer) {
        let mut data = self.write();
        data.voice_state.guild_id = Some(server.guild_id.clone());
        data.voice_state.event = Some(server);
    }

    /// Stores the session id. Returns the old and new channel when the bot
    /// was moved to a different channel.
    pub(crate) fn set_voice_session(
        &self,
        session_id: String,
        channel_id: String,
    ) -> Option<(Option<String>, String)> {
        let mut data = self.write();
        data.voice_state.session_id = Some(session_id);

        if data.voice_channel.as_deref() == Some(channel_id.as_str()) {
            return None;
        }

        let old = data.voice_channel.replace(channel_id.clone());
        Some((old, channel_id))
    }

    /// The bot left the channel without being asked to. Returns the channel it was in.
    pub(crate) fn voice_lost(&self) -> Option<String> {
        let mut data = self.write();
        let old = data.voice_channel.take();
        data.voice_state.clear();
        data.state = PlayerState::Disconnected;
        self.force_pause(&mut data);
        old
    }

    /// Sends the merged credentials once both halves are there. Returns
    /// whether they were sent.
    pub(crate) fn flush_voice_state(&self) -> Result<bool> {
        let mut data = self.live()?;
        let Some(voice_update) = data.voice_state.to_operation() else {
            return Ok(false);
        };

        self.dispatch(&mut data, voice_update)?;
        data.voice_watch = false;
        debug!("🎙️ Credenciales de voz enviadas para {}", self.inner.guild_id);
        Ok(true)
    }

    /// Returns `true` if no timeout watcher was running for the current
    /// partial credentials.
    pub(crate) fn arm_voice_watch(&self) -> bool {
        let mut data = self.write();
        if data.voice_watch || data.voice_state.is_complete() {
            return false;
        }
        data.voice_watch = true;
        true
    }

    /// Whether the credentials are still incomplete once the watcher fires.
    pub(crate) fn voice_watch_expired(&self) -> bool {
        let mut data = self.write();
        let pending = data.voice_watch && !data.destroyed && !data.voice_state.is_complete();
        data.voice_watch = false;
        pending
    }

    pub(crate) fn update_position(&self, position: u64) {
        self.write().position = position;
    }

    pub(crate) fn current_track(&self) -> Option<Track> {
        self.read()
            .queue
            .current()
            .and_then(QueueTrack::as_resolved)
            .cloned()
    }

    pub(crate) fn on_track_start(&self) -> Option<Track> {
        let mut data = self.write();
        data.playing = true;
        data.paused = false;
        data.queue.current().and_then(QueueTrack::as_resolved).cloned()
    }

    pub(crate) fn on_track_end(&self, reason: TrackEndReason) -> TrackEndOutcome {
        let mut data = self.write();
        let ended = data.queue.current().and_then(QueueTrack::as_resolved).cloned();

        let advanced = match reason {
            TrackEndReason::Replaced => return TrackEndOutcome::Replaced { ended },
            TrackEndReason::LoadFailed | TrackEndReason::Cleanup => data.queue.advance(),
            TrackEndReason::Stopped => data.queue.advance(),
            _ if data.track_repeat => data.queue.current().is_some(),
            _ if data.queue_repeat => {
                if let Some(current) = data.queue.current().cloned() {
                    data.queue.add(current);
                }
                data.queue.advance()
            }
            _ => data.queue.advance(),
        };

        if advanced {
            TrackEndOutcome::Advanced { ended }
        } else {
            data.playing = false;
            TrackEndOutcome::QueueEnd { ended }
        }
    }

    /// Stuck or failing tracks are stopped so the node moves on.
    pub(crate) fn stop_after_failure(&self) {
        if let Err(e) = self.stop(None) {
            warn!("No se pudo detener el player {}: {}", self.inner.guild_id, e);
        }
    }
}
