use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, trace, warn};

use crate::audio::player::{PlayOptions, Player, PlayerContext, PlayerOptions, TrackEndOutcome};
use crate::audio::track::{QueueTrack, SearchResult, TrackData, TrackInfo, TrackSearcher};
use crate::config::{ManagerOptions, NodeOptions};
use crate::error::{validate_snowflake, Error, Result};
use crate::events::{EventReceiver, EventSender, ManagerEvent};
use crate::gateway::GatewaySender;
use crate::nodes::{
    Handshake, LavalinkTransport, Node, NodeHandler, NodeMessage, NodePool, TrackEvent, Transport,
};
use crate::search::TrackLoader;
use crate::voice::VoicePacket;

/// Owns the nodes and the per-guild players, and routes what the nodes and
/// the gateway report to the right player.
///
/// Cloning is cheap; every clone drives the same manager.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    options: ManagerOptions,
    transport: Arc<dyn Transport>,
    pool: NodePool,
    players: Arc<DashMap<String, Player>>,
    gateway: Arc<dyn GatewaySender>,
    events: EventSender,
    loader: TrackLoader,
    searcher: Arc<dyn TrackSearcher>,
    client_id: RwLock<Option<String>>,
    initiated: AtomicBool,
}

/// Node handler installed on every node of a manager.
struct Router {
    manager: Weak<ManagerInner>,
}

impl NodeHandler for Router {
    fn handle(&self, node: &Node, message: NodeMessage) {
        if let Some(inner) = self.manager.upgrade() {
            Manager { inner }.on_node_message(node, message);
        }
    }
}

impl Manager {
    /// Builds a manager that talks to the nodes over WebSocket and HTTP.
    pub fn new(options: ManagerOptions, gateway: impl GatewaySender) -> Result<(Self, EventReceiver)> {
        Self::with_transport(options, gateway, Arc::new(LavalinkTransport::new()?))
    }

    pub fn with_transport(
        options: ManagerOptions,
        gateway: impl GatewaySender,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, EventReceiver)> {
        options.validate()?;

        let (events, receiver) = EventSender::channel();
        let pool = NodePool::new();
        let loader = TrackLoader::new(pool.clone(), options.default_search_platform);
        let nodes = options.nodes.clone();

        let manager = Self {
            inner: Arc::new(ManagerInner {
                client_id: RwLock::new(options.client_id.clone()),
                options,
                transport,
                pool,
                players: Arc::new(DashMap::new()),
                gateway: Arc::new(gateway),
                events,
                searcher: Arc::new(loader.clone()),
                loader,
                initiated: AtomicBool::new(false),
            }),
        };

        for node in nodes {
            manager.create_node(node)?;
        }

        Ok((manager, receiver))
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.client_id.read().clone()
    }

    pub fn is_initiated(&self) -> bool {
        self.inner.initiated.load(Ordering::Acquire)
    }

    /// Stores the bot's user id and connects every registered node.
    /// Calling it again does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init(&self, client_id: impl Into<String>) -> Result<()> {
        let client_id = client_id.into();
        validate_snowflake("client_id", &client_id)?;

        if self.inner.initiated.swap(true, Ordering::AcqRel) {
            debug!("Manager ya inicializado");
            return Ok(());
        }

        *self.inner.client_id.write() = Some(client_id.clone());
        info!("🚀 Manager inicializado para el cliente {}", client_id);

        let handshake = self.handshake(client_id);
        for node in self.inner.pool.all() {
            node.connect(handshake.clone());
        }
        Ok(())
    }

    fn handshake(&self, user_id: String) -> Handshake {
        Handshake {
            user_id,
            shards: self.inner.options.shards,
            client_name: self.inner.options.client_name.clone(),
        }
    }

    // Nodos

    /// Registers a node, or returns the existing one with the same
    /// identifier. Connects it right away if the manager is initiated.
    pub fn create_node(&self, options: NodeOptions) -> Result<Node> {
        options.validate()?;
        let identifier = options.identifier.clone();

        let router = Arc::new(Router {
            manager: Arc::downgrade(&self.inner),
        });
        let transport = self.inner.transport.clone();
        let (node, created) = self
            .inner
            .pool
            .get_or_insert_with(&identifier, || Node::new(options, transport, router));

        if !created {
            debug!("Nodo '{}' ya registrado", identifier);
            return Ok(node);
        }

        info!("➕ Nodo '{}' registrado", identifier);
        self.inner.events.emit(ManagerEvent::NodeCreate {
            node: identifier,
        });

        if self.is_initiated() {
            if let Some(client_id) = self.client_id() {
                node.connect(self.handshake(client_id));
            }
        }

        Ok(node)
    }

    /// Closes a node for good. Players assigned to it are destroyed.
    pub fn destroy_node(&self, identifier: &str) -> Result<()> {
        let node = self
            .inner
            .pool
            .remove(identifier)
            .ok_or_else(|| Error::NodeNotFound(identifier.to_string()))?;

        node.destroy();

        let orphans: Vec<Player> = self
            .players()
            .into_iter()
            .filter(|p| p.node().is_some_and(|n| n.ptr_eq(&node)))
            .collect();
        for player in orphans {
            if let Err(e) = player.destroy(true) {
                debug!("Player {} ya destruido: {}", player.guild_id(), e);
            }
        }

        self.inner.events.emit(ManagerEvent::NodeDestroy {
            node: identifier.to_string(),
        });
        Ok(())
    }

    pub fn node(&self, identifier: &str) -> Option<Node> {
        self.inner.pool.get(identifier)
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.inner.pool.all()
    }

    /// Connected nodes, fewest REST calls first.
    pub fn least_used_nodes(&self) -> Result<Vec<Node>> {
        self.inner.pool.least_used()
    }

    /// Connected nodes, lowest CPU load first.
    pub fn least_load_nodes(&self) -> Result<Vec<Node>> {
        self.inner.pool.least_load()
    }

    // Players

    /// Returns the guild's player, creating it if needed. An existing player
    /// is returned untouched, whatever the options say.
    pub fn create(&self, options: PlayerOptions) -> Result<Player> {
        options.validate()?;

        if let Some(player) = self.get(&options.guild_id) {
            return Ok(player);
        }

        let node = match options.node.as_deref() {
            Some(identifier) => Some(
                self.node(identifier)
                    .ok_or_else(|| Error::NodeNotFound(identifier.to_string()))?,
            ),
            None => self
                .inner
                .pool
                .least_load()
                .ok()
                .and_then(|nodes| nodes.into_iter().next()),
        };

        let guild_id = options.guild_id.clone();
        let player = match self.inner.players.entry(guild_id.clone()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let player = Player::new(options, node, self.player_context());
                slot.insert(player.clone());
                player
            }
        };

        info!("🎵 Player creado para guild {}", guild_id);
        self.inner.events.emit(ManagerEvent::PlayerCreate { guild_id });
        Ok(player)
    }

    fn player_context(&self) -> PlayerContext {
        PlayerContext {
            pool: self.inner.pool.clone(),
            gateway: self.inner.gateway.clone(),
            events: self.inner.events.clone(),
            registry: Arc::downgrade(&self.inner.players),
            searcher: self.inner.searcher.clone(),
        }
    }

    pub fn get(&self, guild_id: &str) -> Option<Player> {
        self.inner.players.get(guild_id).map(|p| p.value().clone())
    }

    pub fn players(&self) -> Vec<Player> {
        self.inner.players.iter().map(|p| p.value().clone()).collect()
    }

    /// Destroys the guild's player, leaving its voice channel.
    pub fn destroy(&self, guild_id: &str) -> Result<()> {
        match self.get(guild_id) {
            Some(player) => player.destroy(true),
            None => Ok(()),
        }
    }

    /// Destroys every player and node.
    pub fn shutdown(&self) {
        for player in self.players() {
            if let Err(e) = player.destroy(true) {
                debug!("Player {} ya destruido: {}", player.guild_id(), e);
            }
        }

        for node in self.nodes() {
            if let Err(e) = self.destroy_node(node.identifier()) {
                debug!("Nodo '{}': {}", node.identifier(), e);
            }
        }
        info!("👋 Manager detenido");
    }

    // Búsqueda

    /// Loads tracks for a query or URL on the least used node.
    pub async fn search(&self, query: &str, requester: Option<Value>) -> Result<SearchResult> {
        self.inner.loader.search(query, requester).await
    }

    pub async fn decode_tracks(&self, tracks: &[String]) -> Result<Vec<TrackData>> {
        self.inner.loader.decode_tracks(tracks).await
    }

    pub async fn decode_track(&self, track: &str) -> Result<TrackInfo> {
        self.inner.loader.decode_track(track).await
    }

    // Voz

    /// Feeds a raw gateway dispatch. Anything that is not a voice update is
    /// ignored.
    pub fn handle_gateway_payload(&self, raw: &Value) -> Result<bool> {
        match VoicePacket::from_gateway(raw)? {
            Some(packet) => self.update_voice_state(packet),
            None => Ok(false),
        }
    }

    /// Merges one half of a player's voice credentials. Returns whether the
    /// complete record was sent to the player's node.
    ///
    /// The two halves may arrive in any order. State updates about other
    /// users are ignored.
    pub fn update_voice_state(&self, packet: VoicePacket) -> Result<bool> {
        let Some(player) = self.get(packet.guild_id()) else {
            trace!("Actualización de voz para guild sin player: {}", packet.guild_id());
            return Ok(false);
        };

        match packet {
            VoicePacket::Server(server) => player.set_voice_server(server),
            VoicePacket::State(state) => {
                if self.client_id().as_deref() != Some(state.user_id.as_str()) {
                    return Ok(false);
                }

                match state.channel_id {
                    None => {
                        let old_channel = player.voice_lost();
                        warn!("🔌 Player {} desconectado externamente", player.guild_id());
                        self.inner.events.emit(ManagerEvent::PlayerDisconnect {
                            guild_id: player.guild_id().to_string(),
                            old_channel,
                        });
                        return Ok(false);
                    }
                    Some(channel) => {
                        if let Some((old_channel, new_channel)) =
                            player.set_voice_session(state.session_id, channel)
                        {
                            self.inner.events.emit(ManagerEvent::PlayerMove {
                                guild_id: player.guild_id().to_string(),
                                old_channel,
                                new_channel: Some(new_channel),
                            });
                        }
                    }
                }
            }
        }

        if player.flush_voice_state()? {
            return Ok(true);
        }

        self.watch_voice_state(&player);
        Ok(false)
    }

    fn watch_voice_state(&self, player: &Player) {
        let Some(timeout) = self.inner.options.voice_update_timeout else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("Sin runtime: no se vigilan las credenciales de {}", player.guild_id());
            return;
        };
        if !player.arm_voice_watch() {
            return;
        }

        let player = player.clone();
        let events = self.inner.events.clone();
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if player.voice_watch_expired() {
                warn!("⏱️ Credenciales de voz incompletas para {} tras {:?}", player.guild_id(), timeout);
                events.emit(ManagerEvent::VoiceUpdateTimeout {
                    guild_id: player.guild_id().to_string(),
                });
            }
        });
    }

    // Mensajes de los nodos

    fn on_node_message(&self, node: &Node, message: NodeMessage) {
        let id = node.identifier().to_string();
        let events = &self.inner.events;

        match message {
            NodeMessage::Connected => events.emit(ManagerEvent::NodeConnect { node: id }),
            NodeMessage::Reconnecting { attempt } => {
                events.emit(ManagerEvent::NodeReconnect { node: id, attempt })
            }
            NodeMessage::Disconnected {
                code,
                reason,
                terminal,
            } => {
                events.emit(ManagerEvent::NodeDisconnect {
                    node: id.clone(),
                    code,
                    reason,
                    terminal,
                });

                let registered = self.inner.pool.get(&id).is_some_and(|n| n.ptr_eq(node));
                if terminal && registered {
                    error!("💀 Nodo '{}' eliminado tras agotar los reintentos", id);
                    self.inner.pool.remove(&id);
                    events.emit(ManagerEvent::NodeDestroy { node: id });
                }
            }
            NodeMessage::Error(error) => events.emit(ManagerEvent::NodeError { node: id, error }),
            NodeMessage::Raw(payload) => events.emit(ManagerEvent::NodeRaw { node: id, payload }),
            NodeMessage::Stats(stats) => {
                trace!("[{}] stats: {} players, carga {:.1}%", id, stats.players, stats.load())
            }
            NodeMessage::PlayerUpdate { guild_id, state } => {
                if let Some(player) = self.get(&guild_id) {
                    player.update_position(state.position);
                }
            }
            NodeMessage::Event(event) => self.on_track_event(event),
        }
    }

    fn on_track_event(&self, event: TrackEvent) {
        let Some(player) = self.get(event.guild_id()) else {
            debug!("Evento para guild sin player: {}", event.guild_id());
            return;
        };
        let guild_id = player.guild_id().to_string();
        let events = &self.inner.events;

        match event {
            TrackEvent::Start { .. } => {
                let track = player.on_track_start();
                events.emit(ManagerEvent::TrackStart { guild_id, track });
            }
            TrackEvent::End { reason, .. } => match player.on_track_end(reason) {
                TrackEndOutcome::Replaced { ended } => {
                    events.emit(ManagerEvent::TrackEnd {
                        guild_id,
                        track: ended,
                        reason,
                    });
                }
                TrackEndOutcome::Advanced { ended } => {
                    events.emit(ManagerEvent::TrackEnd {
                        guild_id,
                        track: ended,
                        reason,
                    });
                    if self.inner.options.auto_play {
                        self.play_next(player);
                    }
                }
                TrackEndOutcome::QueueEnd { ended } => {
                    info!("📭 Cola terminada en guild {}", guild_id);
                    events.emit(ManagerEvent::QueueEnd {
                        guild_id,
                        track: ended,
                    });
                }
            },
            TrackEvent::Stuck { threshold_ms, .. } => {
                let track = player.current_track();
                player.stop_after_failure();
                events.emit(ManagerEvent::TrackStuck {
                    guild_id,
                    track,
                    threshold_ms,
                });
            }
            TrackEvent::Exception {
                exception, error, ..
            } => {
                let track = player.current_track();
                player.stop_after_failure();

                let error = exception
                    .and_then(|e| e.message)
                    .or(error)
                    .unwrap_or_else(|| "Unknown track exception".to_string());
                events.emit(ManagerEvent::TrackError {
                    guild_id,
                    track: track.map(QueueTrack::Resolved),
                    error,
                });
            }
            TrackEvent::WebSocketClosed {
                code,
                reason,
                by_remote,
                ..
            } => {
                warn!("🔌 Socket de voz cerrado en guild {} ({}): {}", guild_id, code, reason);
                events.emit(ManagerEvent::SocketClosed {
                    guild_id,
                    code,
                    reason,
                    by_remote,
                });
            }
        }
    }

    fn play_next(&self, player: Player) {
        tokio::spawn(async move {
            if let Err(e) = player.play(None, PlayOptions::default()).await {
                warn!("No se pudo reproducir el siguiente track en {}: {}", player.guild_id(), e);
            }
        });
    }
}
