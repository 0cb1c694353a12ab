use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::protocol::{NodeStats, Operation, PlayerUpdate, TrackEvent};
use super::transport::{Handshake, RestRequest, SocketEvent, Transport};
use super::{NodeHandler, NodeMessage};
use crate::config::NodeOptions;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: the node never reconnects from here.
    Destroyed,
}

/// A connection to one Lavalink server.
///
/// Cheap to clone; every clone refers to the same connection.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    options: NodeOptions,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn NodeHandler>,
    status: RwLock<NodeStatus>,
    stats: RwLock<NodeStats>,
    /// REST requests issued, counted before their response arrives.
    calls: AtomicU64,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("identifier", &self.inner.options.identifier)
            .field("status", &self.status())
            .field("calls", &self.calls())
            .finish()
    }
}

impl Node {
    pub fn new(
        options: NodeOptions,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn NodeHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                options,
                transport,
                handler,
                status: RwLock::new(NodeStatus::Disconnected),
                stats: RwLock::new(NodeStats::default()),
                calls: AtomicU64::new(0),
                outgoing: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.inner.options.identifier
    }

    pub fn options(&self) -> &NodeOptions {
        &self.inner.options
    }

    pub fn status(&self) -> NodeStatus {
        *self.inner.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == NodeStatus::Connected
    }

    pub fn calls(&self) -> u64 {
        self.inner.calls.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> NodeStats {
        self.inner.stats.read().clone()
    }

    /// CPU load in percent, 0 while no stats have been received.
    pub fn load(&self) -> f64 {
        self.inner.stats.read().load()
    }

    /// Whether both handles point at the same connection.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Starts the connection task. Does nothing unless the node is disconnected.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self, handshake: Handshake) {
        {
            let mut status = self.inner.status.write();
            if *status != NodeStatus::Disconnected {
                debug!("Nodo '{}' ya está en estado {:?}", self.identifier(), *status);
                return;
            }
            *status = NodeStatus::Connecting;
        }

        info!("🔗 Conectando al nodo '{}' ({})", self.identifier(), self.inner.options.socket_url());

        let node = self.clone();
        tokio::spawn(async move { node.run(handshake).await });
    }

    /// Closes the socket for good. No reconnect is attempted afterwards.
    pub fn destroy(&self) {
        {
            let mut status = self.inner.status.write();
            if *status == NodeStatus::Destroyed {
                return;
            }
            *status = NodeStatus::Destroyed;
        }

        self.inner.shutdown.cancel();
        self.inner.outgoing.lock().take();
        info!("🗑️ Nodo '{}' destruido", self.identifier());
    }

    /// Writes an operation to the persistent socket. Nothing is awaited.
    pub fn send(&self, operation: &Operation) -> Result<()> {
        let payload = serde_json::to_string(operation)?;

        let outgoing = self.inner.outgoing.lock();
        match outgoing.as_ref() {
            Some(tx) if self.is_connected() => {
                tx.send(payload)
                    .map_err(|_| Error::NodeNotConnected(self.identifier().to_string()))?;
                trace!("[{}] Operación enviada para guild {}", self.identifier(), operation.guild_id());
                Ok(())
            }
            _ => Err(Error::NodeNotConnected(self.identifier().to_string())),
        }
    }

    /// Issues a REST request, failing with [`Error::Timeout`] past the
    /// configured deadline. Failures are not retried.
    pub async fn request(&self, request: RestRequest) -> Result<Value> {
        self.inner.calls.fetch_add(1, Ordering::Relaxed);

        let timeout = self.inner.options.request_timeout;
        debug!("[{}] {} {}", self.identifier(), request.method, request.path);

        match tokio::time::timeout(
            timeout,
            self.inner.transport.request(&self.inner.options, request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("[{}] Petición sin respuesta tras {:?}", self.identifier(), timeout);
                Err(Error::Timeout(timeout))
            }
        }
    }

    /// GET `path`, letting the caller adjust method, body or headers first.
    pub async fn request_with<F>(&self, path: &str, modify: F) -> Result<Value>
    where
        F: FnOnce(RestRequest) -> RestRequest,
    {
        self.request(modify(RestRequest::get(path))).await
    }

    pub(crate) fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.inner
            .options
            .retry_delay
            .saturating_mul(factor)
            .min(self.inner.options.max_retry_delay)
    }

    async fn run(self, handshake: Handshake) {
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                result = self.inner.transport.connect(&self.inner.options, &handshake) => result,
            };

            match connected {
                Ok(connection) => {
                    attempt = 0;
                    self.open(connection.outgoing);

                    match self.read_loop(connection.incoming).await {
                        Some((code, reason)) => self.closed(code, reason),
                        None => return,
                    }
                }
                Err(e) => {
                    warn!("❌ No se pudo conectar al nodo '{}': {}", self.identifier(), e);
                    self.emit(NodeMessage::Error(e.to_string()));
                }
            }

            if self.inner.shutdown.is_cancelled() {
                return;
            }

            attempt += 1;
            let retries = self.inner.options.retry_amount;
            if attempt > retries {
                error!("Nodo '{}': sin conexión tras {} intentos", self.identifier(), retries);
                self.emit(NodeMessage::Error(format!(
                    "Unable to connect after {} attempts",
                    retries
                )));
                self.emit(NodeMessage::Disconnected {
                    code: None,
                    reason: "reconnect attempts exhausted".to_string(),
                    terminal: true,
                });
                self.destroy();
                return;
            }

            let delay = self.reconnect_delay(attempt);
            {
                let mut status = self.inner.status.write();
                if *status == NodeStatus::Destroyed {
                    return;
                }
                *status = NodeStatus::Connecting;
            }

            info!(
                "🔄 Reconectando nodo '{}' (intento {}/{}) en {:?}",
                self.identifier(),
                attempt,
                retries,
                delay
            );
            self.emit(NodeMessage::Reconnecting { attempt });

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn open(&self, outgoing: mpsc::UnboundedSender<String>) {
        *self.inner.outgoing.lock() = Some(outgoing);
        {
            let mut status = self.inner.status.write();
            if *status == NodeStatus::Destroyed {
                return;
            }
            *status = NodeStatus::Connected;
        }

        info!("✅ Nodo '{}' conectado", self.identifier());
        self.emit(NodeMessage::Connected);
    }

    fn closed(&self, code: Option<u16>, reason: String) {
        self.inner.outgoing.lock().take();
        {
            let mut status = self.inner.status.write();
            if *status == NodeStatus::Destroyed {
                return;
            }
            *status = NodeStatus::Disconnected;
        }

        warn!("⚠️ Nodo '{}' desconectado ({:?}): {}", self.identifier(), code, reason);
        self.emit(NodeMessage::Disconnected {
            code,
            reason,
            terminal: false,
        });
    }

    /// Returns the close code and reason, or `None` if the node was destroyed.
    async fn read_loop(
        &self,
        mut incoming: mpsc::UnboundedReceiver<SocketEvent>,
    ) -> Option<(Option<u16>, String)> {
        loop {
            let event = tokio::select! {
                _ = self.inner.shutdown.cancelled() => return None,
                event = incoming.recv() => event,
            };

            match event {
                Some(SocketEvent::Message(payload)) => self.handle_payload(payload),
                Some(SocketEvent::Closed { code, reason }) => return Some((code, reason)),
                None => return Some((None, "connection dropped".to_string())),
            }
        }
    }

    fn handle_payload(&self, payload: Value) {
        self.emit(NodeMessage::Raw(payload.clone()));

        let op = payload.get("op").and_then(Value::as_str).map(str::to_owned);
        match op.as_deref() {
            Some("stats") => match serde_json::from_value::<NodeStats>(payload) {
                Ok(stats) => {
                    *self.inner.stats.write() = stats.clone();
                    self.emit(NodeMessage::Stats(stats));
                }
                Err(e) => warn!("[{}] Stats inválidas: {}", self.identifier(), e),
            },
            Some("playerUpdate") => match serde_json::from_value::<PlayerUpdate>(payload) {
                Ok(update) => self.emit(NodeMessage::PlayerUpdate {
                    guild_id: update.guild_id,
                    state: update.state,
                }),
                Err(e) => warn!("[{}] playerUpdate inválido: {}", self.identifier(), e),
            },
            Some("event") => match serde_json::from_value::<TrackEvent>(payload) {
                Ok(event) => self.emit(NodeMessage::Event(event)),
                Err(e) => warn!("[{}] Evento desconocido: {}", self.identifier(), e),
            },
            other => debug!("[{}] Opcode no manejado: {:?}", self.identifier(), other),
        }
    }

    fn emit(&self, message: NodeMessage) {
        self.inner.handler.handle(self, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{connected_node, handshake, node_options, wait_until, MockTransport, RecordingHandler};
    use crate::nodes::protocol::TrackEndReason;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_reconnect_delay_is_capped_exponential() {
        let mut options = node_options("main");
        options.retry_delay = Duration::from_millis(100);
        options.max_retry_delay = Duration::from_millis(350);

        let node = Node::new(options, Arc::new(MockTransport::new()), Arc::new(RecordingHandler::default()));
        assert_eq!(node.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(node.reconnect_delay(2), Duration::from_millis(200));
        assert_eq!(node.reconnect_delay(3), Duration::from_millis(350));
        assert_eq!(node.reconnect_delay(40), Duration::from_millis(350));
    }

    #[test]
    fn test_send_fails_while_disconnected() {
        let node = Node::new(
            node_options("main"),
            Arc::new(MockTransport::new()),
            Arc::new(RecordingHandler::default()),
        );

        let err = node
            .send(&Operation::Stop { guild_id: "1".into() })
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotConnected(id) if id == "main"));
    }

    #[tokio::test]
    async fn test_operations_are_written_in_order() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let node = connected_node(&transport, "main", handler.clone()).await;

        node.send(&Operation::Pause { guild_id: "1".into(), pause: true }).unwrap();
        node.send(&Operation::Stop { guild_id: "1".into() }).unwrap();

        let ops: Vec<Value> = transport.sent("main").into_iter().map(|v| v["op"].clone()).collect();
        assert_eq!(ops, vec![json!("pause"), json!("stop")]);
        assert_eq!(handler.messages().first(), Some(&NodeMessage::Connected));
    }

    #[tokio::test]
    async fn test_inbound_messages_are_demultiplexed() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let node = connected_node(&transport, "main", handler.clone()).await;

        transport.push("main", json!({
            "op": "stats", "players": 2, "playingPlayers": 1, "uptime": 10,
            "memory": { "free": 0, "used": 0, "allocated": 0, "reservable": 0 },
            "cpu": { "cores": 2, "systemLoad": 0.5, "lavalinkLoad": 0.2 }
        }));
        transport.push("main", json!({
            "op": "playerUpdate", "guildId": "1", "state": { "time": 5, "position": 1500 }
        }));
        transport.push("main", json!({
            "op": "event", "type": "TrackEndEvent", "guildId": "1", "track": "QA", "reason": "FINISHED"
        }));

        wait_until(|| handler.messages().iter().any(|m| matches!(m, NodeMessage::Event(_)))).await;

        assert!((node.load() - 25.0).abs() < 1e-9);
        let messages = handler.messages();
        assert!(messages.contains(&NodeMessage::PlayerUpdate {
            guild_id: "1".into(),
            state: crate::nodes::PlayerUpdateState { time: 5, position: 1500 },
        }));
        assert!(messages.contains(&NodeMessage::Event(TrackEvent::End {
            guild_id: "1".into(),
            track: Some("QA".into()),
            reason: TrackEndReason::Finished,
        })));
        assert_eq!(
            messages.iter().filter(|m| matches!(m, NodeMessage::Raw(_))).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let node = connected_node(&transport, "main", handler.clone()).await;

        transport.close("main", 1006);
        wait_until(|| transport.connects("main") == 2 && node.is_connected()).await;

        let messages = handler.messages();
        assert!(messages.contains(&NodeMessage::Disconnected {
            code: Some(1006),
            reason: "closed by test".into(),
            terminal: false,
        }));
        assert!(messages.contains(&NodeMessage::Reconnecting { attempt: 1 }));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_terminal() {
        let transport = MockTransport::new();
        transport.refuse("main");
        let handler = Arc::new(RecordingHandler::default());

        let node = Node::new(node_options("main"), Arc::new(transport.clone()), handler.clone());
        node.connect(handshake());

        wait_until(|| node.status() == NodeStatus::Destroyed).await;

        let messages = handler.messages();
        let reconnects = messages
            .iter()
            .filter(|m| matches!(m, NodeMessage::Reconnecting { .. }))
            .count();
        assert_eq!(reconnects as u32, node.options().retry_amount);
        assert!(matches!(
            messages.last(),
            Some(NodeMessage::Disconnected { terminal: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_destroy_stops_reconnecting() {
        let transport = MockTransport::new();
        let handler = Arc::new(RecordingHandler::default());
        let node = connected_node(&transport, "main", handler.clone()).await;

        node.destroy();
        transport.close("main", 1000);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(node.status(), NodeStatus::Destroyed);
        assert_eq!(transport.connects("main"), 1);
        assert!(node.send(&Operation::Stop { guild_id: "1".into() }).is_err());
    }

    #[tokio::test]
    async fn test_request_counts_calls_and_times_out() {
        let transport = MockTransport::new();
        let node = Node::new(
            node_options("main"),
            Arc::new(transport.clone()),
            Arc::new(RecordingHandler::default()),
        );

        transport.respond_with(json!({ "ok": true }));
        let body = node
            .request_with("/decodetracks", |req| req.body(json!(["QA"])))
            .await
            .unwrap();
        assert_eq!(body, json!({ "ok": true }));
        assert_eq!(node.calls(), 1);

        let (_, request) = transport.requests().pop().unwrap();
        assert_eq!(request.path, "/decodetracks");
        assert_eq!(request.body, Some(json!(["QA"])));

        transport.hang_requests();
        let err = node.request(RestRequest::get("/loadtracks")).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(node.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_request_is_counted_once() {
        let transport = MockTransport::new();
        let node = Node::new(
            node_options("main"),
            Arc::new(transport.clone()),
            Arc::new(RecordingHandler::default()),
        );

        transport.fail_requests();
        let err = node.request(RestRequest::get("/loadtracks")).await.unwrap_err();
        assert!(matches!(err, Error::Http { status: 500, .. }));
        assert_eq!(node.calls(), 1);
        assert_eq!(transport.requests().len(), 1);
    }
}
