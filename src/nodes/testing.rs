//! In-memory transport and helpers shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::transport::{Connection, Handshake, RestRequest, SocketEvent, Transport};
use super::{Node, NodeHandler, NodeMessage};
use crate::config::NodeOptions;
use crate::error::{Error, Result};

struct MockSocket {
    outgoing: mpsc::UnboundedReceiver<String>,
    incoming: mpsc::UnboundedSender<SocketEvent>,
    sent: Vec<Value>,
    connects: u32,
}

impl MockSocket {
    fn drain(&mut self) {
        while let Ok(text) = self.outgoing.try_recv() {
            let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
            self.sent.push(value);
        }
    }
}

#[derive(Default)]
struct MockState {
    sockets: HashMap<String, MockSocket>,
    refused: HashSet<String>,
    responses: VecDeque<Value>,
    requests: Vec<(String, RestRequest)>,
    hang_requests: bool,
    fail_requests: bool,
}

/// Transport that keeps every socket in memory.
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every connection attempt of `id` fail.
    pub fn refuse(&self, id: &str) {
        self.state.lock().refused.insert(id.to_string());
    }

    /// Delivers a payload as if the node had sent it.
    pub fn push(&self, id: &str, payload: Value) {
        if let Some(socket) = self.state.lock().sockets.get(id) {
            let _ = socket.incoming.send(SocketEvent::Message(payload));
        }
    }

    pub fn close(&self, id: &str, code: u16) {
        if let Some(socket) = self.state.lock().sockets.get(id) {
            let _ = socket.incoming.send(SocketEvent::Closed {
                code: Some(code),
                reason: "closed by test".to_string(),
            });
        }
    }

    /// Every payload written to `id` so far, across reconnects.
    pub fn sent(&self, id: &str) -> Vec<Value> {
        let mut state = self.state.lock();
        match state.sockets.get_mut(id) {
            Some(socket) => {
                socket.drain();
                socket.sent.clone()
            }
            None => Vec::new(),
        }
    }

    pub fn sent_ops(&self, id: &str, op: &str) -> Vec<Value> {
        self.sent(id)
            .into_iter()
            .filter(|payload| payload["op"] == op)
            .collect()
    }

    pub fn connects(&self, id: &str) -> u32 {
        self.state.lock().sockets.get(id).map_or(0, |s| s.connects)
    }

    pub fn respond_with(&self, body: Value) {
        self.state.lock().responses.push_back(body);
    }

    pub fn hang_requests(&self) {
        self.state.lock().hang_requests = true;
    }

    /// Every later request answers with HTTP 500.
    pub fn fail_requests(&self) {
        self.state.lock().fail_requests = true;
    }

    pub fn requests(&self) -> Vec<(String, RestRequest)> {
        self.state.lock().requests.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, options: &NodeOptions, _handshake: &Handshake) -> Result<Connection> {
        let mut state = self.state.lock();
        if state.refused.contains(&options.identifier) {
            return Err(Error::Http {
                status: 503,
                body: "refused by test".to_string(),
            });
        }

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        match state.sockets.get_mut(&options.identifier) {
            Some(socket) => {
                socket.drain();
                socket.outgoing = outgoing_rx;
                socket.incoming = incoming_tx;
                socket.connects += 1;
            }
            None => {
                state.sockets.insert(
                    options.identifier.clone(),
                    MockSocket {
                        outgoing: outgoing_rx,
                        incoming: incoming_tx,
                        sent: Vec::new(),
                        connects: 1,
                    },
                );
            }
        }

        Ok(Connection { outgoing, incoming })
    }

    async fn request(&self, options: &NodeOptions, request: RestRequest) -> Result<Value> {
        let (hang, fail, response) = {
            let mut state = self.state.lock();
            state.requests.push((options.identifier.clone(), request));
            (state.hang_requests, state.fail_requests, state.responses.pop_front())
        };

        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(Error::Http {
                status: 500,
                body: "failed by test".to_string(),
            });
        }

        Ok(response.unwrap_or_else(|| json!({})))
    }
}

/// Handler that keeps every message it receives.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    messages: Mutex<Vec<NodeMessage>>,
}

impl RecordingHandler {
    pub fn messages(&self) -> Vec<NodeMessage> {
        self.messages.lock().clone()
    }
}

impl NodeHandler for RecordingHandler {
    fn handle(&self, _node: &Node, message: NodeMessage) {
        self.messages.lock().push(message);
    }
}

pub(crate) fn node_options(id: &str) -> NodeOptions {
    NodeOptions {
        retry_amount: 2,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(40),
        request_timeout: Duration::from_millis(200),
        ..NodeOptions::new("127.0.0.1", 2333, "youshallnotpass").with_identifier(id)
    }
}

pub(crate) fn handshake() -> Handshake {
    Handshake {
        user_id: "1000".to_string(),
        shards: 1,
        client_name: "tests".to_string(),
    }
}

/// Polls `condition` for up to a second.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

pub(crate) async fn connected_node(
    transport: &MockTransport,
    id: &str,
    handler: Arc<dyn NodeHandler>,
) -> Node {
    let node = Node::new(node_options(id), Arc::new(transport.clone()), handler);
    node.connect(handshake());
    wait_until(|| node.is_connected()).await;
    node
}
