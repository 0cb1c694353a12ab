//! The wire underneath a node: a persistent JSON socket plus one-off REST
//! requests.
//!
//! [`Transport`] is the seam between the node state machine and the network.
//! [`LavalinkTransport`] is the real implementation (tokio-tungstenite +
//! reqwest); tests plug in an in-memory one.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, trace, warn};

use crate::config::NodeOptions;
use crate::error::{Error, Result};

/// Identity presented to the node when the socket is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub user_id: String,
    pub shards: u64,
    pub client_name: String,
}

/// Something that happened on the persistent socket.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Message(Value),
    Closed { code: Option<u16>, reason: String },
}

/// An open socket, as a pair of channels. Dropping `outgoing` closes it.
#[derive(Debug)]
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<SocketEvent>,
}

/// An HTTP-shaped request against a node's REST API.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: Method,
    /// Path relative to the node root, starting with `/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RestRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens the persistent socket.
    async fn connect(&self, options: &NodeOptions, handshake: &Handshake) -> Result<Connection>;

    /// Issues a single request and returns the decoded JSON body.
    async fn request(&self, options: &NodeOptions, request: RestRequest) -> Result<Value>;
}

/// WebSocket + HTTP transport for Lavalink servers.
pub struct LavalinkTransport {
    http: reqwest::Client,
}

impl LavalinkTransport {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("lavalink-manager/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { http })
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("Invalid value for header {}: {}", name, e)))
}

#[async_trait]
impl Transport for LavalinkTransport {
    async fn connect(&self, options: &NodeOptions, handshake: &Handshake) -> Result<Connection> {
        let mut request = options.socket_url().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Authorization", header_value("Authorization", &options.password)?);
        headers.insert("Num-Shards", header_value("Num-Shards", &handshake.shards.to_string())?);
        headers.insert("User-Id", header_value("User-Id", &handshake.user_id)?);
        headers.insert("Client-Name", header_value("Client-Name", &handshake.client_name)?);

        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();
        let identifier = options.identifier.clone();

        // Escritura: FIFO, termina cuando se suelta el sender
        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                trace!("[{}] -> {}", identifier, text);
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!("[{}] Error al escribir en el socket: {}", identifier, e);
                    break;
                }
            }

            let _ = sink.close().await;
            debug!("[{}] Escritor del socket terminado", identifier);
        });

        // Lectura
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(payload) => SocketEvent::Message(payload),
                        Err(e) => {
                            warn!("Error parsing received JSON: {:?}", e);
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                            .unwrap_or((None, String::new()));
                        let _ = incoming_tx.send(SocketEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = incoming_tx.send(SocketEvent::Closed {
                            code: None,
                            reason: e.to_string(),
                        });
                        return;
                    }
                };

                if incoming_tx.send(event).is_err() {
                    return;
                }
            }

            let _ = incoming_tx.send(SocketEvent::Closed {
                code: None,
                reason: "stream ended".to_string(),
            });
        });

        Ok(Connection { outgoing, incoming })
    }

    async fn request(&self, options: &NodeOptions, request: RestRequest) -> Result<Value> {
        let url = format!("{}{}", options.rest_url(), request.path);

        let mut builder = self
            .http
            .request(request.method, &url)
            .header("Authorization", options.password.as_str())
            .query(&request.query);

        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Value>().await?)
    }
}
