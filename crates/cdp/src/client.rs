//! CDP Client - The Core Communication Layer
//!
//! Design decisions:
//! 1. Single WebSocket per browser connection (no per-session WS overhead)
//! 2. Async message passing - no locks on send/receive path
//! 3. Request/response matching via ID, events fanned out to domain streams
//! 4. Fail fast - no retries, no queuing. Let the caller decide.
//!
//! Events are routed from a single reader task, one message at a time, so
//! every subscriber observes events in the order the browser produced them.

use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::*;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Default time to wait for a command response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum CDPError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CDP protocol error: {code} - {message}")]
    Protocol { code: i32, message: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Invalid response for request {0}")]
    InvalidResponse(RequestId),

    #[error("Missing {0} in response")]
    MissingField(&'static str),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),
}

/// Result type for CDP operations
pub type Result<T> = std::result::Result<T, CDPError>;

/// Ordered event stream for one domain, optionally scoped to one session
struct DomainSubscriber {
    session_id: Option<SessionId>,
    tx: mpsc::UnboundedSender<CDPEvent>,
}

/// Routing tables shared between the client handle and its reader task
#[derive(Default)]
struct Router {
    /// Key: request_id, Value: oneshot sender for the reply
    pending: DashMap<RequestId, oneshot::Sender<Reply>>,

    /// Key: domain name (e.g., "DOM"), Value: channel subscribers
    domain_subscribers: DashMap<String, Vec<DomainSubscriber>>,
}

impl Router {
    fn route(&self, text: &str) -> Result<()> {
        match Inbound::parse(text)? {
            Some(Inbound::Reply(reply)) => {
                if let Some((_, tx)) = self.pending.remove(&reply.id) {
                    let _ = tx.send(reply); // Ignore send errors (receiver dropped)
                } else {
                    tracing::warn!("Received response for unknown request: {}", reply.id);
                }
            }
            Some(Inbound::Event(event)) => {
                if let Some(mut subscribers) = self.domain_subscribers.get_mut(event.domain()) {
                    // Closed receivers are pruned as they are found
                    subscribers.retain(|sub| {
                        !event.visible_to(sub.session_id.as_deref()) || sub.tx.send(event.clone()).is_ok()
                    });
                }
            }
            None => tracing::debug!("Ignoring frame without id or method"),
        }

        Ok(())
    }

    /// Drop everything so waiters observe `Closed` and streams end
    fn shutdown(&self) {
        self.pending.clear();
        self.domain_subscribers.clear();
    }
}

/// CDP Client - manages single WebSocket connection to browser
pub struct CDPClient {
    /// Monotonic request ID counter
    next_id: AtomicU64,

    router: Arc<Router>,

    /// WebSocket write half (wrapped for concurrent sending)
    ws_sink: Arc<RwLock<WsSink>>,

    /// Stops the reader task
    shutdown_tx: mpsc::Sender<()>,

    request_timeout: Duration,
}

impl CDPClient {
    /// Connect to Chrome DevTools Protocol endpoint
    pub async fn connect(ws_url: &str) -> Result<Arc<Self>> {
        Self::connect_with_timeout(ws_url, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Connect with a custom per-request timeout
    pub async fn connect_with_timeout(ws_url: &str, request_timeout: Duration) -> Result<Arc<Self>> {
        let parsed = url::Url::parse(ws_url).map_err(|e| CDPError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(CDPError::InvalidUrl(format!(
                "expected ws:// or wss://, got {}",
                parsed.scheme()
            )));
        }

        let (ws_stream, _) = connect_async(ws_url).await?;
        let (sink, mut stream) = ws_stream.split();
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let router = Arc::new(Router::default());
        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            router: router.clone(),
            ws_sink: Arc::new(RwLock::new(sink)),
            shutdown_tx,
            request_timeout,
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Err(e) = router.route(&text) {
                                    tracing::error!("Failed to handle message: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("WebSocket closed");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::error!("WebSocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Shutdown signal received");
                        break;
                    }
                }
            }

            router.shutdown();
        });

        Ok(client)
    }

    /// Send CDP request and wait for response
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        session_id: Option<&str>,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&Command {
            id,
            method,
            params: params.as_ref(),
            session_id,
        })?;

        let (tx, rx) = oneshot::channel();
        self.router.pending.insert(id, tx);

        tracing::debug!(id, method, "CDP request");
        let mut sink = self.ws_sink.write().await;
        if let Err(e) = sink.send(Message::Text(json)).await {
            self.router.pending.remove(&id);
            return Err(CDPError::WebSocket(e));
        }
        drop(sink); // Release lock immediately

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(CDPError::Closed),
            Err(_) => {
                self.router.pending.remove(&id);
                return Err(CDPError::Timeout);
            }
        };

        if reply.id != id {
            return Err(CDPError::InvalidResponse(id));
        }

        reply.outcome.map_err(|error| CDPError::Protocol {
            code: error.code,
            message: error.message,
        })
    }

    /// Ordered stream of every event in `domain`
    ///
    /// With `session_id` set, only events flattened from that session are
    /// delivered. The stream ends when the connection closes.
    pub fn subscribe_domain(
        &self,
        domain: impl Into<String>,
        session_id: Option<SessionId>,
    ) -> mpsc::UnboundedReceiver<CDPEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.router
            .domain_subscribers
            .entry(domain.into())
            .or_default()
            .push(DomainSubscriber { session_id, tx });
        rx
    }

    /// Close connection gracefully
    pub async fn close(self: Arc<Self>) -> Result<()> {
        let _ = self.shutdown_tx.send(()).await;
        let mut sink = self.ws_sink.write().await;
        sink.close().await?;
        Ok(())
    }
}
