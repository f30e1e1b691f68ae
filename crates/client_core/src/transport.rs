//! Correlated WebSocket transport.
//!
//! One socket multiplexes user, message and call-control traffic. Outgoing
//! requests are keyed by a UUIDv7 correlation id in a pending table;
//! responses resolve by id regardless of arrival order, pushes dispatch in
//! wire order. A supervisor task owns the socket and reconnects with
//! exponential backoff; closing the socket rejects every outstanding request
//! instead of leaving callers hanging.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context as _;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::{
    error::ApiError,
    protocol::{CorrelationId, Envelope, EnvelopeBody},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-attempt wait for a response before the envelope is retransmitted.
    pub request_timeout: Duration,
    /// Total transmissions of one request before it fails with `Timeout`.
    pub max_attempts: u32,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(20),
            max_attempts: 10,
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no response after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("connection lost with the request outstanding")]
    ConnectionLost,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("failed to encode envelope: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Server-initiated envelope kinds plus the synthetic `Reconnected` signal
/// dispatched after the socket is re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    ConversationUpdated,
    MessageReceived,
    CallInvite,
    CallStarted,
    CallEnded,
    Reconnected,
}

#[derive(Debug, Clone)]
pub enum PushEvent {
    Envelope(EnvelopeBody),
    Reconnected,
}

fn push_kind_of(body: &EnvelopeBody) -> Option<PushKind> {
    match body {
        EnvelopeBody::ConversationUpdated { .. } => Some(PushKind::ConversationUpdated),
        EnvelopeBody::MessageReceived { .. } => Some(PushKind::MessageReceived),
        EnvelopeBody::CallInvite { .. } => Some(PushKind::CallInvite),
        EnvelopeBody::CallStarted { .. } => Some(PushKind::CallStarted),
        EnvelopeBody::CallEnded { .. } => Some(PushKind::CallEnded),
        // Request/response kinds never arrive as pushes.
        EnvelopeBody::GetUser { .. }
        | EnvelopeBody::GetUserByName { .. }
        | EnvelopeBody::UserResponse { .. }
        | EnvelopeBody::ListConversations
        | EnvelopeBody::ConversationsResponse { .. }
        | EnvelopeBody::SendMessage { .. }
        | EnvelopeBody::MessageAck { .. }
        | EnvelopeBody::RequestCallToken { .. }
        | EnvelopeBody::CallTokenIssued { .. }
        | EnvelopeBody::Error { .. } => None,
    }
}

pub type PushHandler = Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// One inbound/outbound text-frame socket. The trait exists so tests can
/// substitute an in-memory socket for tokio-tungstenite.
#[async_trait]
pub trait WireSocket: Send {
    async fn send(&mut self, frame: String) -> anyhow::Result<()>;
    /// Next inbound frame; `None` once the peer closed the socket.
    async fn recv(&mut self) -> Option<anyhow::Result<String>>;
}

#[async_trait]
pub trait WireConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> anyhow::Result<Box<dyn WireSocket>>;
}

pub struct TungsteniteConnector;

struct TungsteniteSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WireSocket for TungsteniteSocket {
    async fn send(&mut self, frame: String) -> anyhow::Result<()> {
        self.inner.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

#[async_trait]
impl WireConnector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> anyhow::Result<Box<dyn WireSocket>> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        Ok(Box::new(TungsteniteSocket { inner: stream }))
    }
}

struct PendingRequest {
    created_at: Instant,
    resolve: oneshot::Sender<Result<EnvelopeBody, TransportError>>,
}

struct TransportShared {
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    handlers: Mutex<HashMap<PushKind, Vec<PushHandler>>>,
}

impl TransportShared {
    async fn handle_frame(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping invalid envelope: {err}");
                return;
            }
        };

        match envelope.id {
            Some(id) => {
                let entry = self.pending.lock().await.remove(&id);
                match entry {
                    Some(entry) => {
                        debug!(
                            id = %id,
                            kind = envelope.body.kind_name(),
                            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                            "response resolved"
                        );
                        let result = match envelope.body {
                            EnvelopeBody::Error { error } => Err(TransportError::Api(error)),
                            body => Ok(body),
                        };
                        let _ = entry.resolve.send(result);
                    }
                    // Either a response to a retransmitted attempt that
                    // already resolved, or one this session never asked for.
                    None => debug!(
                        id = %id,
                        kind = envelope.body.kind_name(),
                        "response with no pending request; dropping"
                    ),
                }
            }
            None => match push_kind_of(&envelope.body) {
                Some(kind) => {
                    self.dispatch_push(kind, &PushEvent::Envelope(envelope.body))
                        .await
                }
                None => debug!(
                    kind = envelope.body.kind_name(),
                    "push envelope with request kind; dropping"
                ),
            },
        }
    }

    async fn dispatch_push(&self, kind: PushKind, event: &PushEvent) {
        let handlers: Vec<PushHandler> = {
            let registry = self.handlers.lock().await;
            registry.get(&kind).cloned().unwrap_or_default()
        };
        for handler in handlers {
            handler(event);
        }
    }

    async fn fail_all_pending(&self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "rejecting outstanding requests");
        }
        for entry in drained {
            let _ = entry.resolve.send(Err(TransportError::ConnectionLost));
        }
    }
}

/// Single ingress/egress point for all realtime traffic. Construct one per
/// session and inject it into consumers; `open`/`close` bound its lifecycle.
pub struct SessionTransport {
    config: TransportConfig,
    connector: Arc<dyn WireConnector>,
    shared: Arc<TransportShared>,
    outgoing_tx: mpsc::UnboundedSender<String>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SessionTransport {
    pub fn new(connector: Arc<dyn WireConnector>, config: TransportConfig) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            connector,
            shared: Arc::new(TransportShared {
                pending: Mutex::new(HashMap::new()),
                handlers: Mutex::new(HashMap::new()),
            }),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            supervisor: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Starts the connection supervisor. Fails if the transport was already
    /// opened; a closed transport stays closed.
    pub async fn open(&self, url: Url) -> anyhow::Result<()> {
        let outgoing_rx = self
            .outgoing_rx
            .lock()
            .await
            .take()
            .context("transport already opened")?;

        let supervisor = tokio::spawn(run_supervisor(
            Arc::clone(&self.connector),
            self.config.clone(),
            url,
            Arc::clone(&self.shared),
            outgoing_rx,
            self.shutdown_rx.clone(),
        ));
        *self.supervisor.lock().await = Some(supervisor);
        Ok(())
    }

    /// Tears the transport down, rejecting every outstanding request.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
        self.shared.fail_all_pending().await;
    }

    /// Fire-and-forget transmit; never suspends. Frames queued while the
    /// socket is down flush on reconnect.
    pub fn send(&self, body: EnvelopeBody) -> Result<(), TransportError> {
        let frame = serde_json::to_string(&Envelope::push(body))?;
        // Receiver lives for the life of the transport; a send error only
        // means we are shut down, which fire-and-forget ignores.
        let _ = self.outgoing_tx.send(frame);
        Ok(())
    }

    /// Correlated request. Retransmits the same envelope (same id) on each
    /// per-attempt timeout until the attempt budget is spent.
    pub async fn request(&self, body: EnvelopeBody) -> Result<EnvelopeBody, TransportError> {
        if *self.shutdown_rx.borrow() {
            return Err(TransportError::ConnectionLost);
        }
        let id = CorrelationId::generate();
        let frame = serde_json::to_string(&Envelope {
            id: Some(id),
            body,
        })?;

        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let (resolve_tx, resolve_rx) = oneshot::channel();
            self.shared.pending.lock().await.insert(
                id,
                PendingRequest {
                    created_at: Instant::now(),
                    resolve: resolve_tx,
                },
            );
            let _ = self.outgoing_tx.send(frame.clone());
            if attempt > 1 {
                debug!(id = %id, attempt, "retransmitting request");
            }

            match tokio::time::timeout(self.config.request_timeout, resolve_rx).await {
                Ok(Ok(result)) => return result,
                // Resolver dropped without a verdict; treat as a lost
                // connection rather than hanging the caller.
                Ok(Err(_)) => return Err(TransportError::ConnectionLost),
                Err(_elapsed) => {
                    self.shared.pending.lock().await.remove(&id);
                }
            }
        }

        Err(TransportError::Timeout {
            attempts: max_attempts,
        })
    }

    /// Registers a push handler; handlers for one kind run in registration
    /// order, in wire order across frames.
    pub async fn on_push(
        &self,
        kind: PushKind,
        handler: impl Fn(&PushEvent) + Send + Sync + 'static,
    ) {
        self.shared
            .handlers
            .lock()
            .await
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }
}

async fn run_supervisor(
    connector: Arc<dyn WireConnector>,
    config: TransportConfig,
    url: Url,
    shared: Arc<TransportShared>,
    mut outgoing_rx: mpsc::UnboundedReceiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = config.reconnect_initial;
    let mut first_connect = true;

    'reconnect: loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let connected = tokio::select! {
            _ = shutdown_rx.changed() => break 'reconnect,
            connected = connector.connect(&url) => connected,
        };

        let mut socket = match connected {
            Ok(socket) => socket,
            Err(err) => {
                warn!("websocket connect failed, retrying in {backoff:?}: {err}");
                tokio::select! {
                    _ = shutdown_rx.changed() => break 'reconnect,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(config.reconnect_max);
                continue;
            }
        };

        backoff = config.reconnect_initial;
        if first_connect {
            first_connect = false;
            info!(%url, "session socket connected");
        } else {
            info!(%url, "session socket reconnected");
            shared
                .dispatch_push(PushKind::Reconnected, &PushEvent::Reconnected)
                .await;
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break 'reconnect,
                outbound = outgoing_rx.recv() => {
                    let Some(frame) = outbound else { break 'reconnect };
                    if let Err(err) = socket.send(frame).await {
                        warn!("websocket send failed: {err}");
                        break;
                    }
                }
                inbound = socket.recv() => {
                    match inbound {
                        Some(Ok(text)) => shared.handle_frame(&text).await,
                        Some(Err(err)) => {
                            warn!("websocket receive failed: {err}");
                            break;
                        }
                        None => {
                            info!("server closed connection");
                            break;
                        }
                    }
                }
            }
        }

        // Socket gone: no silent hangs while we back off and reconnect.
        shared.fail_all_pending().await;
    }

    shared.fail_all_pending().await;
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
