//! Loopback socket variant of the extension channel.
//!
//! Speaks the same framed vocabulary as the stdio host, for setups where the
//! extension dials out to the app instead of being launched as a native
//! host. Adds request/response correlation: each request carries an integer
//! `requestId`, and the caller waits until a frame with the same id comes
//! back, the peer goes away, or the timeout fires.
//!
//! One peer at a time: a new connection replaces the previous one.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::SinkExt;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, FrameCodec, FrameReader};
use crate::bridge::protocol::{
    Account, ChannelRequest, Frame, Inbound, Outbound, SendReceipt, message_type,
};
use crate::config::ChannelConfig;
use crate::file_proxy;
use crate::job::EmailPayload;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no free port among {attempts} starting at {preferred}")]
    NoAvailablePort { preferred: u16, attempts: u16 },

    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("no extension connected")]
    NotConnected,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("timed out after {0:?} waiting for the extension")]
    Timeout(Duration),

    #[error("extension reported an error: {0}")]
    Peer(String),

    #[error("extension disconnected before responding")]
    Disconnected,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

type PeerSink = FramedWrite<OwnedWriteHalf, FrameCodec>;

struct Peer {
    generation: u64,
    sink: PeerSink,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Frame, ChannelError>>,
    /// Files the extension may fetch while this request is open.
    attachments: Vec<PathBuf>,
}

struct Shared {
    pending: DashMap<u64, PendingRequest>,
    next_request_id: AtomicU64,
    peer: Mutex<Option<Peer>>,
    generation: AtomicU64,
    connected: Notify,
    events: broadcast::Sender<Frame>,
    /// Bound on replies the channel sends on its own (hello_ack, file data,
    /// pong).
    reply_timeout: Duration,
}

/// Removes the pending entry when the requester stops waiting, whether it
/// got an answer, timed out, or was dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    request_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.request_id);
    }
}

pub struct ExtensionChannel {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    config: ChannelConfig,
    shutdown: CancellationToken,
}

impl ExtensionChannel {
    /// Bind the loopback listener and start accepting the extension.
    pub async fn listen(config: ChannelConfig) -> Result<Self, ChannelError> {
        let listener = bind_with_fallback(&config).await?;
        let local_addr = listener.local_addr().map_err(ChannelError::Bind)?;
        if config.preferred_port != 0 && local_addr.port() != config.preferred_port {
            tracing::info!(
                preferred_port = config.preferred_port,
                port = local_addr.port(),
                "Preferred port in use, listening on an alternative"
            );
        }

        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            pending: DashMap::new(),
            next_request_id: AtomicU64::new(1),
            peer: Mutex::new(None),
            generation: AtomicU64::new(0),
            connected: Notify::new(),
            events,
            reply_timeout: config.request_timeout,
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(listener, Arc::clone(&shared), shutdown.clone()));

        tracing::info!(%local_addr, "Extension channel listening");
        Ok(Self {
            shared,
            local_addr,
            config,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.peer.lock().await.is_some()
    }

    /// Wait up to `timeout` for an extension to connect.
    pub async fn wait_for_peer(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.shared.connected.notified();
                if self.is_connected().await {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    /// Connections accepted since the channel started.
    pub fn accepted_connections(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Frames the extension sent on its own (status notifications, results
    /// that no request is waiting for).
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.shared.events.subscribe()
    }

    /// Send `message` with a fresh `requestId` and wait for the reply.
    ///
    /// `timeout` covers writing the frame as well as waiting for the answer.
    /// A reply of `type: "error"` resolves to [`ChannelError::Peer`].
    pub async fn request(
        &self,
        message: &impl Serialize,
        timeout: Duration,
    ) -> Result<Frame, ChannelError> {
        self.request_with_grants(message, Vec::new(), timeout).await
    }

    async fn request_with_grants(
        &self,
        message: &impl Serialize,
        attachments: Vec<PathBuf>,
        timeout: Duration,
    ) -> Result<Frame, ChannelError> {
        let mut frame = match serde_json::to_value(message) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Err(ChannelError::InvalidRequest(
                    "request must be a JSON object".to_string(),
                ));
            }
            Err(e) => return Err(ChannelError::InvalidRequest(e.to_string())),
        };

        let request_id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        frame.insert("requestId".to_string(), Value::from(request_id));

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .insert(request_id, PendingRequest { tx, attachments });
        let _guard = PendingGuard {
            shared: &self.shared,
            request_id,
        };

        let deadline = tokio::time::Instant::now() + timeout;
        self.shared.send(&frame, deadline, timeout).await?;
        tracing::debug!(
            request_id,
            request_type = message_type(&frame).unwrap_or("<none>"),
            "Sent request to extension"
        );

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ChannelError::Disconnected),
            Err(_) => {
                tracing::warn!(
                    request_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request to extension timed out"
                );
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Ask the extension to compose and send an email.
    pub async fn send_email(&self, payload: &EmailPayload) -> Result<SendReceipt, ChannelError> {
        let request = ChannelRequest::SendEmail {
            email_data: payload.clone(),
        };
        let response = self
            .request_with_grants(&request, payload.attachment_paths(), self.config.send_timeout)
            .await?;

        let receipt: SendReceipt = serde_json::from_value(Value::Object(response))
            .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;
        if receipt.success {
            Ok(receipt)
        } else {
            Err(ChannelError::Peer(
                receipt.error.unwrap_or_else(|| "send failed".to_string()),
            ))
        }
    }

    /// Whether an extension is connected and reports itself ready.
    pub async fn check_availability(&self) -> bool {
        match self
            .request(&ChannelRequest::CheckAvailability, self.config.request_timeout)
            .await
        {
            Ok(response) => response
                .get("available")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Err(e) => {
                tracing::warn!(error = %e, "Availability check failed");
                false
            }
        }
    }

    pub async fn get_accounts(&self) -> Result<Vec<Account>, ChannelError> {
        let response = self
            .request(&ChannelRequest::GetAccounts, self.config.request_timeout)
            .await?;
        let accounts = response
            .get("accounts")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(accounts).map_err(|e| ChannelError::InvalidResponse(e.to_string()))
    }

    /// Round trip time to the extension.
    pub async fn ping(&self) -> Result<Duration, ChannelError> {
        let started = Instant::now();
        let request = ChannelRequest::Ping {
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.request(&request, self.config.request_timeout).await?;
        Ok(started.elapsed())
    }

    /// Stop accepting and drop the current connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ExtensionChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Shared {
    /// Write one frame to the current peer, giving up at `deadline`.
    ///
    /// A write that stalls past the deadline may have left half a frame on
    /// the wire, so the connection is dropped. `timeout` is only reported.
    async fn send<T: Serialize>(
        &self,
        message: T,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let Ok(mut peer) = tokio::time::timeout_at(deadline, self.peer.lock()).await else {
            tracing::warn!("Another send to the extension is stalled");
            return Err(ChannelError::Timeout(timeout));
        };
        let Some(current) = peer.as_mut() else {
            return Err(ChannelError::NotConnected);
        };

        match tokio::time::timeout_at(deadline, current.sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_encoding() => Err(e.into()),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Send to extension failed, dropping connection");
                *peer = None;
                Err(e.into())
            }
            Err(_) => {
                tracing::warn!(
                    generation = current.generation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Extension stopped reading, dropping connection"
                );
                *peer = None;
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    async fn reply(&self, message: &Outbound) {
        let deadline = tokio::time::Instant::now() + self.reply_timeout;
        if let Err(e) = self.send(message, deadline, self.reply_timeout).await {
            tracing::debug!(
                error = %e,
                message_type = message.kind(),
                "Could not reply to extension"
            );
        }
    }

    async fn dispatch(&self, frame: Frame) {
        if let Some(request_id) = frame.get("requestId").and_then(Value::as_u64)
            && let Some((_, pending)) = self.pending.remove(&request_id)
        {
            let outcome = if message_type(&frame) == Some("error") {
                let message = frame
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                Err(ChannelError::Peer(message))
            } else {
                Ok(frame)
            };
            if pending.tx.send(outcome).is_err() {
                tracing::debug!(request_id, "Requester stopped waiting before the reply arrived");
            }
            return;
        }

        match Inbound::classify(&frame) {
            Inbound::Hello => {
                tracing::info!("Handshake received");
                self.reply(&Outbound::hello_ack()).await;
            }
            Inbound::GetFileData { id, file_path } => {
                let granted = self.is_attachment(Path::new(&file_path));
                let response = file_proxy::file_data_response(id, &file_path, granted);
                self.reply(&Outbound::FileData(response)).await;
            }
            Inbound::Ping {
                timestamp,
                request_id,
            } => {
                self.reply(&Outbound::Pong {
                    timestamp,
                    request_id,
                })
                .await;
            }
            Inbound::JobResult { .. } | Inbound::Other => {
                tracing::info!(
                    message_type = message_type(&frame).unwrap_or("<none>"),
                    "Unsolicited message from extension"
                );
                // Nobody listening is fine.
                let _ = self.events.send(frame);
            }
        }
    }

    fn is_attachment(&self, path: &Path) -> bool {
        let granted: Vec<PathBuf> = self
            .pending
            .iter()
            .flat_map(|entry| entry.attachments.clone())
            .collect();
        file_proxy::is_granted(path, &granted)
    }

    /// Connection `generation` ended. If it was the newest one, every
    /// outstanding request fails.
    async fn disconnect(&self, generation: u64) {
        {
            let mut peer = self.peer.lock().await;
            if peer.as_ref().is_some_and(|p| p.generation == generation) {
                *peer = None;
            }
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(ChannelError::Disconnected));
            }
        }
    }
}

async fn bind_with_fallback(config: &ChannelConfig) -> Result<TcpListener, ChannelError> {
    let attempts = config.max_attempts.max(1);
    for offset in 0..attempts {
        let Some(port) = config.preferred_port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((config.host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::AddrInUse | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::debug!(port, error = %e, "Port unavailable, trying the next one");
            }
            Err(e) => return Err(ChannelError::Bind(e)),
        }
    }
    Err(ChannelError::NoAvailablePort {
        preferred: config.preferred_port,
        attempts,
    })
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let generation = {
            let mut peer = shared.peer.lock().await;
            let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            if peer.is_some() {
                tracing::info!("Replacing previous extension connection");
            }
            *peer = Some(Peer {
                generation,
                sink: FramedWrite::new(write_half, FrameCodec::new()),
            });
            generation
        };
        shared.connected.notify_waiters();
        tracing::info!(%remote, generation, "Extension connected");

        tokio::spawn(serve_connection(
            FrameReader::new(read_half),
            generation,
            Arc::clone(&shared),
            shutdown.child_token(),
        ));
    }
    tracing::debug!("Accept loop exiting");
}

async fn serve_connection(
    mut reader: FrameReader<OwnedReadHalf>,
    generation: u64,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = reader.read_frame() => next,
        };
        match next {
            Ok(Some(frame)) => shared.dispatch(frame).await,
            Ok(None) => {
                tracing::info!(generation, "Extension disconnected");
                break;
            }
            Err(e) if e.is_protocol() => {
                tracing::warn!(error = %e, "Dropping malformed frame");
            }
            Err(e) => {
                tracing::warn!(error = %e, generation, "Extension connection failed");
                break;
            }
        }
    }
    shared.disconnect(generation).await;
}
