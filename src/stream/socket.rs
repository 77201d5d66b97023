//! Event stream over a Unix socket.
//!
//! Newline-delimited JSON in both directions. The client writes one
//! `sessionSubscribe` request; the host answers with a response carrying
//! the same id and then pushes events until it closes the connection.
//!
//! ```text
//! → {"id":"…","method":"sessionSubscribe","params":{"session_id":"…"}}
//! ← {"id":"…","isSuccess":true}
//! ← {"type":"terminalOutput","sessionId":"…","data":{…},"sequence":1}
//! ← …
//! ```
//!
//! The reader task is spawned before the request is written, so the
//! response always has someone to deliver it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    agent_record_type, lookup_tag, DaemonEvent, EventStream, EventSubscription, SequenceGuard,
    StreamError, TagKind,
};
use crate::constants::{EVENT_CHANNEL_CAPACITY, STREAM_HANDSHAKE_TIMEOUT};

const SUBSCRIBE_METHOD: &str = "sessionSubscribe";

#[derive(Serialize)]
struct WireRequest<'a> {
    id: &'a str,
    method: &'static str,
    params: SubscribeParams<'a>,
}

#[derive(Serialize)]
struct SubscribeParams<'a> {
    session_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: String,
    #[serde(rename = "isSuccess", default)]
    is_success: Option<bool>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

impl WireResponse {
    fn into_result(self) -> Result<(), StreamError> {
        let ok = self.is_success.unwrap_or(self.error.is_none());
        if ok {
            return Ok(());
        }
        let (code, message) = self
            .error
            .map_or((0, "request rejected".to_string()), |e| (e.code, e.message));
        Err(StreamError::Server { code, message })
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    tag: String,
    #[serde(rename = "sessionId", alias = "session_id", default)]
    session_id: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    sequence: i64,
}

/// Convert a wire event into a [`DaemonEvent`].
///
/// Returns `None` for pings, unknown tags, and agent records of an unknown
/// type.
fn convert_wire_event(wire: WireEvent) -> Option<DaemonEvent> {
    let data = match wire.data {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    let event_type = match lookup_tag(&wire.tag)? {
        TagKind::Event(t) => t,
        TagKind::AgentRecord => agent_record_type(data.get("raw_json")?.as_str()?)?,
        TagKind::Ping => return None,
    };

    Some(DaemonEvent {
        event_type,
        session_id: wire.session_id,
        data,
        sequence: wire.sequence,
    })
}

type PendingReply = oneshot::Sender<Result<WireResponse, StreamError>>;

#[derive(Default)]
struct PendingState {
    waiting: HashMap<String, PendingReply>,
    closed: bool,
}

/// Outstanding requests awaiting a response line.
///
/// Once [`fail_all`](Self::fail_all) has run, later inserts fail at once.
#[derive(Default)]
struct PendingRequests {
    inner: Mutex<PendingState>,
}

impl PendingRequests {
    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.inner.lock().expect("pending requests lock poisoned")
    }

    fn insert(&self, id: String, reply: PendingReply) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            let _ = reply.send(Err(StreamError::Disconnected));
            return;
        }
        state.waiting.insert(id, reply);
    }

    fn remove(&self, id: &str) {
        self.lock().waiting.remove(id);
    }

    /// Hand `response` to its waiter. Returns `false` if nobody was waiting.
    fn complete(&self, response: WireResponse) -> bool {
        let Some(reply) = self.lock().waiting.remove(&response.id) else {
            return false;
        };
        // Waiter may have timed out already.
        let _ = reply.send(Ok(response));
        true
    }

    fn fail_all(&self) {
        let drained: Vec<PendingReply> = {
            let mut state = self.lock();
            state.closed = true;
            state.waiting.drain().map(|(_, reply)| reply).collect()
        };
        for reply in drained {
            let _ = reply.send(Err(StreamError::Disconnected));
        }
    }
}

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// [`EventStream`] over the daemon's Unix socket.
pub struct SocketEventStream {
    socket_path: PathBuf,
    session_id: String,
    handshake_timeout: Duration,
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
    connection: tokio::sync::Mutex<Option<Connection>>,
    subscribed: AtomicBool,
}

impl std::fmt::Debug for SocketEventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketEventStream")
            .field("socket_path", &self.socket_path)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SocketEventStream {
    /// Stream for `session_id` from the socket at `socket_path`.
    pub fn new(socket_path: PathBuf, session_id: &str) -> Self {
        Self {
            socket_path,
            session_id: session_id.to_string(),
            handshake_timeout: STREAM_HANDSHAKE_TIMEOUT,
            pending: Arc::new(PendingRequests::default()),
            shutdown: CancellationToken::new(),
            connection: tokio::sync::Mutex::new(None),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Override the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<UnixStream, StreamError> {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Cancelled),
            () = self.shutdown.cancelled() => return Err(StreamError::Disconnected),
            res = UnixStream::connect(&self.socket_path) => res,
        };
        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                StreamError::NotFound(self.socket_path.display().to_string())
            }
            _ => StreamError::ConnectionFailed(e),
        })
    }

    async fn handshake(
        &self,
        cancel: &CancellationToken,
        request_id: &str,
        reply: oneshot::Receiver<Result<WireResponse, StreamError>>,
    ) -> Result<(), StreamError> {
        let line = {
            let mut line = serde_json::to_string(&WireRequest {
                id: request_id,
                method: SUBSCRIBE_METHOD,
                params: SubscribeParams {
                    session_id: &self.session_id,
                },
            })?;
            line.push('\n');
            line
        };

        {
            let mut connection = self.connection.lock().await;
            let conn = connection.as_mut().ok_or(StreamError::Disconnected)?;
            conn.writer.write_all(line.as_bytes()).await?;
            conn.writer.flush().await?;
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(StreamError::Cancelled),
            res = tokio::time::timeout(self.handshake_timeout, reply) => res,
        };
        match outcome {
            Ok(Ok(Ok(response))) => response.into_result(),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_closed)) => Err(StreamError::Disconnected),
            Err(_elapsed) => Err(StreamError::HandshakeTimeout),
        }
    }
}

#[async_trait]
impl EventStream for SocketEventStream {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn subscribe(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EventSubscription, StreamError> {
        if self.shutdown.is_cancelled() {
            return Err(StreamError::Disconnected);
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::AlreadySubscribed);
        }

        let stream = self.connect(cancel).await?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        // Registered before the reader starts so a hang-up cannot be missed.
        let request_id = Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), reply_tx);

        let reader = tokio::spawn(read_loop(
            read_half,
            tx,
            Arc::clone(&self.pending),
            self.shutdown.clone(),
            self.session_id.clone(),
        ));
        *self.connection.lock().await = Some(Connection {
            writer: write_half,
            reader,
        });

        if let Err(e) = self.handshake(cancel, &request_id, reply_rx).await {
            self.pending.remove(&request_id);
            log::warn!("[EventStream] Subscribe to {} failed: {e}", self.session_id);
            self.disconnect().await;
            return Err(e);
        }

        log::info!(
            "[EventStream] Subscribed to {} via {}",
            self.session_id,
            self.socket_path.display()
        );
        Ok(EventSubscription::new(rx))
    }

    async fn disconnect(&self) {
        self.shutdown.cancel();
        self.pending.fail_all();
        let connection = self.connection.lock().await.take();
        if let Some(mut conn) = connection {
            let _ = conn.writer.shutdown().await;
            let _ = conn.reader.await;
            log::info!("[EventStream] Disconnected from {}", self.session_id);
        }
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    tx: mpsc::Sender<DaemonEvent>,
    pending: Arc<PendingRequests>,
    shutdown: CancellationToken,
    session_id: String,
) {
    let mut lines = BufReader::new(read_half).lines();
    let mut guard = SequenceGuard::default();

    loop {
        let line = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::info!("[EventStream] Host closed stream for {session_id}");
                break;
            }
            Err(e) => {
                log::warn!("[EventStream] Read error for {session_id}: {e}");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[EventStream] Ignoring malformed line: {e}");
                continue;
            }
        };

        // Responses carry an id and no event type.
        if value.get("id").is_some() && value.get("type").is_none() {
            match serde_json::from_value::<WireResponse>(value) {
                Ok(response) => {
                    if !pending.complete(response) {
                        log::debug!("[EventStream] Response with no pending request");
                    }
                }
                Err(e) => log::debug!("[EventStream] Ignoring malformed response: {e}"),
            }
            continue;
        }

        let Some(mut event) = serde_json::from_value::<WireEvent>(value)
            .ok()
            .and_then(convert_wire_event)
        else {
            continue;
        };
        if event.session_id.is_empty() {
            event.session_id.clone_from(&session_id);
        } else if event.session_id != session_id {
            log::debug!(
                "[EventStream] Dropping event for {} on {session_id} stream",
                event.session_id
            );
            continue;
        }
        if !guard.admit(&event) {
            continue;
        }

        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            res = tx.send(event) => {
                if res.is_err() {
                    break;
                }
            }
        }
    }

    pending.fail_all();
}
