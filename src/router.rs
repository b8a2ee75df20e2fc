//! Owns the upstream transport: one reader task decodes frames and
//! dispatches them by token/verb, a serialized writer accepts encoded
//! frames from every producer in the process (request issuer, attach
//! server connections, bus bridge).
//!
//! State is split across two locks, not one: `RouterState` (the routing
//! tables) is cheap to hold — every operation on it is O(1) — while the
//! transport lock is held for the duration of an actual read or write.
//! Keeping them separate means a slow write never blocks a dispatch
//! decision, and vice versa.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::frame::{self, Frame, FrameError};
use crate::transport::{Transport, TransportError};

/// Reserved token meaning "device-initiated, no request of ours prompted
/// this" — used for the startup handshake queue and for unsolicited
/// `sched` output thereafter.
pub const TOKEN_SCHED: &str = "sched";
/// Reserved token meaning "fire and forget, no reply queue installed".
pub const TOKEN_NORET: &str = "noret";

/// A request/reply correlation id: `"<parent-pid>/<pid>/<random-hex>"`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Generate a fresh token unique to this process's lifetime.
    pub fn generate() -> Self {
        let ppid = nix::unistd::getppid().as_raw();
        let pid = std::process::id();
        let rand: u32 = rand::random();
        Token(format!("{ppid}/{pid}/{rand:08x}"))
    }

    pub fn sched() -> Self {
        Token(TOKEN_SCHED.to_string())
    }

    pub fn noret() -> Self {
        Token(TOKEN_NORET.to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Token(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `""` and `noret` are never installed in the downstream routing
    /// table.
    pub fn is_reserved(&self) -> bool {
        self.0.is_empty() || self.0 == TOKEN_NORET
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ClientEntry {
    tx: mpsc::UnboundedSender<Frame>,
    last_token: Option<String>,
}

struct RouterState {
    pending: HashMap<String, mpsc::UnboundedSender<Frame>>,
    downstream_routes: HashMap<String, ClientId>,
    clients: HashMap<ClientId, ClientEntry>,
    next_client_id: u64,
    bus_tx: Option<mpsc::UnboundedSender<Frame>>,
    default_output: mpsc::UnboundedSender<Frame>,
}

/// Cheaply-cloned handle to the router; every task that needs to send a
/// frame or register a reply queue holds one of these.
#[derive(Clone)]
pub struct Router {
    state: Arc<Mutex<RouterState>>,
    transport: Arc<Mutex<Transport>>,
    cancel: CancellationToken,
}

impl Router {
    /// Build a router over `transport`. Returns the handle plus the
    /// receiving end of the "default evaluator output" queue — frames
    /// whose token matched no pending request, destined for whatever is
    /// printing unsolicited device output (the REPL, or nothing, if
    /// non-interactive).
    pub fn new(
        transport: Transport,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (default_output, default_output_rx) = mpsc::unbounded_channel();
        let state = RouterState {
            pending: HashMap::new(),
            downstream_routes: HashMap::new(),
            clients: HashMap::new(),
            next_client_id: 0,
            bus_tx: None,
            default_output,
        };
        let router = Router {
            state: Arc::new(Mutex::new(state)),
            transport: Arc::new(Mutex::new(transport)),
            cancel,
        };
        (router, default_output_rx)
    }

    /// Run the reader loop until cancellation or upstream EOF. Intended to
    /// be spawned as its own task.
    pub async fn run(&self) {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => break,
                outcome = self.next_frame(&mut buf) => outcome,
            };
            match outcome {
                Ok(Some(frame)) => self.dispatch(frame).await,
                Ok(None) => {
                    info!("upstream transport closed");
                    break;
                }
                Err(FrameError::Io(e)) => {
                    warn!("upstream transport error: {e}");
                    break;
                }
                Err(e) => {
                    warn!("malformed frame on upstream transport: {e}, resyncing");
                    buf.clear();
                }
            }
        }
        self.cancel.cancel();
        self.shutdown().await;
    }

    async fn next_frame(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match frame::try_parse(buf) {
                Ok(Some(f)) => return Ok(Some(f)),
                Ok(None) => {
                    let read = {
                        let mut transport = self.transport.lock().await;
                        transport.read(buf).await
                    };
                    let n = read.map_err(|e| FrameError::Io(io::Error::other(e.to_string())))?;
                    if n == 0 {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&self, frame: Frame) {
        let token = String::from_utf8_lossy(frame.token()).into_owned();
        let verb = frame.verb().map(|v| v.to_vec());

        let mut state = self.state.lock().await;

        let is_bus_verb = matches!(
            verb.as_deref(),
            Some(b"pub") | Some(b"sub") | Some(b"unsub")
        );

        if is_bus_verb {
            match &state.bus_tx {
                Some(tx) => {
                    let _ = tx.send(frame.clone());
                }
                None => warn!("bus bridge not active, dropping {:?} frame", verb),
            }
        } else if let Some(pending_tx) = state.pending.get(&token) {
            let _ = pending_tx.send(frame.clone());
        } else {
            let _ = state.default_output.send(frame.clone());
        }

        for entry in state.clients.values() {
            let _ = entry.tx.send(frame.clone());
        }
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        // Dropping every sender causes blocked receivers' next `.recv()`
        // to return `None`, the channel-closed signal callers treat as
        // "shutting down".
        state.pending.clear();
        state.clients.clear();
        state.downstream_routes.clear();
    }

    /// Encode and write one frame, serialized against every other writer.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), RouterError> {
        let mut buf = BytesMut::new();
        frame::encode(frame, &mut buf);
        let mut transport = self.transport.lock().await;
        transport.write_all(&buf).await?;
        Ok(())
    }

    /// Install a reply queue for `token`. Replaces any existing queue
    /// under the same token, per the "at most one PendingRequest per
    /// token" invariant.
    pub async fn register_pending(&self, token: &Token) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.pending.insert(token.as_str().to_string(), tx);
        rx
    }

    pub async fn deregister_pending(&self, token: &Token) {
        let mut state = self.state.lock().await;
        state.pending.remove(token.as_str());
    }

    /// Register a newly accepted downstream client, returning its id and
    /// the receiving end of its broadcast feed.
    pub async fn register_client(&self) -> (ClientId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        let id = ClientId(state.next_client_id);
        state.next_client_id += 1;
        state.clients.insert(
            id,
            ClientEntry {
                tx,
                last_token: None,
            },
        );
        (id, rx)
    }

    /// Record `token` as client `id`'s one outstanding request, evicting
    /// whatever token it had previously registered. `""` and `noret` are
    /// never installed.
    pub async fn note_client_token(&self, id: ClientId, token: &Token) {
        if token.is_reserved() {
            return;
        }
        let mut state = self.state.lock().await;
        let prev = state
            .clients
            .get_mut(&id)
            .and_then(|entry| entry.last_token.replace(token.as_str().to_string()));
        if let Some(prev) = prev {
            state.downstream_routes.remove(&prev);
        }
        state.downstream_routes.insert(token.as_str().to_string(), id);
    }

    /// Remove a disconnected client and its routing-table entry.
    pub async fn deregister_client(&self, id: ClientId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.clients.remove(&id) {
            if let Some(last) = entry.last_token {
                state.downstream_routes.remove(&last);
            }
        }
    }

    /// Hand the bus bridge a channel to receive `pub`/`sub`/`unsub`
    /// frames on. Only meaningful on a serial transport.
    pub async fn attach_bus(&self, tx: mpsc::UnboundedSender<Frame>) {
        let mut state = self.state.lock().await;
        state.bus_tx = Some(tx);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
