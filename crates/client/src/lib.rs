//! Groundstation client
//!
//! Client for the agent event-stream protocol. `SessionClient` owns one
//! thread's view: it subscribes to the live NDJSON event stream, folds
//! every event through the pure reducer, and exposes lock-free state
//! snapshots plus a change-notification channel. The paired control
//! channel submits user turns and interrupts runs.
//!
//! All state changes flow through a single apply path, so readers always
//! see a coherent snapshot and never block the stream.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

mod config;
mod control;
mod error;
mod reduce;
mod stream;

pub use config::ClientConfig;
pub use error::ClientError;
pub use reduce::{
    reduce, ClientState, ConnectionStatus, PendingToolCall, StreamingMessage,
};

pub use groundstation_protocol as protocol;

/// Handle to one thread's live session.
///
/// Cheap to clone; all clones share the same state and subscription.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) config: ClientConfig,
    pub(crate) http: reqwest::Client,
    pub(crate) snapshot: ArcSwap<ClientState>,
    apply_lock: Mutex<()>,
    revision: watch::Sender<u64>,
    pub(crate) conn: AsyncMutex<ConnState>,
}

pub(crate) struct ConnState {
    pub(crate) generation: u64,
    pub(crate) stream_task: Option<JoinHandle<()>>,
    pub(crate) reconnect_task: Option<JoinHandle<()>>,
}

impl ClientInner {
    /// Single writer: load the current snapshot, run the transition, and
    /// publish the result. Readers keep whatever Arc they already hold.
    pub(crate) fn apply(&self, transition: impl FnOnce(ClientState) -> ClientState) {
        let _writer = self
            .apply_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let current = self.snapshot.load_full();
        let next = transition((*current).clone());
        self.snapshot.store(Arc::new(next));
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// True while `generation` is still the live connection attempt.
    pub(crate) async fn is_current(&self, generation: u64) -> bool {
        self.conn.lock().await.generation == generation
    }
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Self {
        let state = ClientState::new(config.thread_id.clone());
        let (revision, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(ClientInner {
                http: reqwest::Client::new(),
                snapshot: ArcSwap::from_pointee(state),
                apply_lock: Mutex::new(()),
                revision,
                conn: AsyncMutex::new(ConnState {
                    generation: 0,
                    stream_task: None,
                    reconnect_task: None,
                }),
                config,
            }),
        }
    }

    /// Current state snapshot. Never blocks.
    pub fn state(&self) -> Arc<ClientState> {
        self.inner.snapshot.load_full()
    }

    /// Change notifications: the value bumps on every published state.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Open the event stream, optionally resuming a known run.
    /// Supersedes any existing subscription.
    pub async fn connect(&self, run_id: Option<String>) {
        stream::connect(&self.inner, run_id).await;
    }

    /// Close the stream and clear live bookkeeping. Conversation history
    /// and key/value state survive.
    pub async fn disconnect(&self) {
        stream::disconnect(&self.inner).await;
    }

    /// Submit a user turn. Returns the run id the service assigned; the
    /// run's events arrive on the stream subscription.
    pub async fn send_message(&self, content: impl Into<String>) -> Result<String, ClientError> {
        control::submit_turn(&self.inner, content.into()).await
    }

    /// Interrupt the active run. A no-op when no run is active.
    pub async fn interrupt(&self) -> Result<(), ClientError> {
        control::interrupt(&self.inner).await
    }
}
