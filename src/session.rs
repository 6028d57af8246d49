//! Session Registry
//!
//! Short-lived collaboration rooms identified by human-readable join codes.
//! A primary client creates a session and shares its code; secondary clients
//! join with the code and receive change broadcasts while the session lives.
//!
//! ## Architecture
//!
//! ```text
//! SessionRegistry
//! ├── Sessions (HashMap<code, Session>)
//! │   └── Session
//! │       ├── Clients: Vec<ClientHandle> (role, state, sender)
//! │       └── Created/emptied timestamps
//! ├── Config (max sessions, idle timeout, sweep interval)
//! └── Sweeper (periodic tokio task, explicit start/stop)
//! ```
//!
//! ## Client Lifecycle
//!
//! connecting → joined → (active ⇄ idle) → disconnected. Teardown only
//! removes the handle from its session; it never cancels an in-flight
//! mutation. Sessions whose membership has been empty past the idle
//! threshold are removed by the sweeper; a swept code can only come back
//! as a fresh session.
//!
//! The registry lock is held only for membership bookkeeping, never across
//! a dataset mutation or a channel send.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// Join codes drawn from an alphabet without 0/O/1/I/L.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Join code length.
pub const CODE_LENGTH: usize = 6;

/// Unique client identifier within the registry.
pub type ClientId = String;

/// Generate a fresh client identifier.
pub fn new_client_id() -> ClientId {
    uuid::Uuid::new_v4().to_string()
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of concurrent sessions (0 = unlimited).
    pub max_sessions: usize,
    /// Seconds an empty session may linger before the sweeper removes it
    /// (0 = never).
    pub idle_timeout_secs: u64,
    /// Sweeper tick interval in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1_000,
            idle_timeout_secs: 3600, // 1 hour
            sweep_interval_secs: 60,
        }
    }
}

/// Role of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The editor that created the session.
    Primary,
    /// A follower receiving change broadcasts.
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
        }
    }
}

/// Per-connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Joined,
    Active,
    Idle,
}

/// A connected client: identity, role, and the channel messages are
/// delivered on. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub id: ClientId,
    pub role: Role,
    pub state: ConnectionState,
    sender: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(role: Role, sender: mpsc::UnboundedSender<String>) -> Self {
        ClientHandle {
            id: new_client_id(),
            role,
            state: ConnectionState::Connecting,
            sender,
        }
    }

    /// Queue a message for delivery. Fails if the receiving side is gone.
    pub fn send(&self, message: String) -> Result<(), mpsc::error::SendError<String>> {
        self.sender.send(message)
    }
}

/// One collaboration room.
#[derive(Debug)]
struct Session {
    clients: Vec<ClientHandle>,
    created_at: Instant,
    /// Set while the session has no members; basis for idle sweeping.
    emptied_at: Option<Instant>,
}

impl Session {
    fn new() -> Self {
        let now = Instant::now();
        Session {
            clients: Vec::new(),
            created_at: now,
            emptied_at: Some(now),
        }
    }

    fn count_role(&self, role: Role) -> usize {
        self.clients.iter().filter(|c| c.role == role).count()
    }
}

/// Manages all live sessions.
///
/// Thread-safe via an internal RwLock held only for membership bookkeeping.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create a session and return its join code.
    ///
    /// Code collisions are retried internally and never surfaced.
    pub fn create(&self) -> StoreResult<String> {
        let mut sessions = self.sessions.write();
        if self.config.max_sessions > 0 && sessions.len() >= self.config.max_sessions {
            return Err(StoreError::SessionLimit(self.config.max_sessions));
        }
        let code = loop {
            let candidate = generate_code();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
            debug!(code = %candidate, "session_code_collision");
        };
        sessions.insert(code.clone(), Session::new());
        info!(code = %code, "session_created");
        Ok(code)
    }

    /// Add a client to a session in the `Joined` state. Joining an unknown
    /// code is a hard rejection; the caller must create a session first.
    /// Transports promote the client to `Active` via [`set_state`] once it
    /// starts interacting.
    ///
    /// [`set_state`]: SessionRegistry::set_state
    pub fn join(&self, code: &str, mut handle: ClientHandle) -> StoreResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(code)
            .ok_or_else(|| StoreError::SessionNotFound(code.to_string()))?;
        handle.state = ConnectionState::Joined;
        debug!(code = %code, client = %handle.id, role = %handle.role, "client_joined");
        session.emptied_at = None;
        session.clients.push(handle);
        Ok(())
    }

    /// Remove a client from a session. Removing an already-absent client is
    /// not an error; the removed handle is returned when one was present.
    pub fn leave(&self, code: &str, client_id: &str) -> StoreResult<Option<ClientHandle>> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(code)
            .ok_or_else(|| StoreError::SessionNotFound(code.to_string()))?;
        let removed = session
            .clients
            .iter()
            .position(|c| c.id == client_id)
            .map(|idx| session.clients.remove(idx));
        if let Some(handle) = &removed {
            debug!(code = %code, client = %handle.id, role = %handle.role, "client_left");
            if session.clients.is_empty() {
                session.emptied_at = Some(Instant::now());
            }
        }
        Ok(removed)
    }

    /// Flip a client between active and idle.
    pub fn set_state(
        &self,
        code: &str,
        client_id: &str,
        state: ConnectionState,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(code)
            .ok_or_else(|| StoreError::SessionNotFound(code.to_string()))?;
        if let Some(client) = session.clients.iter_mut().find(|c| c.id == client_id) {
            client.state = state;
        }
        Ok(())
    }

    /// Snapshot of a session's client handles.
    pub fn handles(&self, code: &str) -> StoreResult<Vec<ClientHandle>> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(code)
            .ok_or_else(|| StoreError::SessionNotFound(code.to_string()))?;
        Ok(session.clients.clone())
    }

    /// Number of clients with the given role in a session.
    pub fn count_role(&self, code: &str, role: Role) -> StoreResult<usize> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(code)
            .ok_or_else(|| StoreError::SessionNotFound(code.to_string()))?;
        Ok(session.count_role(role))
    }

    pub fn has_session(&self, code: &str) -> bool {
        self.sessions.read().contains_key(code)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// All live join codes, sorted.
    pub fn list_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.sessions.read().keys().cloned().collect();
        codes.sort_unstable();
        codes
    }

    /// Remove sessions whose membership has been empty past the idle
    /// threshold. Returns the number of sessions removed. Holds only the
    /// registry lock.
    pub fn sweep(&self) -> usize {
        if self.config.idle_timeout_secs == 0 {
            return 0;
        }
        let timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| match session.emptied_at {
            Some(emptied) => now.duration_since(emptied) < timeout,
            None => true,
        });
        let swept = before - sessions.len();
        if swept > 0 {
            drop(sessions);
            info!(swept, "sessions_swept");
        }
        swept
    }

    /// Age of a session since creation, for diagnostics.
    pub fn session_age(&self, code: &str) -> StoreResult<Duration> {
        let sessions = self.sessions.read();
        let session = sessions
            .get(code)
            .ok_or_else(|| StoreError::SessionNotFound(code.to_string()))?;
        Ok(session.created_at.elapsed())
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        SessionRegistry::new(SessionConfig::default())
    }
}

fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Handle to the running sweeper task.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "sweeper_join_failed");
        }
    }
}

/// Start the periodic sweep task. Must be called within a tokio runtime.
pub fn start_sweeper(registry: Arc<SessionRegistry>) -> SweeperHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let interval_secs = registry.config.sweep_interval_secs.max(1);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    registry.sweep();
                }
                _ = stopped.changed() => {
                    debug!("sweeper_stopped");
                    break;
                }
            }
        }
    });
    SweeperHandle { shutdown, task }
}
