//! Broadcast Router
//!
//! Fans change notifications out to the members of a session. Every message
//! is one JSON envelope `{"event": ..., "data": ...}`; there is no batching
//! and no replay, delivery is at most once. A send failure on one client's
//! channel is logged and never blocks delivery to the others or fails the
//! mutation that triggered the broadcast.
//!
//! Membership changes emit presence events to the primary members: a
//! secondary joining produces `secondary-connected`, the last secondary
//! leaving produces `secondary-disconnected`.
//!
//! The router snapshots client handles under the registry lock and performs
//! all channel sends outside it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::session::{ClientHandle, Role, SessionRegistry};

/// Event name for a secondary joining a session.
pub const EVENT_SECONDARY_CONNECTED: &str = "secondary-connected";

/// Event name for the last secondary leaving a session.
pub const EVENT_SECONDARY_DISCONNECTED: &str = "secondary-disconnected";

/// The wire envelope for every broadcast message.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<'a> {
    pub event: &'a str,
    pub data: serde_json::Value,
}

/// Session-scoped change fan-out over the registry's client channels.
pub struct BroadcastRouter {
    registry: Arc<SessionRegistry>,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        BroadcastRouter { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register a client with a session and emit presence events.
    pub fn join(&self, code: &str, handle: ClientHandle) -> StoreResult<()> {
        let role = handle.role;
        self.registry.join(code, handle)?;
        if role == Role::Secondary {
            self.send_to_role(
                code,
                Role::Primary,
                EVENT_SECONDARY_CONNECTED,
                json!({ "session": code }),
            )?;
        }
        Ok(())
    }

    /// Remove a client from a session and emit presence events.
    pub fn leave(&self, code: &str, client_id: &str) -> StoreResult<()> {
        let removed = self.registry.leave(code, client_id)?;
        if let Some(handle) = removed {
            if handle.role == Role::Secondary
                && self.registry.count_role(code, Role::Secondary)? == 0
            {
                self.send_to_role(
                    code,
                    Role::Primary,
                    EVENT_SECONDARY_DISCONNECTED,
                    json!({ "session": code }),
                )?;
            }
        }
        Ok(())
    }

    /// Deliver one event to every member of a session, excluding at most one
    /// client (typically the originator of the change).
    pub fn send(
        &self,
        code: &str,
        event: &str,
        data: serde_json::Value,
        exclude: Option<&str>,
    ) -> StoreResult<usize> {
        let handles = self.registry.handles(code)?;
        let recipients: Vec<&ClientHandle> = handles
            .iter()
            .filter(|h| exclude != Some(h.id.as_str()))
            .collect();
        Ok(self.deliver(code, event, data, &recipients))
    }

    fn send_to_role(
        &self,
        code: &str,
        role: Role,
        event: &str,
        data: serde_json::Value,
    ) -> StoreResult<usize> {
        let handles = self.registry.handles(code)?;
        let recipients: Vec<&ClientHandle> = handles.iter().filter(|h| h.role == role).collect();
        Ok(self.deliver(code, event, data, &recipients))
    }

    /// Serialize once, then push to each recipient's channel. Best effort:
    /// per-client failures are counted and logged, not propagated.
    fn deliver(
        &self,
        code: &str,
        event: &str,
        data: serde_json::Value,
        recipients: &[&ClientHandle],
    ) -> usize {
        let envelope = Envelope { event, data };
        let message = match serde_json::to_string(&envelope) {
            Ok(m) => m,
            Err(e) => {
                warn!(code = %code, event = %event, error = %e, "broadcast_encode_failed");
                return 0;
            }
        };
        let mut delivered = 0;
        for handle in recipients {
            match handle.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(
                        code = %code,
                        client = %handle.id,
                        event = %event,
                        "broadcast_send_failed"
                    );
                }
            }
        }
        debug!(code = %code, event = %event, delivered, "broadcast_sent");
        delivered
    }
}
