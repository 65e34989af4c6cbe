// SPDX-License-Identifier: Apache-2.0
//!
//! Maps an outstanding `requestId` to a waiter with a deadline and an
//! optional type filter.
//!
//! `AgentHandle::send` in a hub pairs one command with one optional
//! `oneshot::Sender` for its reply; [`Correlator`] generalizes that pattern
//! into a table so any number of requests can be in flight on a channel at
//! once. A registered wait resolves in exactly one of three ways — a
//! matching reply, a timeout, or the owning connection closing — never zero
//! times, never twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conclave_ids::{ConnectionId, MessageId};
use conclave_proto::Envelope;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("connection closed while waiting for a reply")]
    ConnectionClosed,
    #[error("peer reported an error: {0}")]
    PeerError(String),
    #[error("server is shutting down")]
    ServerStopped,
}

struct Waiter {
    type_filter: Option<String>,
    connection_id: Option<ConnectionId>,
    tx: oneshot::Sender<Result<Envelope, CorrelatorError>>,
}

/// A wait with no `requestId` to match against: resolved by the next
/// envelope of the registered type.
struct AnyWaiter {
    type_name: String,
    connection_id: Option<ConnectionId>,
    tx: oneshot::Sender<Result<Envelope, CorrelatorError>>,
}

/// The pending-response correlation table. One instance serves an entire
/// hub; waiters are keyed by the `MessageId` of the outbound request, plus a
/// second table of `anyIdWithType` waiters (keyed by a locally generated slot
/// id, not a `requestId`) for replies that carry no `requestId` at all.
#[derive(Default)]
pub struct Correlator {
    waiters: Mutex<HashMap<MessageId, Waiter>>,
    any_waiters: Mutex<HashMap<MessageId, AnyWaiter>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a wait for `request_id` and blocks until a matching reply
    /// arrives, `timeout` elapses, or `resolve`/`cancel_for_connection`
    /// settles it first. The waiter is always removed from the table before
    /// this returns.
    pub async fn await_reply(
        &self,
        request_id: MessageId,
        type_filter: Option<String>,
        connection_id: Option<ConnectionId>,
        timeout: Duration,
    ) -> Result<Envelope, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut guard = self.waiters.lock().await;
            guard.insert(
                request_id,
                Waiter { type_filter, connection_id, tx },
            );
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        // Remove unconditionally: resolve()/cancel_for_connection() may have
        // already done so, but a timed-out wait must not be left behind for
        // a late reply to match against.
        self.waiters.lock().await.remove(&request_id);

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelatorError::ConnectionClosed),
            Err(_) => Err(CorrelatorError::Timeout),
        }
    }

    /// Registers a wait for the next envelope of `type_name`, regardless of
    /// its `requestId` — the `anyIdWithType` mode, for replies that never
    /// carry a correlated request id at all (e.g. an unsolicited push that
    /// still needs exactly-once, deadline-bound handling).
    pub async fn await_any(
        &self,
        type_name: String,
        connection_id: Option<ConnectionId>,
        timeout: Duration,
    ) -> Result<Envelope, CorrelatorError> {
        let (tx, rx) = oneshot::channel();
        let slot = MessageId::new();
        self.any_waiters.lock().await.insert(slot, AnyWaiter { type_name, connection_id, tx });

        let outcome = tokio::time::timeout(timeout, rx).await;
        // Remove unconditionally, same reasoning as `await_reply`.
        self.any_waiters.lock().await.remove(&slot);

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CorrelatorError::ConnectionClosed),
            Err(_) => Err(CorrelatorError::Timeout),
        }
    }

    /// Attempts to resolve the waiter for `reply.request_id`, honoring the
    /// waiter's type filter if set. Falls back to a registered
    /// `anyIdWithType` waiter for this envelope's type if no exact
    /// `requestId` waiter matches. Returns `true` if a waiter was matched and
    /// consumed.
    pub async fn resolve(&self, reply: Envelope) -> bool {
        if let Some(request_id) = reply.request_id {
            let mut guard = self.waiters.lock().await;
            let matches = guard
                .get(&request_id)
                .map(|w| match &w.type_filter {
                    Some(expected) => message_type_name(&reply) == *expected,
                    None => true,
                })
                .unwrap_or(false);
            if matches {
                let waiter = guard.remove(&request_id).expect("checked above");
                let _ = waiter.tx.send(outcome_for(&reply));
                return true;
            }
        }
        self.resolve_any(reply).await
    }

    /// Resolves a registered `anyIdWithType` waiter whose registered type
    /// matches `reply`'s content type, ignoring `requestId` entirely.
    /// Returns `true` if a waiter was matched and consumed.
    pub async fn resolve_any(&self, reply: Envelope) -> bool {
        let type_name = message_type_name(&reply);
        let mut guard = self.any_waiters.lock().await;
        let Some(slot) = guard.iter().find(|(_, w)| w.type_name == type_name).map(|(id, _)| *id) else {
            return false;
        };
        let waiter = guard.remove(&slot).expect("checked above");
        let _ = waiter.tx.send(outcome_for(&reply));
        true
    }

    /// Rejects every waiter registered against `connection_id` with
    /// [`CorrelatorError::ConnectionClosed`]. Called when a hub observes its
    /// channel close.
    pub async fn cancel_for_connection(&self, connection_id: ConnectionId) {
        let mut guard = self.waiters.lock().await;
        let dead: Vec<MessageId> = guard
            .iter()
            .filter(|(_, w)| w.connection_id == Some(connection_id))
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(w) = guard.remove(&id) {
                let _ = w.tx.send(Err(CorrelatorError::ConnectionClosed));
            }
        }
        drop(guard);

        let mut any_guard = self.any_waiters.lock().await;
        let dead: Vec<MessageId> = any_guard
            .iter()
            .filter(|(_, w)| w.connection_id == Some(connection_id))
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            if let Some(w) = any_guard.remove(&id) {
                let _ = w.tx.send(Err(CorrelatorError::ConnectionClosed));
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.waiters.lock().await.len() + self.any_waiters.lock().await.len()
    }

    /// Rejects every outstanding waiter with [`CorrelatorError::ServerStopped`].
    /// Called once by the shutdown controller before listeners close.
    pub async fn cancel_all(&self) {
        let mut guard = self.waiters.lock().await;
        for (_, w) in guard.drain() {
            let _ = w.tx.send(Err(CorrelatorError::ServerStopped));
        }
        drop(guard);

        let mut any_guard = self.any_waiters.lock().await;
        for (_, w) in any_guard.drain() {
            let _ = w.tx.send(Err(CorrelatorError::ServerStopped));
        }
    }
}

fn outcome_for(reply: &Envelope) -> Result<Envelope, CorrelatorError> {
    if let conclave_proto::MessageContent::Error { error, .. } = &reply.content {
        Err(CorrelatorError::PeerError(error.clone()))
    } else {
        Ok(reply.clone())
    }
}

fn message_type_name(env: &Envelope) -> String {
    serde_json::to_value(&env.content)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_owned))
        .unwrap_or_default()
}
