//! [`Client`] – one WebSocket connection as seen by the hub and handler.
//!
//! A client owns three pieces of state, each behind its own lock so that
//! one connection never blocks another:
//!
//! | State | Lock | Changed by |
//! |---|---|---|
//! | identity (user, role) | `RwLock` | `auth` / handshake token |
//! | outbound queue sender | `Mutex` | taken on unregister |
//! | subscriptions | `Mutex` | `subscribe`, `unsubscribe`, `op_lock` |
//!
//! The write pump holds the receiving half of the outbound queue; taking the
//! sender out of the client closes the queue and ends the pump.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;

use bytes::Bytes;
use fleet_types::ClientId;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Why a frame could not be queued for a client.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("send buffer full")]
    Full,
    #[error("client disconnected")]
    Closed,
}

#[derive(Debug, Default, Clone)]
struct Identity {
    user_id: Option<String>,
    role: Option<String>,
}

pub struct Client {
    id: ClientId,
    identity: RwLock<Identity>,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    subscriptions: Mutex<HashSet<String>>,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl Client {
    /// Create a client with an outbound queue of `send_buffer` frames.
    ///
    /// `max_messages_per_second` bounds inbound traffic; `None` disables the
    /// limit.  Returns the client and the queue's receiving half, which
    /// belongs to the write pump.
    pub fn new(
        send_buffer: usize,
        max_messages_per_second: Option<NonZeroU32>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(send_buffer.max(1));
        let client = Arc::new(Self {
            id: Uuid::new_v4(),
            identity: RwLock::new(Identity::default()),
            sender: Mutex::new(Some(tx)),
            subscriptions: Mutex::new(HashSet::new()),
            limiter: max_messages_per_second.map(|rate| RateLimiter::direct(Quota::per_second(rate))),
        });
        (client, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    // ── Identity ────────────────────────────────────────────────────────────

    /// Mark the client authenticated as `user_id`.  A second call replaces
    /// the identity.
    pub fn authenticate(&self, user_id: impl Into<String>, role: Option<String>) {
        *self.identity.write() = Identity {
            user_id: Some(user_id.into()),
            role,
        };
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.read().user_id.is_some()
    }

    pub fn user_id(&self) -> Option<String> {
        self.identity.read().user_id.clone()
    }

    pub fn role(&self) -> Option<String> {
        self.identity.read().role.clone()
    }

    // ── Outbound queue ──────────────────────────────────────────────────────

    /// Queue `frame` without waiting.
    pub fn try_send(&self, frame: Bytes) -> Result<(), DeliveryError> {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(DeliveryError::Closed);
        };
        sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Close the outbound queue.  Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.sender.lock().take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }

    // ── Subscriptions ───────────────────────────────────────────────────────

    /// Returns `true` if the robot was not already subscribed.
    pub fn subscribe(&self, robot_id: &str) -> bool {
        self.subscriptions.lock().insert(robot_id.to_string())
    }

    pub fn unsubscribe(&self, robot_id: &str) -> bool {
        self.subscriptions.lock().remove(robot_id)
    }

    pub fn is_subscribed(&self, robot_id: &str) -> bool {
        self.subscriptions.lock().contains(robot_id)
    }

    /// Current subscriptions, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.subscriptions.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    // ── Inbound rate limit ──────────────────────────────────────────────────

    /// Consume one unit of the inbound budget.  Always `true` when the
    /// client has no limit.
    pub fn allow_message(&self) -> bool {
        self.limiter.as_ref().is_none_or(|l| l.check().is_ok())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("user_id", &self.user_id())
            .field("subscriptions", &self.subscriptions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_anonymous() {
        let (client, _rx) = Client::new(4, None);
        assert!(!client.is_authenticated());
        assert!(client.user_id().is_none());
        assert!(client.subscriptions().is_empty());
    }

    #[test]
    fn authenticate_sets_identity() {
        let (client, _rx) = Client::new(4, None);
        client.authenticate("alice", Some("admin".into()));
        assert!(client.is_authenticated());
        assert_eq!(client.user_id().as_deref(), Some("alice"));
        assert_eq!(client.role().as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn queued_frames_reach_receiver() {
        let (client, mut rx) = Client::new(4, None);
        client.try_send(Bytes::from_static(b"one")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
    }

    #[test]
    fn full_queue_reports_full() {
        let (client, _rx) = Client::new(1, None);
        client.try_send(Bytes::from_static(b"a")).unwrap();
        assert_eq!(client.try_send(Bytes::from_static(b"b")), Err(DeliveryError::Full));
    }

    #[tokio::test]
    async fn close_ends_the_queue() {
        let (client, mut rx) = Client::new(4, None);
        assert!(client.close());
        assert!(!client.close());
        assert!(client.is_closed());
        assert_eq!(client.try_send(Bytes::new()), Err(DeliveryError::Closed));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn subscriptions_are_a_set() {
        let (client, _rx) = Client::new(4, None);
        assert!(client.subscribe("r2"));
        assert!(client.subscribe("r1"));
        assert!(!client.subscribe("r1"));
        assert_eq!(client.subscriptions(), vec!["r1", "r2"]);
        assert!(client.unsubscribe("r2"));
        assert!(!client.is_subscribed("r2"));
    }

    #[test]
    fn rate_limit_rejects_burst_overflow() {
        let (client, _rx) = Client::new(4, NonZeroU32::new(3));
        let allowed = (0..10).filter(|_| client.allow_message()).count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn no_limit_allows_everything() {
        let (client, _rx) = Client::new(4, None);
        assert!((0..1000).all(|_| client.allow_message()));
    }
}
