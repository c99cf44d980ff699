/*!
# Message Router

In-process mailbox delivery between workers and the coordinator: fire-and-forget
sends, correlated request/response, broadcast, and TTL-based expiry.
*/

use crate::error::{CoordinationError, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Where a message is headed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recipient {
    /// One mailbox
    Worker(String),
    /// Every mailbox known at send time
    Broadcast,
}

/// A routed message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message id; doubles as the correlation id for request/response
    pub id: uuid::Uuid,
    /// Sender
    pub from: String,
    /// Recipient
    pub to: Recipient,
    /// Message type tag
    pub kind: String,
    /// Payload
    pub payload: serde_json::Value,
    /// Priority (higher = more urgent); informational, delivery stays FIFO
    pub priority: i32,
    /// Send timestamp
    pub timestamp: DateTime<Utc>,
    /// Expiry; expired messages are dropped at the next maintenance tick
    pub expires_at: Option<DateTime<Utc>>,
    /// Correlation id of the request this answers
    pub in_reply_to: Option<uuid::Uuid>,
}

impl Message {
    /// Create a message to a single worker
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            from: from.into(),
            to: Recipient::Worker(to.into()),
            kind: kind.into(),
            payload,
            priority: 0,
            timestamp: Utc::now(),
            expires_at: None,
            in_reply_to: None,
        }
    }

    /// Set priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set a time-to-live
    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.expires_at = Some(Utc::now() + ChronoDuration::milliseconds(ttl_ms as i64));
        self
    }

    /// Whether the TTL has elapsed
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() > at).unwrap_or(false)
    }
}

/// Handler invoked on delivery. Errors are logged and swallowed; a handler
/// can never take the router down.
pub type MessageHandler = Arc<dyn Fn(&Message) -> Result<()> + Send + Sync>;

#[derive(Default)]
struct Mailbox {
    queue: VecDeque<Message>,
    handlers: Vec<MessageHandler>,
}

struct PendingResponse {
    tx: oneshot::Sender<serde_json::Value>,
    created_at: Instant,
}

/// In-process router with one mailbox per worker
pub struct MessageRouter {
    mailboxes: RwLock<HashMap<String, Mailbox>>,
    pending: Mutex<HashMap<uuid::Uuid, PendingResponse>>,
    message_timeout: Duration,
}

impl MessageRouter {
    /// Create a router; `message_timeout` bounds request/response waits
    pub fn new(message_timeout_ms: u64) -> Self {
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            message_timeout: Duration::from_millis(message_timeout_ms),
        }
    }

    /// Create an empty mailbox for a worker
    pub fn register_mailbox(&self, worker: &str) {
        self.mailboxes
            .write()
            .unwrap()
            .entry(worker.to_string())
            .or_default();
    }

    /// Remove a worker's mailbox and its queued messages
    pub fn remove_mailbox(&self, worker: &str) {
        self.mailboxes.write().unwrap().remove(worker);
    }

    /// Attach a handler to a worker's mailbox; multiple handlers are allowed
    pub fn subscribe(&self, worker: &str, handler: MessageHandler) {
        self.mailboxes
            .write()
            .unwrap()
            .entry(worker.to_string())
            .or_default()
            .handlers
            .push(handler);
    }

    fn deliver(&self, worker: &str, message: Message) {
        let handlers = {
            let mut mailboxes = self.mailboxes.write().unwrap();
            let mailbox = mailboxes.entry(worker.to_string()).or_default();
            mailbox.queue.push_back(message.clone());
            mailbox.handlers.clone()
        };
        // Handlers run outside the mailbox lock so they may send
        for handler in handlers {
            if let Err(err) = handler(&message) {
                error!(worker, %err, "message handler failed");
            }
        }
    }

    /// Send a message
    pub fn send(&self, message: Message) -> Result<()> {
        if message.is_expired() {
            warn!(id = %message.id, "dropping message expired before send");
            return Ok(());
        }
        match message.to.clone() {
            Recipient::Worker(worker) => {
                debug!(from = %message.from, to = %worker, kind = %message.kind, "send");
                self.deliver(&worker, message);
            }
            Recipient::Broadcast => {
                let targets: Vec<String> = {
                    let mailboxes = self.mailboxes.read().unwrap();
                    mailboxes
                        .keys()
                        .filter(|k| **k != message.from)
                        .cloned()
                        .collect()
                };
                debug!(from = %message.from, count = targets.len(), "broadcast");
                for worker in targets {
                    let mut copy = message.clone();
                    copy.to = Recipient::Worker(worker.clone());
                    self.deliver(&worker, copy);
                }
            }
        }
        Ok(())
    }

    /// Send to every known mailbox except the sender's
    pub fn broadcast(
        &self,
        from: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut message = Message::new(from, "", kind, payload);
        message.to = Recipient::Broadcast;
        self.send(message)
    }

    /// Send a request and await its correlated response.
    ///
    /// The responder completes the exchange with [`MessageRouter::respond`];
    /// the wait fails with `ResponseTimeout` after the configured timeout.
    pub async fn send_with_response(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let message = Message::new(from, to, kind, payload);
        let correlation_id = message.id;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            correlation_id,
            PendingResponse {
                tx,
                created_at: Instant::now(),
            },
        );

        self.send(message)?;

        match tokio::time::timeout(self.message_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                self.pending.lock().unwrap().remove(&correlation_id);
                Err(CoordinationError::ResponseTimeout { correlation_id })
            }
        }
    }

    /// Complete a pending request/response exchange
    pub fn respond(&self, correlation_id: uuid::Uuid, value: serde_json::Value) -> Result<()> {
        match self.pending.lock().unwrap().remove(&correlation_id) {
            Some(pending) => {
                let _ = pending.tx.send(value);
                Ok(())
            }
            None => {
                warn!(%correlation_id, "response for unknown or expired correlation id");
                Ok(())
            }
        }
    }

    /// Take all queued messages for a worker, FIFO
    pub fn drain(&self, worker: &str) -> Vec<Message> {
        let mut mailboxes = self.mailboxes.write().unwrap();
        match mailboxes.get_mut(worker) {
            Some(mailbox) => mailbox.queue.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Queued message count for a worker
    pub fn queue_depth(&self, worker: &str) -> usize {
        self.mailboxes
            .read()
            .unwrap()
            .get(worker)
            .map(|m| m.queue.len())
            .unwrap_or(0)
    }

    /// Drop expired messages, collect idle mailboxes, and fail over-age
    /// pending responses
    pub fn maintenance(&self) {
        let mut dropped = 0usize;
        {
            let mut mailboxes = self.mailboxes.write().unwrap();
            for mailbox in mailboxes.values_mut() {
                let before = mailbox.queue.len();
                mailbox.queue.retain(|m| !m.is_expired());
                dropped += before - mailbox.queue.len();
            }
            mailboxes.retain(|_, m| !m.queue.is_empty() || !m.handlers.is_empty());
        }
        if dropped > 0 {
            warn!(dropped, "expired messages dropped");
        }

        let timeout = self.message_timeout;
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|_, p| p.created_at.elapsed() < timeout);
        let failed = before - pending.len();
        if failed > 0 {
            warn!(failed, "pending responses timed out");
        }
    }

    /// Flush everything; used during shutdown
    pub fn flush(&self) {
        self.mailboxes.write().unwrap().clear();
        self.pending.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_send_and_drain_fifo() {
        let router = MessageRouter::new(1000);
        router.register_mailbox("w1");

        router
            .send(Message::new("coord", "w1", "first", serde_json::json!(1)))
            .unwrap();
        router
            .send(Message::new("coord", "w1", "second", serde_json::json!(2)))
            .unwrap();

        let messages = router.drain("w1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, "first");
        assert_eq!(messages[1].kind, "second");
        assert_eq!(messages[1].payload, serde_json::json!(2));
        assert!(router.drain("w1").is_empty());
    }

    #[test]
    fn test_handlers_invoked_and_errors_swallowed() {
        let router = MessageRouter::new(1000);
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        router.subscribe(
            "w1",
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        router.subscribe(
            "w1",
            Arc::new(|_| Err(CoordinationError::system("handler boom"))),
        );

        router
            .send(Message::new("coord", "w1", "ping", serde_json::json!({})))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let router = MessageRouter::new(1000);
        router.register_mailbox("w1");
        router.register_mailbox("w2");
        router.register_mailbox("w3");

        router
            .broadcast("w1", "announce", serde_json::json!({"up": true}))
            .unwrap();

        assert_eq!(router.queue_depth("w1"), 0);
        assert_eq!(router.queue_depth("w2"), 1);
        assert_eq!(router.queue_depth("w3"), 1);
    }

    #[tokio::test]
    async fn test_request_response_round_trip() {
        let router = Arc::new(MessageRouter::new(1000));
        router.register_mailbox("w1");

        // Responder answers whatever request lands in its mailbox
        let responder = router.clone();
        router.subscribe(
            "w1",
            Arc::new(move |message| {
                responder.respond(message.id, serde_json::json!({"pong": true}))
            }),
        );

        let value = router
            .send_with_response("coord", "w1", "ping", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!({"pong": true}));
    }

    #[tokio::test]
    async fn test_response_timeout() {
        let router = MessageRouter::new(50);
        router.register_mailbox("w1");

        let err = router
            .send_with_response("coord", "w1", "ping", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::ResponseTimeout { .. }));
    }

    #[tokio::test]
    async fn test_maintenance_drops_expired() {
        let router = MessageRouter::new(1000);
        router.register_mailbox("w1");

        router
            .send(Message::new("coord", "w1", "stale", serde_json::json!({})).with_ttl_ms(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        router.maintenance();
        assert_eq!(router.queue_depth("w1"), 0);
    }

    #[test]
    fn test_maintenance_collects_idle_mailboxes() {
        let router = MessageRouter::new(1000);
        router.register_mailbox("w1");
        router.subscribe("w2", Arc::new(|_| Ok(())));

        router.maintenance();
        // w1 had no queue and no handlers; w2 keeps its subscriber
        assert_eq!(router.mailboxes.read().unwrap().len(), 1);
    }
}
