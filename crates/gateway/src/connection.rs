//! State for a single connected dashboard or producer.

use crate::queue::{OutboundQueue, PushOutcome};
use axum::extract::ws::{Message, Utf8Bytes};
use chrono::Utc;
use common::ServerMessage;
use dashmap::DashSet;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Which call updates a connection receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Every call.
    Global,
    /// Only the listed calls.
    Calls(HashSet<String>),
}

/// State for a single connection.
///
/// Created and owned by the [`ConnectionRegistry`](crate::registry::ConnectionRegistry);
/// the WebSocket handler only holds a shared reference for the connection's lifetime.
pub struct ConnectionState {
    /// Unique connection identifier.
    pub id: ConnectionId,
    /// Frames waiting for the connection's send task.
    pub queue: Arc<OutboundQueue<Message>>,
    /// Calls explicitly subscribed to.
    pub(crate) calls: DashSet<String>,
    /// Receives every call when set.
    pub(crate) global: AtomicBool,
    /// Cleared on unregister.
    alive: AtomicBool,
    /// Timestamp when the connection was accepted.
    pub connected_at: i64,
    /// Timestamp of last ping received.
    pub(crate) last_ping: AtomicI64,
}

impl ConnectionState {
    pub(crate) fn new(queue_capacity: usize) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            queue: Arc::new(OutboundQueue::new(queue_capacity)),
            calls: DashSet::new(),
            global: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            connected_at: now,
            last_ping: AtomicI64::new(now),
        }
    }

    /// Serialize and enqueue a reply for this connection only. Replies use the
    /// control lane.
    pub fn send(&self, msg: &ServerMessage) -> crate::error::Result<PushOutcome> {
        let json = serde_json::to_string(msg)?;
        Ok(self.queue.push_control(Message::Text(json.into())))
    }

    /// Enqueue a pre-serialized text frame. Cloning `Utf8Bytes` is a refcount
    /// bump, so one serialization can be shared by every target.
    pub fn push_text(&self, text: Utf8Bytes) -> PushOutcome {
        self.queue.push(Message::Text(text))
    }

    /// Enqueue a raw frame (ping/pong/close) on the control lane.
    pub fn push_raw(&self, msg: Message) -> PushOutcome {
        self.queue.push_control(msg)
    }

    /// Current subscription scope.
    pub fn scope(&self) -> SubscriptionScope {
        if self.is_global() {
            SubscriptionScope::Global
        } else {
            SubscriptionScope::Calls(self.calls.iter().map(|c| c.clone()).collect())
        }
    }

    pub fn is_global(&self) -> bool {
        self.global.load(Ordering::Acquire)
    }

    /// Check if this connection is subscribed to a call explicitly.
    pub fn is_subscribed(&self, call_id: &str) -> bool {
        self.calls.contains(call_id)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.queue.close();
    }

    /// Update the last ping timestamp.
    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Get the last ping timestamp.
    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }
}
