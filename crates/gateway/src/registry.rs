//! Connection registry and subscription index.
//!
//! Uses lock-free DashMap for high-throughput concurrent access.
//!
//! Subscriptions are indexed by call id, so resolving the targets of an update
//! costs O(subscribers of the call + global connections) and never scans the
//! full connection table.

use crate::connection::{ConnectionId, ConnectionState};
use crate::error::{GatewayError, Result};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Registry of live connections.
///
/// Maintains:
/// - Connection ID → connection state
/// - Call ID → subscribed connection IDs
/// - The set of global connection IDs
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
    by_call: DashMap<String, DashSet<ConnectionId>>,
    globals: DashSet<ConnectionId>,
    queue_capacity: usize,
}

impl ConnectionRegistry {
    /// Create a new empty registry with the default queue capacity.
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a registry whose connections get outbound queues of `capacity`.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            by_call: DashMap::new(),
            globals: DashSet::new(),
            queue_capacity: capacity,
        }
    }

    /// Register a new connection. It starts with an empty scope.
    pub fn register(&self) -> ConnectionId {
        let conn = Arc::new(ConnectionState::new(self.queue_capacity));
        let id = conn.id;
        self.connections.insert(id, conn);
        info!("Connection {} registered", id);
        id
    }

    /// Unregister a connection, drop its subscriptions and close its queue.
    /// Unknown ids are ignored.
    pub fn unregister(&self, id: &ConnectionId) {
        let Some((_, conn)) = self.connections.remove(id) else {
            return;
        };
        conn.mark_dead();

        for call in conn.calls.iter() {
            self.remove_index_entry(call.key(), id);
        }
        self.globals.remove(id);

        info!("Connection {} unregistered", id);
    }

    /// Get a connection by ID.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionState>> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// Subscribe a connection to a call.
    pub fn subscribe(&self, id: &ConnectionId, call_id: &str) -> Result<()> {
        if call_id.is_empty() {
            return Err(GatewayError::InvalidCallId(call_id.to_string()));
        }
        let conn = self.get(id).ok_or(GatewayError::ConnectionNotFound(*id))?;

        conn.calls.insert(call_id.to_string());
        self.by_call
            .entry(call_id.to_string())
            .or_default()
            .insert(*id);

        // Lost a race with unregister: undo so the index holds no dead ids.
        if !conn.is_alive() {
            self.remove_index_entry(call_id, id);
            return Err(GatewayError::ConnectionNotFound(*id));
        }

        debug!("Connection {} subscribed to {}", id, call_id);
        Ok(())
    }

    /// Unsubscribe a connection from a call. Absent subscriptions are a no-op.
    pub fn unsubscribe(&self, id: &ConnectionId, call_id: &str) -> Result<()> {
        let conn = self.get(id).ok_or(GatewayError::ConnectionNotFound(*id))?;

        if conn.calls.remove(call_id).is_some() {
            self.remove_index_entry(call_id, id);
            debug!("Connection {} unsubscribed from {}", id, call_id);
        }
        Ok(())
    }

    /// Mark a connection as global: it receives updates for every call.
    pub fn mark_global(&self, id: &ConnectionId) -> Result<()> {
        let conn = self.get(id).ok_or(GatewayError::ConnectionNotFound(*id))?;

        conn.global.store(true, Ordering::Release);
        self.globals.insert(*id);

        if !conn.is_alive() {
            self.globals.remove(id);
            return Err(GatewayError::ConnectionNotFound(*id));
        }

        debug!("Connection {} marked global", id);
        Ok(())
    }

    /// IDs of connections subscribed to `call_id` plus all global connections.
    pub fn targets_for(&self, call_id: &str) -> HashSet<ConnectionId> {
        let mut targets = HashSet::new();
        if let Some(ids) = self.by_call.get(call_id) {
            targets.extend(ids.iter().map(|id| *id));
        }
        targets.extend(self.globals.iter().map(|id| *id));
        targets.retain(|id| self.connections.contains_key(id));
        targets
    }

    /// Connection states for [`targets_for`](Self::targets_for).
    pub fn resolve_targets(&self, call_id: &str) -> Vec<Arc<ConnectionState>> {
        self.targets_for(call_id)
            .into_iter()
            .filter_map(|id| self.get(&id))
            .collect()
    }

    /// Get the total number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of calls with at least one subscriber.
    pub fn subscription_count(&self) -> usize {
        self.by_call.len()
    }

    /// Number of global connections.
    pub fn global_count(&self) -> usize {
        self.globals.len()
    }

    /// Remove connections that haven't pinged in `max_idle_ms`.
    pub fn cleanup_stale(&self, max_idle_ms: i64) -> Vec<ConnectionId> {
        let now = Utc::now().timestamp_millis();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| now - entry.value().last_ping_time() > max_idle_ms)
            .map(|entry| *entry.key())
            .collect();

        for id in &stale {
            warn!("Removing stale connection {}", id);
            self.unregister(id);
        }
        stale
    }

    /// Unregister every connection. Used at shutdown.
    pub fn drain(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        for id in &ids {
            self.unregister(id);
        }
        info!("Drained {} connections", ids.len());
        ids.len()
    }

    fn remove_index_entry(&self, call_id: &str, id: &ConnectionId) {
        if let Some(ids) = self.by_call.get(call_id) {
            ids.remove(id);
        }
        self.by_call.remove_if(call_id, |_, ids| ids.is_empty());
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
