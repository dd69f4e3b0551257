//! Message router: call updates → connection fan-out.
//!
//! Receives call updates from producers over the ingest channel and pushes
//! them onto the outbound queue of every target connection. Dispatch never
//! waits on a connection: each push is non-blocking and a full queue sheds its
//! oldest frame, so one slow dashboard cannot hold up the others.

use crate::connection::ConnectionState;
use crate::error::Result;
use crate::queue::PushOutcome;
use crate::registry::ConnectionRegistry;
use axum::extract::ws::Utf8Bytes;
use common::{CallUpdate, ServerMessage};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Configuration for the message router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Updates reporting a higher processing latency are logged.
    pub max_latency_ms: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_latency_ms: 3000.0,
        }
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Connections resolved as targets.
    pub targets: usize,
    /// Frames enqueued.
    pub delivered: usize,
    /// Enqueues that displaced an older frame.
    pub displaced: usize,
    /// Targets whose queue had already closed.
    pub closed: usize,
}

/// Borrowing twin of `ServerMessage::CallUpdate`, so dispatch serializes
/// without cloning the update.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    CallUpdate(&'a CallUpdate),
}

/// Routes call updates to subscribed and global connections.
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    config: RouterConfig,
}

impl MessageRouter {
    /// Create a new message router.
    pub fn new(registry: Arc<ConnectionRegistry>, config: RouterConfig) -> Self {
        Self { registry, config }
    }

    /// Run the dispatch loop until shutdown or until every producer is gone.
    pub async fn run(
        self: Arc<Self>,
        mut updates: mpsc::Receiver<CallUpdate>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        info!("MessageRouter running");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("MessageRouter received shutdown signal");
                    break;
                }

                update = updates.recv() => {
                    match update {
                        Some(update) => {
                            if let Err(e) = self.dispatch(&update) {
                                warn!("Failed to dispatch update for {}: {:?}", update.call_id, e);
                                counter!("relay_dispatch_errors_total").increment(1);
                            }
                        }
                        None => {
                            info!("Ingest channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("MessageRouter stopped");
        Ok(())
    }

    /// Validate, serialize once and fan out a call update.
    pub fn dispatch(&self, update: &CallUpdate) -> Result<DispatchReport> {
        update.validate()?;
        counter!("relay_updates_received_total").increment(1);

        if let Some(latency) = update.latency_ms {
            if latency > self.config.max_latency_ms {
                warn!(
                    "Latency {:.0}ms for call {} exceeds target {:.0}ms",
                    latency, update.call_id, self.config.max_latency_ms
                );
            }
        }

        let json = serde_json::to_string(&OutboundFrame::CallUpdate(update))?;
        let report = self.fan_out(&update.call_id, json.into());

        counter!("relay_updates_dispatched_total").increment(1);
        debug!(
            "Routed update for {} ({:?}) to {} connections",
            update.call_id, update.status, report.delivered
        );
        Ok(report)
    }

    /// Fan out any frame about `call_id` with call-update targeting.
    pub fn publish(&self, call_id: &str, msg: &ServerMessage) -> Result<DispatchReport> {
        let json = serde_json::to_string(msg)?;
        Ok(self.fan_out(call_id, json.into()))
    }

    fn fan_out(&self, call_id: &str, frame: Utf8Bytes) -> DispatchReport {
        let targets = self.registry.resolve_targets(call_id);
        let mut report = DispatchReport {
            targets: targets.len(),
            ..DispatchReport::default()
        };

        for conn in targets {
            match deliver(&conn, frame.clone()) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::Displaced => {
                    report.delivered += 1;
                    report.displaced += 1;
                }
                PushOutcome::Closed => report.closed += 1,
            }
        }

        if report.displaced > 0 {
            counter!("relay_frames_displaced_total").increment(report.displaced as u64);
        }
        report
    }
}

fn deliver(conn: &ConnectionState, frame: Utf8Bytes) -> PushOutcome {
    let outcome = conn.push_text(frame);
    match outcome {
        PushOutcome::Displaced => debug!("Connection {} is slow, displaced oldest frame", conn.id),
        PushOutcome::Closed => debug!("Connection {} queue closed, skipping", conn.id),
        PushOutcome::Queued => {}
    }
    outcome
}
