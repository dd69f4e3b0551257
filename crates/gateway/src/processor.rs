//! Seam to the conversation-processing pipeline.
//!
//! Intent/sentiment analysis, persona selection and response ranking live
//! outside the gateway. They plug in through [`CallProcessor`]; the gateway
//! only forwards producer input and distributes whatever updates come back.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CallStatus, CallUpdate, Speaker};
use dashmap::DashMap;
use std::time::Instant;
use tracing::{info, warn};

/// Trait implemented by the processing pipeline.
/// The WebSocket handler calls these methods as control messages arrive.
#[async_trait]
pub trait CallProcessor: Send + Sync + 'static {
    /// A call stream was opened.
    async fn start_call(&self, call_id: &str, customer_id: &str) -> Result<()>;

    /// Process one decoded utterance and return the resulting snapshot.
    async fn process_utterance(
        &self,
        call_id: &str,
        text: &str,
        speaker: Speaker,
    ) -> Result<CallUpdate>;

    /// The agent picked a ranked response. Feedback for the ranking model.
    async fn record_response_selection(&self, _call_id: &str, _response_id: &str) -> Result<()> {
        Ok(())
    }

    /// A call stream was closed.
    async fn end_call(&self, _call_id: &str, _outcome: Option<&serde_json::Value>) -> Result<()> {
        Ok(())
    }
}

/// Bookkeeping for an open call.
#[derive(Debug, Clone)]
pub struct ActiveCall {
    pub customer_id: String,
    pub started_at: DateTime<Utc>,
    pub utterances: usize,
    pub selected_response_id: Option<String>,
}

/// Processor that attaches no analysis: every utterance becomes a call update
/// carrying just the transcript. Customer speech is `complete`; agent speech is
/// reported as `pending` since nothing downstream analyses it.
#[derive(Default)]
pub struct TranscriptProcessor {
    calls: DashMap<String, ActiveCall>,
}

impl TranscriptProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of an open call.
    pub fn call(&self, call_id: &str) -> Option<ActiveCall> {
        self.calls.get(call_id).map(|c| c.clone())
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }
}

#[async_trait]
impl CallProcessor for TranscriptProcessor {
    async fn start_call(&self, call_id: &str, customer_id: &str) -> Result<()> {
        self.calls.insert(
            call_id.to_string(),
            ActiveCall {
                customer_id: customer_id.to_string(),
                started_at: Utc::now(),
                utterances: 0,
                selected_response_id: None,
            },
        );
        info!("Started call {} for customer {}", call_id, customer_id);
        Ok(())
    }

    async fn process_utterance(
        &self,
        call_id: &str,
        text: &str,
        speaker: Speaker,
    ) -> Result<CallUpdate> {
        let started = Instant::now();

        if !self.calls.contains_key(call_id) {
            warn!("Call {} not started, opening it implicitly", call_id);
            self.start_call(call_id, "unknown").await?;
        }
        if let Some(mut call) = self.calls.get_mut(call_id) {
            call.utterances += 1;
        }

        let status = match speaker {
            Speaker::Customer => CallStatus::Complete,
            Speaker::Agent => CallStatus::Pending,
        };
        let mut update = CallUpdate::new(call_id, status);
        update.transcript = Some(text.to_string());
        update.speaker = Some(speaker);
        update.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
        Ok(update)
    }

    async fn record_response_selection(&self, call_id: &str, response_id: &str) -> Result<()> {
        let mut call = self
            .calls
            .get_mut(call_id)
            .ok_or_else(|| GatewayError::Processor(format!("call {call_id} not active")))?;
        call.selected_response_id = Some(response_id.to_string());
        info!("Recorded response selection {} for call {}", response_id, call_id);
        Ok(())
    }

    async fn end_call(&self, call_id: &str, outcome: Option<&serde_json::Value>) -> Result<()> {
        match self.calls.remove(call_id) {
            Some((_, call)) => {
                let duration = Utc::now() - call.started_at;
                info!(
                    "Ended call {} after {}s ({} utterances), outcome: {:?}",
                    call_id,
                    duration.num_seconds(),
                    call.utterances,
                    outcome
                );
            }
            None => warn!("Call {} not found", call_id),
        }
        Ok(())
    }
}
