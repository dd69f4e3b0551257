//! Folds the stream of call updates into one view per call.
//!
//! Every rule here is idempotent: applying an update that was already applied
//! leaves the aggregate unchanged. Transcript entries are deduplicated on
//! `(text, timestamp)`, the latency average remembers which samples it has
//! folded, and the remaining fields are overwritten with identical values.

use crate::error::{DashboardError, Result};
use chrono::{DateTime, Utc};
use common::{
    CallStatus, CallUpdate, CustomerContext, Interpretation, RankedResponse, ServerMessage,
    Speaker,
};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Default EMA weight: an equal blend of the previous average and the new sample.
pub const DEFAULT_LATENCY_WEIGHT: f64 = 0.5;

/// Latency samples remembered for deduplication.
const SEEN_SAMPLES: usize = 64;

/// One line of the folded transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub text: String,
    pub speaker: Speaker,
    pub timestamp: DateTime<Utc>,
}

/// Exponential moving average of reported processing latency.
///
/// Display smoothing only. Samples are keyed by `(update timestamp, latency)`
/// so a re-delivered update does not move the average.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyAverage {
    /// Current average, `None` until the first sample.
    pub average_ms: Option<f64>,
    /// Samples folded so far.
    pub samples: u64,
    #[serde(skip)]
    seen: VecDeque<(DateTime<Utc>, u64)>,
}

impl LatencyAverage {
    fn observe(&mut self, timestamp: DateTime<Utc>, latency_ms: f64, weight: f64) {
        let key = (timestamp, latency_ms.to_bits());
        if self.seen.contains(&key) {
            return;
        }
        if self.seen.len() == SEEN_SAMPLES {
            self.seen.pop_front();
        }
        self.seen.push_back(key);

        self.average_ms = Some(match self.average_ms {
            None => latency_ms,
            Some(prev) => weight * latency_ms + (1.0 - weight) * prev,
        });
        self.samples += 1;
    }
}

/// Client-side view of a single call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallAggregate {
    pub call_id: String,
    /// Status of the most recently applied update.
    pub status: CallStatus,
    /// Deduplicated transcript, ordered by `(timestamp, text)`.
    pub transcript: Vec<TranscriptEntry>,
    pub interpretation: Option<Interpretation>,
    /// Latest ranked responses snapshot.
    pub ranked_responses: Vec<RankedResponse>,
    pub customer_context: Option<CustomerContext>,
    pub latency: LatencyAverage,
    /// Error reported by the most recently applied update.
    pub error: Option<String>,
}

impl CallAggregate {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            ..Self::default()
        }
    }

    /// Top-ranked suggestion, if any.
    pub fn top_response(&self) -> Option<&RankedResponse> {
        self.ranked_responses.first()
    }
}

/// Applies call updates to aggregates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciler {
    latency_weight: f64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            latency_weight: DEFAULT_LATENCY_WEIGHT,
        }
    }
}

impl Reconciler {
    /// Create a reconciler with the given EMA weight for new latency samples.
    /// The weight must be in `(0, 1]`.
    pub fn new(latency_weight: f64) -> Result<Self> {
        if !(latency_weight > 0.0 && latency_weight <= 1.0) {
            return Err(DashboardError::Config(format!(
                "latency weight must be in (0, 1], got {latency_weight}"
            )));
        }
        Ok(Self { latency_weight })
    }

    pub fn latency_weight(&self) -> f64 {
        self.latency_weight
    }

    /// Fold `update` into `aggregate` and return the result.
    pub fn apply(&self, mut aggregate: CallAggregate, update: &CallUpdate) -> CallAggregate {
        self.fold(&mut aggregate, update);
        aggregate
    }

    /// In-place variant of [`apply`](Self::apply).
    pub fn fold(&self, aggregate: &mut CallAggregate, update: &CallUpdate) {
        if aggregate.call_id.is_empty() {
            aggregate.call_id = update.call_id.clone();
        }

        if let Some(text) = update.transcript.as_deref().filter(|t| !t.is_empty()) {
            insert_transcript(
                &mut aggregate.transcript,
                TranscriptEntry {
                    text: text.to_string(),
                    speaker: update.speaker.unwrap_or_default(),
                    timestamp: update.timestamp,
                },
            );
        }

        if let Some(interpretation) = &update.interpretation {
            aggregate.interpretation = Some(interpretation.clone());
        }

        // Absent means "no new ranking", e.g. pending updates.
        if let Some(responses) = &update.ranked_responses {
            aggregate.ranked_responses = responses.clone();
        }

        if let Some(incoming) = &update.customer_context {
            aggregate
                .customer_context
                .get_or_insert_with(CustomerContext::default)
                .merge_from(incoming);
        }

        if let Some(latency) = update.latency_ms {
            aggregate
                .latency
                .observe(update.timestamp, latency, self.latency_weight);
        }

        aggregate.status = update.status;
        aggregate.error = update.error.clone();
    }
}

/// Fold with the default reconciler.
pub fn apply(aggregate: CallAggregate, update: &CallUpdate) -> CallAggregate {
    Reconciler::default().apply(aggregate, update)
}

fn insert_transcript(transcript: &mut Vec<TranscriptEntry>, entry: TranscriptEntry) {
    let key = (entry.timestamp, entry.text.as_str());
    match transcript.binary_search_by(|e| (e.timestamp, e.text.as_str()).cmp(&key)) {
        Ok(_) => {}
        Err(pos) => transcript.insert(pos, entry),
    }
}

/// Aggregates for every call a dashboard has seen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallBoard {
    reconciler: Reconciler,
    calls: BTreeMap<String, CallAggregate>,
}

impl CallBoard {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler,
            calls: BTreeMap::new(),
        }
    }

    /// Fold a call update into its call's aggregate.
    pub fn apply(&mut self, update: &CallUpdate) -> &CallAggregate {
        let aggregate = self
            .calls
            .entry(update.call_id.clone())
            .or_insert_with(|| CallAggregate::new(update.call_id.clone()));
        self.reconciler.fold(aggregate, update);
        aggregate
    }

    /// Apply a server frame. Returns whether the board changed.
    ///
    /// `call_update` frames are folded and `call_ended` drops the call; every
    /// other frame is ignored.
    pub fn apply_frame(&mut self, frame: &ServerMessage) -> bool {
        match frame {
            ServerMessage::CallUpdate(update) => {
                let before = self.calls.get(&update.call_id).cloned();
                let after = self.apply(update);
                before.as_ref() != Some(after)
            }
            ServerMessage::CallEnded { call_id } => self.remove(call_id).is_some(),
            other => {
                debug!("Ignoring frame {:?}", other);
                false
            }
        }
    }

    pub fn get(&self, call_id: &str) -> Option<&CallAggregate> {
        self.calls.get(call_id)
    }

    pub fn remove(&mut self, call_id: &str) -> Option<CallAggregate> {
        self.calls.remove(call_id)
    }

    /// All aggregates, ordered by call id.
    pub fn calls(&self) -> impl Iterator<Item = &CallAggregate> {
        self.calls.values()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{CustomerProfile, IntentResult};
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn utterance(text: &str, secs: i64) -> CallUpdate {
        let mut update = CallUpdate::new("c1", CallStatus::Complete);
        update.transcript = Some(text.to_string());
        update.timestamp = at(secs);
        update
    }

    fn responses(n: u32) -> Vec<RankedResponse> {
        (1..=n)
            .map(|rank| RankedResponse {
                id: format!("r{rank}"),
                text: format!("response {rank}"),
                rank,
                score: 1.0 / rank as f64,
                breakdown: None,
                predicted_reactions: None,
            })
            .collect()
    }

    #[test]
    fn test_transcript_dedup() {
        let a = utterance("hello", 1);
        let agg = apply(CallAggregate::default(), &a);
        let agg = apply(agg, &a);
        assert_eq!(agg.transcript.len(), 1);

        // Same text at another time is a new line.
        let agg = apply(agg, &utterance("hello", 2));
        assert_eq!(agg.transcript.len(), 2);
    }

    #[test]
    fn test_transcript_ordered_under_reordering() {
        let first = utterance("first", 1);
        let second = utterance("second", 2);

        let forward = apply(apply(CallAggregate::default(), &first), &second);
        let backward = apply(apply(CallAggregate::default(), &second), &first);

        assert_eq!(forward.transcript, backward.transcript);
        assert_eq!(forward.transcript[0].text, "first");
    }

    #[test]
    fn test_ranked_responses_full_replace() {
        let mut u1 = utterance("a", 1);
        u1.ranked_responses = Some(responses(3));
        let mut u2 = utterance("b", 2);
        u2.ranked_responses = Some(responses(2));

        let agg = apply(apply(CallAggregate::default(), &u1), &u2);
        assert_eq!(agg.ranked_responses.len(), 2);
        assert_eq!(agg.top_response().unwrap().id, "r1");
    }

    #[test]
    fn test_pending_update_keeps_ranking() {
        let mut u1 = utterance("a", 1);
        u1.ranked_responses = Some(responses(3));
        let mut pending = CallUpdate::new("c1", CallStatus::Pending);
        pending.timestamp = at(2);

        let agg = apply(apply(CallAggregate::default(), &u1), &pending);
        assert_eq!(agg.ranked_responses.len(), 3);
        assert_eq!(agg.status, CallStatus::Pending);

        let mut cleared = utterance("b", 3);
        cleared.ranked_responses = Some(Vec::new());
        let agg = apply(agg, &cleared);
        assert!(agg.ranked_responses.is_empty());
    }

    #[test]
    fn test_interpretation_last_write_wins() {
        let mut u1 = utterance("a", 1);
        u1.interpretation = Some(Interpretation {
            intent: Some(IntentResult {
                intent: "billing_inquiry".to_string(),
                confidence: 0.9,
            }),
            ..Interpretation::default()
        });
        let mut u2 = utterance("b", 2);
        u2.interpretation = Some(Interpretation {
            intent: Some(IntentResult {
                intent: "cancel_service".to_string(),
                confidence: 0.7,
            }),
            ..Interpretation::default()
        });

        let agg = apply(apply(CallAggregate::default(), &u1), &u2);
        let intent = agg.interpretation.unwrap().intent.unwrap();
        assert_eq!(intent.intent, "cancel_service");
    }

    #[test]
    fn test_customer_context_merge() {
        let mut u1 = utterance("a", 1);
        u1.customer_context = Some(CustomerContext {
            customer_type: Some("frustrated".to_string()),
            selected_persona: Some("empathetic".to_string()),
            customer_profile: Some(CustomerProfile {
                customer_id: Some("cust_1".to_string()),
                total_calls: Some(4),
                ..CustomerProfile::default()
            }),
        });
        let mut u2 = utterance("b", 2);
        u2.customer_context = Some(CustomerContext {
            selected_persona: Some("efficient".to_string()),
            ..CustomerContext::default()
        });

        let agg = apply(apply(CallAggregate::default(), &u1), &u2);
        let ctx = agg.customer_context.unwrap();
        assert_eq!(ctx.customer_type.as_deref(), Some("frustrated"));
        assert_eq!(ctx.selected_persona.as_deref(), Some("efficient"));
        assert_eq!(ctx.customer_profile.unwrap().total_calls, Some(4));
    }

    #[test]
    fn test_latency_ema() {
        let reconciler = Reconciler::new(0.5).unwrap();
        let mut u1 = utterance("a", 1);
        u1.latency_ms = Some(100.0);
        let mut u2 = utterance("b", 2);
        u2.latency_ms = Some(300.0);

        let agg = reconciler.apply(CallAggregate::default(), &u1);
        assert_eq!(agg.latency.average_ms, Some(100.0));

        let agg = reconciler.apply(agg, &u2);
        assert_eq!(agg.latency.average_ms, Some(200.0));

        // Re-delivery does not move the average.
        let agg = reconciler.apply(agg, &u2);
        assert_eq!(agg.latency.average_ms, Some(200.0));
        assert_eq!(agg.latency.samples, 2);
    }

    #[test]
    fn test_invalid_weight() {
        assert!(Reconciler::new(0.0).is_err());
        assert!(Reconciler::new(1.5).is_err());
        assert!(Reconciler::new(f64::NAN).is_err());
        assert!(Reconciler::new(1.0).is_ok());
    }

    #[test]
    fn test_error_status() {
        let agg = apply(CallAggregate::default(), &utterance("a", 1));
        let agg = apply(agg, &CallUpdate::failed("c1", "classifier timeout"));
        assert_eq!(agg.status, CallStatus::Error);
        assert_eq!(agg.error.as_deref(), Some("classifier timeout"));
        assert_eq!(agg.transcript.len(), 1);
    }

    #[test]
    fn test_board_frames() {
        let mut board = CallBoard::default();
        let update = utterance("hello", 1);

        assert!(board.apply_frame(&ServerMessage::CallUpdate(update.clone())));
        assert!(!board.apply_frame(&ServerMessage::CallUpdate(update)));
        assert!(!board.apply_frame(&ServerMessage::Pong));
        assert_eq!(board.len(), 1);
        assert_eq!(board.get("c1").unwrap().transcript.len(), 1);

        assert!(board.apply_frame(&ServerMessage::CallEnded {
            call_id: "c1".to_string()
        }));
        assert!(board.is_empty());
    }

    fn arb_update() -> impl Strategy<Value = CallUpdate> {
        (
            prop::option::of("[a-z ]{0,12}"),
            0i64..5,
            prop::option::of(0.0f64..5000.0),
            0u32..4,
            prop::bool::ANY,
            prop::sample::select(vec![
                CallStatus::Pending,
                CallStatus::Complete,
                CallStatus::Error,
            ]),
        )
            .prop_map(|(text, secs, latency, n, with_ranking, status)| {
                let mut update = CallUpdate::new("c1", status);
                update.transcript = text;
                update.timestamp = at(secs);
                update.latency_ms = latency;
                if with_ranking {
                    update.ranked_responses = Some(responses(n));
                }
                if status == CallStatus::Error {
                    update.error = Some("failed".to_string());
                }
                update
            })
    }

    proptest! {
        #[test]
        fn apply_is_idempotent(
            history in proptest::collection::vec(arb_update(), 0..8),
            update in arb_update(),
        ) {
            let base = history
                .iter()
                .fold(CallAggregate::default(), |agg, u| apply(agg, u));
            let once = apply(base, &update);
            let twice = apply(once.clone(), &update);
            prop_assert_eq!(once, twice);
        }
    }
}
