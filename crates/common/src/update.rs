//! Call update schema: the snapshot of processing results distributed to dashboards.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Processing status of a call update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Transcript accepted, no analysis attached yet.
    #[default]
    Pending,
    /// Full analysis attached.
    Complete,
    /// Processing failed; `error` carries the reason.
    Error,
}

/// Who produced an utterance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    #[default]
    Customer,
    Agent,
}

/// Intent classification result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntentResult {
    /// Intent label (e.g., "billing_inquiry").
    pub intent: String,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

/// Sentiment analysis result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentimentResult {
    /// Sentiment label ("positive", "neutral", "negative").
    pub sentiment: String,
    /// Polarity in [-1, 1].
    pub polarity: f64,
    pub confidence: f64,
    /// Dominant emotion (e.g., "frustrated").
    pub emotion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subjectivity: Option<f64>,
}

/// Named entity extracted from an utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub text: String,
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub confidence: f64,
}

/// Interpretation of the latest customer utterance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Interpretation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment: Option<SentimentResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<Entity>,
}

/// Per-criterion contributions to a response score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub resolution_probability: f64,
    pub satisfaction_estimate: f64,
    pub sentiment_improvement: f64,
    pub efficiency: f64,
}

/// A predicted customer reaction to a suggested response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictedReaction {
    pub customer_response: String,
    pub probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resulting_sentiment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_likelihood: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

/// A suggested agent response with its ranking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedResponse {
    pub id: String,
    pub text: String,
    /// 1 is the top recommendation.
    pub rank: u32,
    /// Score in [0, 1].
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_reactions: Option<Vec<PredictedReaction>>,
}

/// Aggregated customer history attached by the persona selector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CustomerProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_calls: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfaction_avg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_persona: Option<String>,
}

impl CustomerProfile {
    /// Overwrite fields that are set in `other`, keep the rest.
    pub fn merge_from(&mut self, other: &CustomerProfile) {
        merge_field(&mut self.customer_id, &other.customer_id);
        merge_field(&mut self.total_calls, &other.total_calls);
        merge_field(&mut self.satisfaction_avg, &other.satisfaction_avg);
        merge_field(&mut self.resolution_rate, &other.resolution_rate);
        merge_field(&mut self.preferred_persona, &other.preferred_persona);
    }
}

/// Customer classification and persona selection for a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CustomerContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_profile: Option<CustomerProfile>,
}

impl CustomerContext {
    /// Field-wise merge: set fields in `other` win, unset fields leave `self` alone.
    pub fn merge_from(&mut self, other: &CustomerContext) {
        merge_field(&mut self.customer_type, &other.customer_type);
        merge_field(&mut self.selected_persona, &other.selected_persona);
        if let Some(incoming) = &other.customer_profile {
            self.customer_profile
                .get_or_insert_with(CustomerProfile::default)
                .merge_from(incoming);
        }
    }
}

fn merge_field<T: Clone>(current: &mut Option<T>, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *current = Some(value.clone());
    }
}

/// Snapshot of processing results for one call at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallUpdate {
    pub call_id: String,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<Speaker>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpretation: Option<Interpretation>,
    /// Absent means "no new ranking"; present replaces the previous ranking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ranked_responses: Option<Vec<RankedResponse>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_context: Option<CustomerContext>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallUpdate {
    /// A bare update for `call_id` stamped now.
    pub fn new(call_id: impl Into<String>, status: CallStatus) -> Self {
        Self {
            call_id: call_id.into(),
            status,
            transcript: None,
            speaker: None,
            interpretation: None,
            ranked_responses: None,
            customer_context: None,
            timestamp: Utc::now(),
            latency_ms: None,
            error: None,
        }
    }

    /// An error-status update carrying `message`.
    pub fn failed(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(call_id, CallStatus::Error)
        }
    }

    /// Check the structural invariants before the update is distributed.
    pub fn validate(&self) -> Result<()> {
        if self.call_id.is_empty() {
            return Err(Error::InvalidUpdate("empty call_id".to_string()));
        }

        if let Some(latency) = self.latency_ms {
            if !latency.is_finite() || latency < 0.0 {
                return Err(Error::InvalidUpdate(format!(
                    "latency_ms must be a non-negative number, got {latency}"
                )));
            }
        }

        if let Some(responses) = &self.ranked_responses {
            let mut ranks = HashSet::with_capacity(responses.len());
            let mut previous = 0;
            for response in responses {
                if !(0.0..=1.0).contains(&response.score) {
                    return Err(Error::InvalidUpdate(format!(
                        "response {} score {} outside [0, 1]",
                        response.id, response.score
                    )));
                }
                if !ranks.insert(response.rank) {
                    return Err(Error::InvalidUpdate(format!(
                        "duplicate rank {}",
                        response.rank
                    )));
                }
                if response.rank <= previous {
                    return Err(Error::InvalidUpdate(format!(
                        "ranks must ascend, {} follows {}",
                        response.rank, previous
                    )));
                }
                previous = response.rank;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(rank: u32, score: f64) -> RankedResponse {
        RankedResponse {
            id: format!("resp_{rank}"),
            text: format!("Suggestion {rank}"),
            rank,
            score,
            breakdown: None,
            predicted_reactions: None,
        }
    }

    #[test]
    fn test_validate_accepts_ascending_ranks() {
        let mut update = CallUpdate::new("c1", CallStatus::Complete);
        update.ranked_responses = Some(vec![response(1, 0.9), response(2, 0.7), response(3, 0.1)]);
        update.latency_ms = Some(120.5);
        assert!(update.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_updates() {
        let mut update = CallUpdate::new("", CallStatus::Pending);
        assert!(update.validate().is_err());

        update.call_id = "c1".to_string();
        update.ranked_responses = Some(vec![response(1, 0.9), response(1, 0.8)]);
        assert!(update.validate().is_err());

        update.ranked_responses = Some(vec![response(2, 0.9), response(1, 0.8)]);
        assert!(update.validate().is_err());

        update.ranked_responses = Some(vec![response(1, 1.5)]);
        assert!(update.validate().is_err());

        update.ranked_responses = None;
        update.latency_ms = Some(-1.0);
        assert!(update.validate().is_err());
    }

    #[test]
    fn test_wire_field_names() {
        let mut update = CallUpdate::new("c1", CallStatus::Complete);
        update.transcript = Some("I was double charged".to_string());
        update.interpretation = Some(Interpretation {
            intent: Some(IntentResult {
                intent: "billing_inquiry".to_string(),
                confidence: 0.8,
            }),
            sentiment: None,
            entities: Vec::new(),
        });
        update.ranked_responses = Some(vec![response(1, 0.9)]);

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["call_id"], "c1");
        assert_eq!(value["status"], "complete");
        assert_eq!(value["interpretation"]["intent"]["intent"], "billing_inquiry");
        assert_eq!(value["ranked_responses"][0]["rank"], 1);
        assert!(value.get("customer_context").is_none());
    }

    #[test]
    fn test_pending_update_without_optional_fields() {
        let json = r#"{"call_id":"c1","status":"pending","transcript":"hi","timestamp":"2024-01-01T00:00:00Z"}"#;
        let update: CallUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.status, CallStatus::Pending);
        assert_eq!(update.transcript.as_deref(), Some("hi"));
        assert!(update.ranked_responses.is_none());
    }

    #[test]
    fn test_customer_context_merge() {
        let mut current = CustomerContext {
            customer_type: Some("loyal".to_string()),
            selected_persona: Some("empathetic".to_string()),
            customer_profile: Some(CustomerProfile {
                total_calls: Some(4),
                ..CustomerProfile::default()
            }),
        };
        let incoming = CustomerContext {
            customer_type: None,
            selected_persona: Some("efficient".to_string()),
            customer_profile: Some(CustomerProfile {
                satisfaction_avg: Some(0.8),
                ..CustomerProfile::default()
            }),
        };

        current.merge_from(&incoming);

        assert_eq!(current.customer_type.as_deref(), Some("loyal"));
        assert_eq!(current.selected_persona.as_deref(), Some("efficient"));
        let profile = current.customer_profile.unwrap();
        assert_eq!(profile.total_calls, Some(4));
        assert_eq!(profile.satisfaction_avg, Some(0.8));
    }
}
