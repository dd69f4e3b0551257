//! Common types and utilities for the call relay.
//!
//! - [`update`]: the `CallUpdate` snapshot distributed to dashboards
//! - [`protocol`]: inbound control frames and outbound server frames
//! - [`decoder`]: base64 / hex / plain normalization of producer text

pub mod decoder;
pub mod error;
pub mod protocol;
pub mod update;

pub use decoder::{decode, Decoded, EncodingMethod};
pub use error::{Error, Result};
pub use protocol::{ClientMessage, ServerMessage};
pub use update::{
    CallStatus, CallUpdate, CustomerContext, CustomerProfile, Entity, IntentResult,
    Interpretation, PredictedReaction, RankedResponse, ScoreBreakdown, SentimentResult, Speaker,
};
