//! Dashboard side of the call relay.
//!
//! - [`reconciler`]: folds `call_update` frames into one aggregate per call
//! - [`supervisor`]: reconnect state machine
//! - [`client`]: tokio runtime tying both to a gateway WebSocket

pub mod client;
pub mod error;
pub mod messages;
pub mod reconciler;
pub mod supervisor;

pub use client::{ClientConfig, DashboardClient, DashboardHandle};
pub use error::{DashboardError, Result};
pub use messages::ControlCommand;
pub use reconciler::{
    apply, CallAggregate, CallBoard, LatencyAverage, Reconciler, TranscriptEntry,
    DEFAULT_LATENCY_WEIGHT,
};
pub use supervisor::{
    ConnectionState, ReconnectSupervisor, SupervisorAction, DEFAULT_RETRY_DELAY,
    NORMAL_CLOSE_CODE,
};
