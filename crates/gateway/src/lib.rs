//! Gateway service for live call-update fan-out to WebSocket dashboards.
//!
//! This service:
//! - Accepts WebSocket connections from dashboards and producers
//! - Tracks which calls each connection follows (or whether it follows all)
//! - Hands producer input to a [`CallProcessor`]
//! - Routes the resulting call updates to every interested connection
//!
//! ## Architecture
//!
//! ```text
//! producers ──► ws_server ──► CallProcessor
//!                                  │
//!                        mpsc<CallUpdate>
//!                                  ↓
//!                           MessageRouter
//!                                  ↓
//!              ConnectionRegistry (DashMap, call_id index)
//!                                  ↓
//!               per-connection OutboundQueue (drop-oldest)
//!                                  ↓
//!                          WebSocket dashboards
//! ```
//!
//! ## Low-Latency Design
//!
//! - Lock-free registry using DashMap, indexed by call id
//! - Each update serialized once and shared across targets
//! - Bounded per-connection queues that shed the oldest frame when full

pub mod config;
pub mod connection;
pub mod error;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod router;
pub mod ws_server;

pub use config::GatewayConfig;
pub use connection::{ConnectionId, ConnectionState, SubscriptionScope};
pub use error::{GatewayError, Result};
pub use processor::{ActiveCall, CallProcessor, TranscriptProcessor};
pub use queue::{OutboundQueue, PushOutcome, DEFAULT_QUEUE_CAPACITY};
pub use registry::ConnectionRegistry;
pub use router::{DispatchReport, MessageRouter, RouterConfig};
pub use ws_server::{create_router, AppState, ConnectParams};
