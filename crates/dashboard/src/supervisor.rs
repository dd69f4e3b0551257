//! Connection lifecycle state machine for the dashboard client.
//!
//! ```text
//! Connecting ──open──► Open ──abnormal close / error──► Reconnecting
//!     ▲   │                │                                  │
//!     │   └──error─────────┼──────────────────────────────────┤
//!     │                    └──normal close (1000)──► Closed   │
//!     └────────────────────────retry elapsed──────────────────┘
//! ```
//!
//! The supervisor performs no I/O. Each transition returns a
//! [`SupervisorAction`] that the runtime carries out, and at most one retry is
//! ever pending.

use std::time::Duration;
use tracing::{debug, info, warn};

/// Default delay before a reconnect attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// WebSocket close code for an intentional closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Lifecycle state of the dashboard connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Open,
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    None,
    /// Arm the retry timer.
    ScheduleRetry(Duration),
    /// Disarm the pending retry timer.
    CancelRetry,
    /// Start a connection attempt.
    Connect,
}

/// Reconnect state machine with a single in-flight retry guard.
#[derive(Debug, Clone)]
pub struct ReconnectSupervisor {
    state: ConnectionState,
    retry_delay: Duration,
    retry_pending: bool,
    reconnects: u64,
}

impl Default for ReconnectSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAY)
    }
}

impl ReconnectSupervisor {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            state: ConnectionState::Connecting,
            retry_delay,
            retry_pending: false,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    /// Reconnect attempts started so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    /// Handshake completed.
    pub fn on_open(&mut self) -> SupervisorAction {
        match self.state {
            ConnectionState::Connecting => {
                info!("Connection open");
                self.state = ConnectionState::Open;
            }
            state => debug!("Ignoring open in state {:?}", state),
        }
        SupervisorAction::None
    }

    /// The peer closed the connection, with the close code if one was sent.
    pub fn on_close(&mut self, code: Option<u16>) -> SupervisorAction {
        match (self.state, code) {
            (ConnectionState::Open | ConnectionState::Connecting, Some(NORMAL_CLOSE_CODE)) => {
                info!("Connection closed normally");
                self.state = ConnectionState::Closed;
                SupervisorAction::None
            }
            (ConnectionState::Open | ConnectionState::Connecting, _) => {
                warn!("Connection closed abnormally (code {:?})", code);
                self.enter_reconnecting()
            }
            (state, _) => {
                debug!("Ignoring close in state {:?}", state);
                SupervisorAction::None
            }
        }
    }

    /// Transport error or failed handshake.
    pub fn on_error(&mut self) -> SupervisorAction {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => self.enter_reconnecting(),
            state => {
                debug!("Ignoring error in state {:?}", state);
                SupervisorAction::None
            }
        }
    }

    /// The retry timer fired.
    pub fn on_retry_elapsed(&mut self) -> SupervisorAction {
        if self.state != ConnectionState::Reconnecting {
            debug!("Ignoring retry in state {:?}", self.state);
            return SupervisorAction::None;
        }
        self.retry_pending = false;
        self.reconnects += 1;
        self.state = ConnectionState::Connecting;
        info!("Reconnecting (attempt {})", self.reconnects);
        SupervisorAction::Connect
    }

    /// Caller-initiated shutdown. Always ends in `Closed`.
    pub fn teardown(&mut self) -> SupervisorAction {
        self.state = ConnectionState::Closed;
        if std::mem::take(&mut self.retry_pending) {
            SupervisorAction::CancelRetry
        } else {
            SupervisorAction::None
        }
    }

    fn enter_reconnecting(&mut self) -> SupervisorAction {
        self.state = ConnectionState::Reconnecting;
        if self.retry_pending {
            return SupervisorAction::None;
        }
        self.retry_pending = true;
        SupervisorAction::ScheduleRetry(self.retry_delay)
    }
}
