//! Control messages for runtime subscription management.

/// Commands that can be sent to a running [`DashboardClient`](crate::client::DashboardClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Follow an additional call.
    Subscribe(String),
    /// Stop following a call.
    Unsubscribe(String),
    /// Close the connection and stop reconnecting.
    Teardown,
}
