//! Location source abstraction.

use crate::types::PathPoint;
use async_trait::async_trait;

/// One item of the push feed produced by the device location provider.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationSignal {
    /// A new GPS fix
    Fix(PathPoint),

    /// The user revoked location permission; the UI must surface this
    PermissionDenied,

    /// The provider is temporarily unable to deliver fixes
    Unavailable(String),
}

/// Abstraction over the device's live location feed.
///
/// # Implementations
///
/// - **Production**: `ChannelLocationSource`, fed by the platform callback
/// - **Simulation**: a scripted source replaying a generated walk
///
/// ```text
/// Platform GPS callback          Source                 Runtime
///   |-- fix ------------------->|                          |
///   |                           |-- next_signal() -------->|
///   |                           |                          |-- report_location()
/// ```
#[async_trait]
pub trait LocationSource: Send + Sync + 'static {
    /// Waits for the next signal.
    ///
    /// # Returns
    /// * `Some(signal)` - A fix or a provider status change
    /// * `None` - The feed is closed (shutdown)
    async fn next_signal(&self) -> Option<LocationSignal>;
}
