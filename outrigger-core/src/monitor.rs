//! Session observability callbacks.

use crate::error::{HandlerError, ProtocolState};
use crate::profile::SessionProfile;

/// Lifecycle, warning, and handler-error notifications for one session.
///
/// All callbacks may be invoked from executor threads; implementations must
/// not block for long.
pub trait Monitor: Send + Sync {
    fn on_session_created(&self, _profile: &SessionProfile) {}

    /// Invoked exactly once when a session transitions to expired.
    fn on_session_expired(&self, _profile: &SessionProfile) {}

    /// Recoverable error while receiving; the session stays active.
    fn on_receive_warning(&self, _profile: &SessionProfile, _state: ProtocolState) {}

    /// A service handler failed or panicked.
    fn on_handler_error(&self, _profile: &SessionProfile, _error: &HandlerError) {}
}

/// Monitor that ignores every event.
#[derive(Debug, Default)]
pub struct NullMonitor;

impl Monitor for NullMonitor {}

/// Monitor that forwards events to `tracing`.
#[derive(Debug, Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn on_session_created(&self, profile: &SessionProfile) {
        tracing::debug!(peer = %profile.peer_name(), id = profile.local_id(), "session created");
    }

    fn on_session_expired(&self, profile: &SessionProfile) {
        let (read, written) = profile.totals();
        tracing::debug!(
            peer = %profile.peer_name(),
            id = profile.local_id(),
            read,
            written,
            "session expired"
        );
    }

    fn on_receive_warning(&self, profile: &SessionProfile, state: ProtocolState) {
        tracing::warn!(peer = %profile.peer_name(), ?state, "receive warning");
    }

    fn on_handler_error(&self, profile: &SessionProfile, error: &HandlerError) {
        tracing::warn!(peer = %profile.peer_name(), %error, "handler error");
    }
}
