//! Contracts for the external collaborators of the runtime core.
//!
//! The runtime does not implement packet delivery or remote-processor
//! lifecycle itself. It assumes a reliable, ordered, length-preserving
//! transport with a finite transmit-slot pool, and a crash sink that
//! restarts the firmware out of band. Both are traits at the seam, in the
//! same spirit as the backend trait the rest of the stack builds on.

use std::fmt::Debug;
use std::sync::Arc;

/// Outcome of a non-blocking send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrySendError {
    /// All transmit slots are in use; retry after one frees.
    NoSlots,
    /// Hard transport failure; the send will not succeed by retrying.
    Failed(String),
}

/// Outbound half of the message transport.
///
/// Implementations deliver each `data` packet intact and in submission
/// order to the firmware endpoint. `try_send` must never block: when the
/// transmit-slot pool is exhausted it reports [`TrySendError::NoSlots`],
/// which the mailbox treats as "suspend and retry".
pub trait Transport: Debug + Send + Sync {
    /// Attempt to transmit one packet without blocking.
    ///
    /// # Errors
    ///
    /// [`TrySendError::NoSlots`] when no transmit slot is free, any other
    /// error for unrecoverable transport failures.
    fn try_send(&self, data: &[u8]) -> std::result::Result<(), TrySendError>;
}

/// Sink for firmware-fatal conditions.
///
/// Invoked on wire error reports, response-wait timeouts and failed
/// cancellations. The expectation is that the implementation restarts the
/// remote processor, during which the device teardown path fails all
/// outstanding requests. Implementations must tolerate being called with
/// the device lock held and must not call back into the runtime.
pub trait CrashReporter: Debug + Send + Sync {
    /// Report that the firmware is considered dead or unresponsive.
    fn report_crash(&self, reason: &str);
}

/// Default crash sink: logs the condition and nothing more.
///
/// Suitable when the remote-processor lifecycle is managed elsewhere.
#[derive(Debug, Default)]
pub struct LogCrashReporter;

impl CrashReporter for LogCrashReporter {
    fn report_crash(&self, reason: &str) {
        tracing::error!("Firmware fatal error: {reason}");
    }
}

impl<T: CrashReporter + ?Sized> CrashReporter for Arc<T> {
    fn report_crash(&self, reason: &str) {
        (**self).report_crash(reason);
    }
}
