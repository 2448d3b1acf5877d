//! User sessions on a device.
//!
//! A [`Session`] is the unit of interruption: blocking sends started from
//! a session abort with `Interrupted` once the session's interrupt flag is
//! raised, the way a signalled task abandons a kernel wait. Sessions are
//! cheap to clone and to open; every user-facing operation goes through
//! one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::buffer::Buffer;
use crate::capabilities::Capabilities;
use crate::device::{DeviceShared, DriverVersion, DRIVER_VERSION};
use crate::error::{AevumError, Result};
use crate::network::{Network, NetworkSpec};

/// Minimum interval between pings actually put on the wire; faster pings
/// succeed without sending.
const PING_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// One user session on an Aevum device.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<DeviceShared>,
    interrupted: Arc<AtomicBool>,
}

impl Session {
    pub(crate) fn new(shared: Arc<DeviceShared>) -> Self {
        Self {
            shared,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The host driver's own version, independent of the wire protocol.
    pub fn driver_version(&self) -> DriverVersion {
        DRIVER_VERSION
    }

    /// Capabilities captured during startup.
    ///
    /// # Errors
    ///
    /// `NoDevice` if the device never completed its startup handshake.
    pub fn capabilities(&self) -> Result<Capabilities> {
        self.shared.caps.get().copied().ok_or(AevumError::NoDevice)
    }

    /// Send a liveness probe to the firmware.
    ///
    /// Rate-limited: pings within 100 ms of the previous one return
    /// success without touching the wire, so a tight ping loop cannot
    /// starve the transmit-slot pool.
    ///
    /// # Errors
    ///
    /// Any mailbox send error.
    pub fn ping(&self) -> Result<()> {
        let mut st = self.shared.mailbox.lock();
        if let Some(last) = st.last_ping {
            if last.elapsed() < PING_MIN_INTERVAL {
                debug!("Ping throttled");
                return Ok(());
            }
        }
        st.last_ping = Some(Instant::now());
        self.shared.mailbox.ping(&mut st, self.interrupt_flag())
    }

    /// Create a DMA-backed buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero size, `OutOfMemory` when the carveout
    /// is exhausted.
    pub fn buffer_create(&self, size: usize) -> Result<Buffer> {
        Buffer::create(self.shared.dma.as_ref(), size)
    }

    /// Create a network from user weights or a firmware index.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for empty weights, `OutOfMemory` or `Faulted`
    /// when the copy-in fails.
    pub fn network_create(&self, spec: NetworkSpec<'_>) -> Result<Network> {
        Network::create(Arc::clone(&self.shared), spec)
    }

    /// Abort this session's blocked sends with `Interrupted`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Relaxed);
        self.shared.mailbox.wake_senders();
    }

    /// Clear a previously raised interrupt so the session is usable again.
    pub fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Relaxed);
    }

    pub(crate) fn interrupt_flag(&self) -> Option<&AtomicBool> {
        Some(&self.interrupted)
    }
}
