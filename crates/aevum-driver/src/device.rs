//! Device facade and protocol dispatcher.
//!
//! [`AevumDevice`] is the outward-facing surface: it owns the mailbox,
//! runs the startup handshake (protocol version, then capabilities), hands
//! out sessions, and demultiplexes every inbound packet back to the right
//! waiter. Teardown broadcasts failure to all outstanding requests and
//! shuts the sender down, so nothing is left parked when the firmware
//! goes away.

use std::sync::{Arc, OnceLock};

use aevum_proto::{wire, Message, Packet};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capabilities::Capabilities;
use crate::dma::DmaAllocator;
use crate::error::{AevumError, Result};
use crate::inference::InferenceInner;
use crate::mailbox::Mailbox;
use crate::session::Session;
use crate::transport::{CrashReporter, Transport};
use crate::{cancel, capabilities, inference, netinfo, version};

/// Host driver version, reported to users independently of the wire
/// protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverVersion {
    /// Major revision.
    pub major: u32,
    /// Minor revision.
    pub minor: u32,
    /// Patch revision.
    pub patch: u32,
}

pub(crate) const DRIVER_VERSION: DriverVersion = DriverVersion {
    major: 0,
    minor: 1,
    patch: 0,
};

/// How many devices may exist in one process.
const DEVICE_MAX: usize = 64;

/// Process-wide device index bitmap, mirroring a chardev minor allocator.
static DEVICE_INDICES: Mutex<[bool; DEVICE_MAX]> = Mutex::new([false; DEVICE_MAX]);

fn claim_index() -> Result<usize> {
    let mut used = DEVICE_INDICES.lock();
    let index = used
        .iter()
        .position(|taken| !taken)
        .ok_or_else(|| AevumError::out_of_memory("no more device indices"))?;
    used[index] = true;
    Ok(index)
}

fn release_index(index: usize) {
    DEVICE_INDICES.lock()[index] = false;
}

/// State shared by the facade, its sessions and every handle.
#[derive(Debug)]
pub(crate) struct DeviceShared {
    pub(crate) name: String,
    index: usize,
    pub(crate) mailbox: Mailbox,
    pub(crate) dma: Arc<dyn DmaAllocator>,
    pub(crate) reporter: Box<dyn CrashReporter>,
    pub(crate) caps: OnceLock<Capabilities>,
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        release_index(self.index);
    }
}

/// An Aevum NPU device: one transport endpoint, one mailbox, many
/// sessions.
#[derive(Debug)]
pub struct AevumDevice {
    shared: Arc<DeviceShared>,
}

impl AevumDevice {
    /// Create a device over an established transport endpoint.
    ///
    /// The device is not usable for capability queries until
    /// [`AevumDevice::probe`] has run the startup handshake.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when the process's device-index space is exhausted.
    pub fn new(
        transport: Arc<dyn Transport>,
        dma: Arc<dyn DmaAllocator>,
        reporter: Box<dyn CrashReporter>,
    ) -> Result<Self> {
        let index = claim_index()?;
        let name = format!("aevum{index}");
        info!("Created Aevum device. name={name}");

        Ok(Self {
            shared: Arc::new(DeviceShared {
                name,
                index,
                mailbox: Mailbox::new(transport),
                dma,
                reporter,
                caps: OnceLock::new(),
            }),
        })
    }

    /// Run the startup handshake: check the protocol version, then fetch
    /// and store capabilities.
    ///
    /// # Errors
    ///
    /// `ProtocolError` on a version mismatch (the capabilities request is
    /// not sent), or any handshake transport/timeout error.
    pub fn probe(&self) -> Result<()> {
        self.shared.version_check().map_err(|e| {
            warn!("Protocol version check failed: {e}");
            e
        })?;

        let caps = self.shared.capabilities_request().map_err(|e| {
            warn!("Failed to get device capabilities: {e}");
            e
        })?;
        let _ = self.shared.caps.set(caps);

        info!(
            "Device {} ready. arch={}, fw={}",
            self.shared.name, caps.arch, caps.firmware
        );
        Ok(())
    }

    /// Device node name (`aevum0`, `aevum1`, ...).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Open a user session.
    pub fn open(&self) -> Session {
        debug!("Device open. name={}", self.shared.name);
        Session::new(Arc::clone(&self.shared))
    }

    /// Entry point for inbound packets; called by the transport owner as
    /// packets arrive.
    ///
    /// # Errors
    ///
    /// `BadMessage` for magic or payload-size violations, `ProtocolError`
    /// for unknown or unexpected message types. Responses whose waiter is
    /// gone are logged and dropped without error.
    pub fn on_packet(&self, data: &[u8]) -> Result<()> {
        self.shared.on_packet(data)
    }

    /// Fail all outstanding requests and shut the sender down. Invoked by
    /// drop; idempotent.
    pub fn teardown(&self) {
        let mut st = self.shared.mailbox.lock();
        let owned = st.fail_all();
        drop(st);
        self.shared.mailbox.shutdown();
        // The mailbox's inference references must not drop under the lock.
        drop(owned);
    }
}

impl Drop for AevumDevice {
    fn drop(&mut self) {
        info!("Removing Aevum device. name={}", self.shared.name);
        self.teardown();
    }
}

impl DeviceShared {
    fn on_packet(&self, data: &[u8]) -> Result<()> {
        let Packet { msg_id, msg } = wire::decode(data).map_err(|e| {
            warn!("Msg: {e}");
            AevumError::from(e)
        })?;

        let mut deferred: Option<Arc<InferenceInner>> = None;
        let mut st = self.mailbox.lock();

        debug!("Msg: type={:?}, msg_id={msg_id:#x}", msg.msg_type());

        let ret = match msg {
            Message::Err(err) => {
                warn!("Msg: Error. type={}, msg=\"{}\"", err.err_type, err.text());
                self.reporter.report_crash(&format!(
                    "firmware error {}: {}",
                    err.err_type,
                    err.text()
                ));
                Ok(())
            }
            Message::Ping => {
                debug!("Msg: Ping");
                self.mailbox.pong(&mut st)
            }
            Message::Pong => {
                debug!("Msg: Pong");
                Ok(())
            }
            Message::InferenceRsp(rsp) => {
                deferred = inference::handle_inference_rsp(&mut st, msg_id, &rsp);
                Ok(())
            }
            Message::CancelInferenceRsp(rsp) => {
                cancel::handle_cancel_rsp(&mut st, msg_id, &rsp);
                Ok(())
            }
            Message::VersionRsp(rsp) => {
                version::handle_version_rsp(&mut st, msg_id, rsp);
                Ok(())
            }
            Message::CapabilitiesRsp(rsp) => {
                capabilities::handle_capabilities_rsp(&mut st, msg_id, &rsp);
                Ok(())
            }
            Message::NetworkInfoRsp(rsp) => {
                netinfo::handle_network_info_rsp(&mut st, msg_id, &rsp);
                Ok(())
            }
            Message::InferenceReq(_)
            | Message::NetworkInfoReq(_)
            | Message::CancelInferenceReq(_)
            | Message::VersionReq
            | Message::CapabilitiesReq => {
                warn!("Msg: Protocol error. type={:?}", msg.msg_type());
                Err(AevumError::protocol(format!(
                    "unexpected inbound message type {:?}",
                    msg.msg_type()
                )))
            }
        };

        drop(st);

        // Receiving a packet may have freed a transmit slot.
        self.mailbox.wake_senders();

        drop(deferred);
        ret
    }
}
