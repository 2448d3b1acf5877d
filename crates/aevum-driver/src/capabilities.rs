//! Device capability querying and representation.
//!
//! Capabilities are fetched once from the firmware during startup and
//! stored on the device facade; later queries are answered from the cached
//! copy without touching the wire.

use std::sync::Arc;
use std::time::Duration;

use aevum_proto::{wire, CapabilitiesRsp, Message, MsgType};
use tracing::debug;

use crate::completion::ReplySlot;
use crate::device::DeviceShared;
use crate::error::{AevumError, Result};
use crate::mailbox::{warn_lookup, MailboxState, Pending};

const CAPABILITIES_RESP_TIMEOUT: Duration = Duration::from_secs(2);

/// A semantic version triplet as reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionTriplet {
    /// Major revision.
    pub major: u32,
    /// Minor revision.
    pub minor: u32,
    /// Patch revision.
    pub patch: u32,
}

impl std::fmt::Display for VersionTriplet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Hardware and firmware capabilities reported by the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Hardware version status word.
    pub version_status: u32,
    /// Hardware major version.
    pub version_major: u32,
    /// Hardware minor version.
    pub version_minor: u32,
    /// Product major generation.
    pub product_major: u32,
    /// Accelerator architecture revision.
    pub arch: VersionTriplet,
    /// Firmware driver revision.
    pub firmware: VersionTriplet,
    /// Multiply-accumulate operations per clock cycle.
    pub macs_per_cc: u32,
    /// Command stream format version.
    pub cmd_stream_version: u32,
    /// Whether the accelerator has a custom DMA engine.
    pub custom_dma: bool,
}

impl From<&CapabilitiesRsp> for Capabilities {
    fn from(rsp: &CapabilitiesRsp) -> Self {
        Self {
            version_status: rsp.version_status,
            version_major: rsp.version_major,
            version_minor: rsp.version_minor,
            product_major: rsp.product_major,
            arch: VersionTriplet {
                major: rsp.arch_major_rev,
                minor: rsp.arch_minor_rev,
                patch: rsp.arch_patch_rev,
            },
            firmware: VersionTriplet {
                major: rsp.driver_major_rev,
                minor: rsp.driver_minor_rev,
                patch: rsp.driver_patch_rev,
            },
            macs_per_cc: rsp.macs_per_cc,
            cmd_stream_version: rsp.cmd_stream_version,
            custom_dma: rsp.custom_dma != 0,
        }
    }
}

impl DeviceShared {
    /// Query firmware capabilities.
    pub(crate) fn capabilities_request(&self) -> Result<Capabilities> {
        let slot = Arc::new(ReplySlot::new());

        let mut st = self.mailbox.lock();
        let id = st.register(Pending::Capabilities(Arc::clone(&slot)))?;
        debug!("Capabilities request created. id={id:#x}");

        let pkt = wire::encode(id, &Message::CapabilitiesReq);
        if let Err(e) = self.mailbox.send_locked(&mut st, &pkt, None) {
            st.deregister(id);
            return Err(e);
        }

        drop(st);
        let outcome = slot.wait_timeout(CAPABILITIES_RESP_TIMEOUT);
        let mut st = self.mailbox.lock();
        st.deregister(id);
        drop(st);

        match outcome {
            Some(result) => result,
            None => {
                tracing::warn!("Capabilities response timeout");
                self.reporter.report_crash("capabilities response timeout");
                Err(AevumError::timeout(CAPABILITIES_RESP_TIMEOUT))
            }
        }
    }
}

/// Response handler: hand the decoded capabilities to the waiter.
pub(crate) fn handle_capabilities_rsp(st: &mut MailboxState, msg_id: u64, rsp: &CapabilitiesRsp) {
    let entry = match st.find(msg_id, MsgType::CapabilitiesReq) {
        Ok(entry) => entry,
        Err(e) => return warn_lookup("capabilities", msg_id, e),
    };
    let Pending::Capabilities(slot) = entry else {
        unreachable!("kind checked by find");
    };
    if slot.is_done() {
        return;
    }

    debug!(
        "Capabilities response. arch={}.{}.{}, fw={}.{}.{}, macs_per_cc={}",
        rsp.arch_major_rev,
        rsp.arch_minor_rev,
        rsp.arch_patch_rev,
        rsp.driver_major_rev,
        rsp.driver_minor_rev,
        rsp.driver_patch_rev,
        rsp.macs_per_cc
    );

    slot.complete(Ok(Capabilities::from(rsp)));
}
