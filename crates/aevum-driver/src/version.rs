//! Protocol version handshake.
//!
//! First request of the startup sequence. The firmware's `major` and
//! `minor` must match the compiled-in protocol version exactly; `patch`
//! differences are accepted.

use std::sync::Arc;
use std::time::Duration;

use aevum_proto::{wire, Message, MsgType, VersionRsp, VERSION_MAJOR, VERSION_MINOR};
use tracing::{debug, warn};

use crate::completion::ReplySlot;
use crate::device::DeviceShared;
use crate::error::{AevumError, Result};
use crate::mailbox::{warn_lookup, MailboxState, Pending};

const VERSION_RESP_TIMEOUT: Duration = Duration::from_secs(2);

impl DeviceShared {
    /// Query the firmware's protocol version and check compatibility.
    pub(crate) fn version_check(&self) -> Result<()> {
        let slot = Arc::new(ReplySlot::new());

        let mut st = self.mailbox.lock();
        let id = st.register(Pending::Version(Arc::clone(&slot)))?;
        debug!("Protocol version request created. id={id:#x}");

        let pkt = wire::encode(id, &Message::VersionReq);
        if let Err(e) = self.mailbox.send_locked(&mut st, &pkt, None) {
            st.deregister(id);
            return Err(e);
        }

        // Unlock the device while blocking on the response.
        drop(st);
        let outcome = slot.wait_timeout(VERSION_RESP_TIMEOUT);
        let mut st = self.mailbox.lock();
        st.deregister(id);
        drop(st);

        match outcome {
            Some(result) => result,
            None => {
                warn!("Protocol version response timeout");
                self.reporter.report_crash("protocol version response timeout");
                Err(AevumError::timeout(VERSION_RESP_TIMEOUT))
            }
        }
    }
}

/// Response handler: match the waiter and judge the reported version.
pub(crate) fn handle_version_rsp(st: &mut MailboxState, msg_id: u64, rsp: VersionRsp) {
    let entry = match st.find(msg_id, MsgType::VersionReq) {
        Ok(entry) => entry,
        Err(e) => return warn_lookup("version", msg_id, e),
    };
    let Pending::Version(slot) = entry else {
        unreachable!("kind checked by find");
    };
    if slot.is_done() {
        return;
    }

    if rsp.major == VERSION_MAJOR && rsp.minor == VERSION_MINOR {
        slot.complete(Ok(()));
    } else {
        warn!(
            "Protocol version mismatch. Expected {VERSION_MAJOR}.{VERSION_MINOR}.x but got {}.{}.{}",
            rsp.major, rsp.minor, rsp.patch
        );
        slot.complete(Err(AevumError::protocol(format!(
            "firmware speaks protocol {}.{}.{}, host expects {VERSION_MAJOR}.{VERSION_MINOR}.x",
            rsp.major, rsp.minor, rsp.patch
        ))));
    }
}
