//! Network metadata queries.
//!
//! Asks the firmware to describe a network: description string and the
//! expected feature-map counts and sizes. The response is validated before
//! it reaches the caller; a firmware-side failure, an over-limit count or
//! an unterminated description each map to a distinct error.

use std::sync::Arc;
use std::time::Duration;

use aevum_proto::{wire, Message, MsgType, NetworkInfoReq, NetworkInfoRsp, Status};
use tracing::{debug, warn};

use crate::completion::ReplySlot;
use crate::error::{AevumError, Result};
use crate::mailbox::{warn_lookup, MailboxState, Pending};
use crate::network::Network;
use crate::session::Session;
use crate::FD_MAX;

const NETWORK_INFO_RESP_TIMEOUT: Duration = Duration::from_secs(3);

/// Model metadata as reported by the firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Model description.
    pub desc: String,
    /// Expected size of each input feature map.
    pub ifm_sizes: Vec<u32>,
    /// Produced size of each output feature map.
    pub ofm_sizes: Vec<u32>,
}

impl Network {
    /// Query the firmware for this network's metadata.
    ///
    /// # Errors
    ///
    /// `BadFile` if the firmware rejects the network, `TooManyFiles` or
    /// `MessageTooLong` for malformed metadata, `Timeout` if the firmware
    /// does not answer (also reported as a firmware fatal error).
    pub fn info(&self, session: &Session) -> Result<NetworkInfo> {
        let shared = &self.inner.shared;
        let slot = Arc::new(ReplySlot::new());

        let mut st = shared.mailbox.lock();
        let id = st.register(Pending::NetworkInfo(Arc::clone(&slot)))?;
        debug!("Network info request created. id={id:#x}");

        let req = NetworkInfoReq {
            network: self.inner.wire_ref(),
        };
        let pkt = wire::encode(id, &Message::NetworkInfoReq(req));
        if let Err(e) = shared.mailbox.send_locked(&mut st, &pkt, session.interrupt_flag()) {
            st.deregister(id);
            return Err(e);
        }

        drop(st);
        let outcome = slot.wait_timeout(NETWORK_INFO_RESP_TIMEOUT);
        let mut st = shared.mailbox.lock();
        st.deregister(id);
        drop(st);

        match outcome {
            Some(result) => result,
            None => {
                warn!("Network info response timeout");
                shared.reporter.report_crash("network info response timeout");
                Err(AevumError::timeout(NETWORK_INFO_RESP_TIMEOUT))
            }
        }
    }
}

/// Response handler: validate and hand the metadata to the waiter.
pub(crate) fn handle_network_info_rsp(st: &mut MailboxState, msg_id: u64, rsp: &NetworkInfoRsp) {
    let entry = match st.find(msg_id, MsgType::NetworkInfoReq) {
        Ok(entry) => entry,
        Err(e) => return warn_lookup("network info", msg_id, e),
    };
    let Pending::NetworkInfo(slot) = entry else {
        unreachable!("kind checked by find");
    };
    if slot.is_done() {
        return;
    }

    slot.complete(validate(rsp));
}

fn validate(rsp: &NetworkInfoRsp) -> Result<NetworkInfo> {
    if rsp.status != Status::Ok as u32 {
        warn!("Failed to get information about the network. status={}", rsp.status);
        return Err(AevumError::BadFile {
            reason: format!("network info status {}", rsp.status),
        });
    }

    let ifm_count = rsp.ifm_count as usize;
    let ofm_count = rsp.ofm_count as usize;
    if ifm_count > FD_MAX || ofm_count > FD_MAX {
        warn!(
            "Invalid number of IFMs/OFMs in network info. ifm_count={}, ofm_count={}",
            rsp.ifm_count, rsp.ofm_count
        );
        return Err(AevumError::TooManyFiles {
            count: rsp.ifm_count.max(rsp.ofm_count),
            max: FD_MAX as u32,
        });
    }

    let Some(desc_len) = rsp.desc.iter().position(|&b| b == 0) else {
        warn!("Description in network info is not NUL-terminated");
        return Err(AevumError::MessageTooLong);
    };

    Ok(NetworkInfo {
        desc: String::from_utf8_lossy(&rsp.desc[..desc_len]).into_owned(),
        ifm_sizes: rsp.ifm_size[..ifm_count].to_vec(),
        ofm_sizes: rsp.ofm_size[..ofm_count].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_rsp() -> NetworkInfoRsp {
        let mut rsp = NetworkInfoRsp {
            ifm_count: 2,
            ofm_count: 1,
            status: Status::Ok as u32,
            ..NetworkInfoRsp::default()
        };
        rsp.desc[..7].copy_from_slice(b"keyword");
        rsp.ifm_size[0] = 490;
        rsp.ifm_size[1] = 490;
        rsp.ofm_size[0] = 12;
        rsp
    }

    #[test]
    fn accepts_well_formed_metadata() {
        let info = validate(&good_rsp()).unwrap();
        assert_eq!(info.desc, "keyword");
        assert_eq!(info.ifm_sizes, vec![490, 490]);
        assert_eq!(info.ofm_sizes, vec![12]);
    }

    #[test]
    fn firmware_failure_is_bad_file() {
        let rsp = NetworkInfoRsp {
            status: Status::Error as u32,
            ..good_rsp()
        };
        assert!(matches!(validate(&rsp), Err(AevumError::BadFile { .. })));
    }

    #[test]
    fn over_limit_counts_are_rejected() {
        let rsp = NetworkInfoRsp {
            ifm_count: 17,
            ..good_rsp()
        };
        assert!(matches!(
            validate(&rsp),
            Err(AevumError::TooManyFiles { count: 17, max: 16 })
        ));
    }

    #[test]
    fn unterminated_description_is_rejected() {
        let mut rsp = good_rsp();
        rsp.desc = [b'x'; 32];
        assert_eq!(validate(&rsp).unwrap_err(), AevumError::MessageTooLong);
    }
}
