//! The cancel-inference sub-protocol.
//!
//! Cancellation interleaves with completion: the target is latched
//! `Aborting` before the request goes out, so an inference response racing
//! past the cancellation collapses to `Aborted` instead of reporting
//! success. A cancel that the firmware never answers is treated as a
//! firmware hang and reported to the crash sink.

use std::sync::Arc;
use std::time::Duration;

use aevum_proto::{wire, CancelInferenceReq, CancelInferenceRsp, Message, MsgType, Status};
use tracing::{debug, warn};

use crate::completion::ReplySlot;
use crate::error::{AevumError, Result};
use crate::inference::Inference;
use crate::mailbox::{warn_lookup, MailboxState, Pending};
use crate::session::Session;

const CANCEL_INFERENCE_RESP_TIMEOUT: Duration = Duration::from_secs(2);

impl Inference {
    /// Ask the firmware to abort this inference.
    ///
    /// Returns the user-visible outcome: `Ok` if the firmware aborted the
    /// job, `Error` if it could not (including the job already being
    /// done). Either way the inference ends up `Aborted` unless it had
    /// already completed.
    ///
    /// # Errors
    ///
    /// `Timeout` or `Faulted` when the firmware does not answer or the
    /// mailbox fails; both also report a firmware fatal error.
    pub fn cancel(&self, session: &Session) -> Result<Status> {
        let inner = &self.inner;
        let shared = &inner.shared;

        let mut st = shared.mailbox.lock();

        // A finished inference has nothing to abort.
        if self.is_done() {
            return Ok(Status::Error);
        }

        // Latch before sending: a racing inference response must not
        // revert this job to a success.
        inner.set_status(Status::Aborting);

        let slot = Arc::new(ReplySlot::new());
        let id = st.register(Pending::CancelInference(Arc::clone(&slot)))?;
        debug!("Inference cancellation create. id={id:#x}");

        let req = CancelInferenceReq {
            inference_handle: inner.msg_id.load(std::sync::atomic::Ordering::Relaxed),
        };
        let pkt = wire::encode(id, &Message::CancelInferenceReq(req));
        if let Err(e) = shared.mailbox.send_locked(&mut st, &pkt, session.interrupt_flag()) {
            st.deregister(id);
            return Err(e);
        }

        // Unlock the device while blocking on the response.
        drop(st);
        let outcome = slot.wait_timeout(CANCEL_INFERENCE_RESP_TIMEOUT);
        let mut st = shared.mailbox.lock();

        let result = match outcome {
            None => {
                warn!("Cancel inference response lost - timeout");
                shared
                    .reporter
                    .report_crash("cancel inference response timeout");
                Err(AevumError::timeout(CANCEL_INFERENCE_RESP_TIMEOUT))
            }
            Some(Err(e)) => {
                shared.reporter.report_crash("cancel inference request failed");
                Err(e)
            }
            Some(Ok(user_status)) => {
                inner.set_status(Status::Aborted);
                Ok(user_status)
            }
        };

        st.deregister(id);
        drop(st);
        debug!("Cancel inference destroy. id={id:#x}");
        result
    }
}

/// Response handler: map the firmware outcome onto the waiting cancel.
pub(crate) fn handle_cancel_rsp(st: &mut MailboxState, msg_id: u64, rsp: &CancelInferenceRsp) {
    let entry = match st.find(msg_id, MsgType::CancelInferenceReq) {
        Ok(entry) => entry,
        Err(e) => return warn_lookup("cancel inference", msg_id, e),
    };
    let Pending::CancelInference(slot) = entry else {
        unreachable!("kind checked by find");
    };
    if slot.is_done() {
        return;
    }

    let user_status = if rsp.status == Status::Ok as u32 {
        Status::Ok
    } else {
        Status::Error
    };
    slot.complete(Ok(user_status));
}
