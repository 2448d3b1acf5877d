//! Inference handles — the long-running request state machine.
//!
//! An inference is created against a network with up to [`FD_MAX`] input
//! and output buffers, registered in the mailbox, and published to the
//! caller in the `Running` state once the request packet is on the wire.
//! The mailbox owns a reference to the inference until its response or the
//! failure broadcast arrives, so the buffers and the network stay alive
//! while the accelerator may still touch them — even if the caller drops
//! the handle early.
//!
//! Status transitions are terminal once left `Running`, with one detour:
//! a cancellation latches `Aborting`, and any later completion collapses
//! to `Aborted` regardless of what the firmware reports.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aevum_proto::{wire, InferenceReq, InferenceRsp, Message, MsgType, Status, BUFFER_MAX};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::buffer::Buffer;
use crate::device::DeviceShared;
use crate::error::{AevumError, Result};
use crate::mailbox::{warn_lookup, MailboxState, Pending};
use crate::network::Network;
use crate::session::Session;
use crate::{FD_MAX, PMU_EVENT_MAX};

/// Sentinel for an inference that never made it into the mailbox table.
const UNREGISTERED: u64 = u64::MAX;

/// PMU counter selection for one inference.
#[derive(Debug, Clone, Copy, Default)]
pub struct PmuConfig {
    /// Event identifiers to count, one per slot.
    pub events: [u8; PMU_EVENT_MAX],
    /// Whether to run the cycle counter.
    pub cycle_counter: bool,
}

/// Snapshot of an inference's state, safe to take at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceStatus {
    /// Current status. Terminal unless `Running` or `Aborting`.
    pub status: Status,
    /// PMU events that were configured (or reported back on success).
    pub pmu_event_config: [u8; PMU_EVENT_MAX],
    /// PMU event counts; zero until the job completed successfully.
    pub pmu_event_count: [u64; PMU_EVENT_MAX],
    /// Whether the cycle counter ran.
    pub cycle_counter_enable: bool,
    /// Cycle count; zero until the job completed successfully.
    pub cycle_counter_count: u64,
    /// Bytes the firmware wrote to each output buffer, in order. Empty
    /// until the job completed successfully.
    pub ofm_sizes: Vec<u32>,
}

/// A reference-counted handle to one inference job.
#[derive(Debug, Clone)]
pub struct Inference {
    pub(crate) inner: Arc<InferenceInner>,
}

#[derive(Debug)]
pub(crate) struct InferenceInner {
    pub(crate) shared: Arc<DeviceShared>,
    net: Network,
    ifm: Vec<Buffer>,
    ofm: Vec<Buffer>,
    pub(crate) msg_id: AtomicU64,
    state: Mutex<InferState>,
    done: AtomicBool,
    waitq: Condvar,
}

#[derive(Debug)]
struct InferState {
    status: Status,
    pmu_event_config: [u8; PMU_EVENT_MAX],
    pmu_event_count: [u64; PMU_EVENT_MAX],
    cycle_counter_enable: bool,
    cycle_counter_count: u64,
    ofm_sizes: Vec<u32>,
}

impl Network {
    /// Dispatch an inference of this network.
    ///
    /// Takes a handle clone of every buffer and of the network for the
    /// inference's whole lifetime. The returned handle is live: the job is
    /// already running on the accelerator.
    ///
    /// # Errors
    ///
    /// `Faulted` if more than [`FD_MAX`] input or output buffers are
    /// given (no correlation id is consumed and no references are taken),
    /// or any mailbox/send error.
    pub fn inference(
        &self,
        session: &Session,
        ifm: &[Buffer],
        ofm: &[Buffer],
        pmu: &PmuConfig,
    ) -> Result<Inference> {
        if ifm.len() > FD_MAX || ofm.len() > FD_MAX {
            warn!(
                "Inference create. Too many IFM and/or OFM buffers. ifm_count={}, ofm_count={}",
                ifm.len(),
                ofm.len()
            );
            return Err(AevumError::faulted(format!(
                "too many feature map buffers: ifm={}, ofm={}",
                ifm.len(),
                ofm.len()
            )));
        }

        let inner = Arc::new(InferenceInner {
            shared: Arc::clone(&self.inner.shared),
            net: self.clone(),
            ifm: ifm.to_vec(),
            ofm: ofm.to_vec(),
            msg_id: AtomicU64::new(UNREGISTERED),
            state: Mutex::new(InferState {
                status: Status::Error,
                pmu_event_config: pmu.events,
                pmu_event_count: [0; PMU_EVENT_MAX],
                cycle_counter_enable: pmu.cycle_counter,
                cycle_counter_count: 0,
                ofm_sizes: Vec::new(),
            }),
            done: AtomicBool::new(false),
            waitq: Condvar::new(),
        });

        let shared = &inner.shared;
        let mut st = shared.mailbox.lock();
        let id = st.register(Pending::Inference {
            strong: Some(Arc::clone(&inner)),
        })?;
        inner.msg_id.store(id, Ordering::Relaxed);

        let pkt = wire::encode(id, &Message::InferenceReq(Box::new(inner.wire_request(pmu))));
        if let Err(e) = shared.mailbox.send_locked(&mut st, &pkt, session.interrupt_flag()) {
            warn!("Failed to send inference request. id={id:#x}, err={e}");
            let entry = st.deregister(id);
            drop(st);
            drop(entry); // the mailbox's reference; must not drop under the lock
            return Err(e);
        }

        inner.state.lock().status = Status::Running;
        drop(st);

        debug!(
            "Inference create. id={id:#x}, ifm_count={}, ofm_count={}",
            ifm.len(),
            ofm.len()
        );

        Ok(Inference { inner })
    }
}

impl Inference {
    /// Whether the job has reached a terminal state. Monotonic.
    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Block until the job is done or `timeout` expires. Returns the final
    /// done flag. Does not take the device lock.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !self.inner.done.load(Ordering::Acquire) {
            if self.inner.waitq.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        self.inner.done.load(Ordering::Acquire)
    }

    /// Snapshot status and PMU counters. If the job is not done yet the
    /// counters are still zero.
    pub fn status(&self) -> InferenceStatus {
        let state = self.inner.state.lock();
        InferenceStatus {
            status: state.status,
            pmu_event_config: state.pmu_event_config,
            pmu_event_count: state.pmu_event_count,
            cycle_counter_enable: state.cycle_counter_enable,
            cycle_counter_count: state.cycle_counter_count,
            ofm_sizes: state.ofm_sizes.clone(),
        }
    }

    /// Number of live handles, the mailbox's included. Diagnostics only.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl InferenceInner {
    fn wire_request(&self, pmu: &PmuConfig) -> InferenceReq {
        let mut req = InferenceReq {
            ifm_count: self.ifm.len() as u32,
            ofm_count: self.ofm.len() as u32,
            network: self.net.inner.wire_ref(),
            pmu_cycle_counter_enable: u32::from(pmu.cycle_counter),
            ..InferenceReq::default()
        };
        for (slot, buffer) in req.ifm.iter_mut().zip(&self.ifm) {
            *slot = buffer.wire_ref();
        }
        for (slot, buffer) in req.ofm.iter_mut().zip(&self.ofm) {
            *slot = buffer.wire_ref();
        }
        // The wire carries more PMU slots than the interface exposes; the
        // extra slots stay zero.
        req.pmu_event_config[..PMU_EVENT_MAX].copy_from_slice(&pmu.events);
        req
    }

    /// Apply a firmware response. Called with the device lock held.
    fn complete_with(&self, rsp: &InferenceRsp) {
        let mut state = self.state.lock();

        if matches!(state.status, Status::Aborted | Status::Aborting) {
            // A cancellation latched; the firmware's verdict no longer
            // matters.
            state.status = Status::Aborted;
        } else if rsp.status == Status::Ok as u32 && rsp.ofm_count as usize <= BUFFER_MAX {
            state.status = Status::Ok;
            state
                .pmu_event_config
                .copy_from_slice(&rsp.pmu_event_config[..PMU_EVENT_MAX]);
            state
                .pmu_event_count
                .copy_from_slice(&rsp.pmu_event_count[..PMU_EVENT_MAX]);
            state.cycle_counter_enable = rsp.pmu_cycle_counter_enable != 0;
            state.cycle_counter_count = rsp.pmu_cycle_counter_count;
            state.ofm_sizes = rsp.ofm_size[..rsp.ofm_count as usize].to_vec();
        } else if rsp.status == Status::Rejected as u32 {
            state.status = Status::Rejected;
        } else if rsp.status == Status::Aborted as u32 {
            state.status = Status::Aborted;
        } else {
            state.status = Status::Error;
        }

        debug!("Inference done. status={}", state.status);
        self.done.store(true, Ordering::Release);
        self.waitq.notify_all();
    }

    /// Failure broadcast path. Called with the device lock held; the
    /// caller drops the mailbox's reference afterwards.
    pub(crate) fn fail_pending(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.state.lock();
        state.status = if state.status == Status::Aborting {
            Status::Aborted
        } else {
            Status::Error
        };
        self.done.store(true, Ordering::Release);
        self.waitq.notify_all();
    }

    /// Mark the job aborting/aborted from the cancel sub-protocol. Called
    /// with the device lock held.
    pub(crate) fn set_status(&self, status: Status) {
        self.state.lock().status = status;
    }
}

impl Drop for InferenceInner {
    fn drop(&mut self) {
        let id = self.msg_id.load(Ordering::Relaxed);
        if id != UNREGISTERED {
            self.shared.mailbox.lock().deregister(id);
        }
        debug!("Inference destroy. id={id:#x}");
        // Buffer and network references drop with their fields.
    }
}

/// Response handler: route to the inference and hand back the mailbox's
/// reference so the dispatcher can drop it outside the device lock.
pub(crate) fn handle_inference_rsp(
    st: &mut MailboxState,
    msg_id: u64,
    rsp: &InferenceRsp,
) -> Option<Arc<InferenceInner>> {
    let entry = match st.find_mut(msg_id, MsgType::InferenceReq) {
        Ok(entry) => entry,
        Err(e) => {
            warn_lookup("inference", msg_id, e);
            return None;
        }
    };
    let Pending::Inference { strong, .. } = entry else {
        unreachable!("kind checked by find");
    };

    let Some(inf) = strong.take() else {
        warn!("Duplicate inference response dropped. id={msg_id:#x}");
        return None;
    };

    inf.complete_with(rsp);
    Some(inf)
}
