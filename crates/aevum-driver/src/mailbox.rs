//! Message correlation and the flow-controlled sender.
//!
//! The mailbox multiplexes every in-flight request onto the single
//! transport endpoint. It owns the outstanding-request table keyed by
//! correlation id, allocates ids cyclically so a freed id is not reused
//! until the space wraps, and serializes transmissions over the
//! transport's finite transmit-slot pool with FIFO-fair blocking.
//!
//! The mutex around [`MailboxState`] is the device-wide serialization
//! lock: it also covers request bookkeeping in the request state machines
//! and the dispatcher. Every blocking wait in this module releases it
//! while suspended — the condvar wait drops and reacquires the guard, so
//! the property holds at the primitive rather than at each call site.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aevum_proto::{wire, Message, MsgType, Status};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::capabilities::Capabilities;
use crate::completion::ReplySlot;
use crate::error::{AevumError, Result};
use crate::inference::InferenceInner;
use crate::netinfo::NetworkInfo;
use crate::transport::{Transport, TrySendError};

/// Upper bound of the send-slot wait.
pub(crate) const SEND_TIMEOUT: Duration = Duration::from_secs(15);

/// Correlation ids live in `[0, ID_LIMIT)`.
const ID_LIMIT: u64 = i32::MAX as u64;

/// One outstanding request, held in the table until its owner deregisters.
///
/// Short-lived requests park on a [`ReplySlot`]. An inference entry
/// carries the mailbox's owned reference to the inference; the response or
/// the failure broadcast takes it, leaving the entry behind as a typed
/// tombstone so stale or duplicate responses still resolve (and are then
/// dropped) until the inference deregisters itself on destruction.
#[derive(Debug)]
pub(crate) enum Pending {
    Version(Arc<ReplySlot<()>>),
    Capabilities(Arc<ReplySlot<Capabilities>>),
    NetworkInfo(Arc<ReplySlot<NetworkInfo>>),
    CancelInference(Arc<ReplySlot<Status>>),
    Inference {
        strong: Option<Arc<InferenceInner>>,
    },
}

impl Pending {
    /// The request type a response must carry to match this entry.
    pub(crate) fn msg_type(&self) -> MsgType {
        match self {
            Self::Version(_) => MsgType::VersionReq,
            Self::Capabilities(_) => MsgType::CapabilitiesReq,
            Self::NetworkInfo(_) => MsgType::NetworkInfoReq,
            Self::CancelInference(_) => MsgType::CancelInferenceReq,
            Self::Inference { .. } => MsgType::InferenceReq,
        }
    }

    /// Fail the waiter. Returns the mailbox's inference reference, if any,
    /// for the caller to drop outside the device lock.
    pub(crate) fn fail(&mut self) -> Option<Arc<InferenceInner>> {
        match self {
            Self::Version(slot) => {
                slot.complete(Err(AevumError::faulted("mailbox failure")));
                None
            }
            Self::Capabilities(slot) => {
                slot.complete(Err(AevumError::faulted("mailbox failure")));
                None
            }
            Self::NetworkInfo(slot) => {
                slot.complete(Err(AevumError::faulted("mailbox failure")));
                None
            }
            Self::CancelInference(slot) => {
                slot.complete(Err(AevumError::faulted("mailbox failure")));
                None
            }
            Self::Inference { strong, .. } => {
                let taken = strong.take();
                if let Some(inf) = &taken {
                    inf.fail_pending();
                }
                taken
            }
        }
    }
}

/// Result of a table lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FindError {
    /// No entry registered under the id.
    NotFound,
    /// The entry exists but was registered for a different request type.
    KindMismatch,
}

/// State behind the device-wide serialization lock.
#[derive(Debug)]
pub(crate) struct MailboxState {
    next_id: u64,
    entries: BTreeMap<u64, Pending>,
    shutdown: bool,
    tickets: VecDeque<u64>,
    next_ticket: u64,
    pub(crate) last_ping: Option<Instant>,
}

impl MailboxState {
    /// Register an outstanding request, allocating the next unused
    /// correlation id cyclically.
    ///
    /// # Errors
    ///
    /// `NoDevice` once the mailbox is shut down, `OutOfMemory` when the id
    /// space is exhausted.
    pub(crate) fn register(&mut self, entry: Pending) -> Result<u64> {
        if self.shutdown {
            return Err(AevumError::NoDevice);
        }
        if self.entries.len() as u64 >= ID_LIMIT {
            return Err(AevumError::out_of_memory("correlation id space exhausted"));
        }

        loop {
            let id = self.next_id;
            self.next_id = (self.next_id + 1) % ID_LIMIT;
            if let std::collections::btree_map::Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(entry);
                return Ok(id);
            }
        }
    }

    /// Remove an entry. Idempotent: removing an id that already left the
    /// table is a no-op.
    pub(crate) fn deregister(&mut self, id: u64) -> Option<Pending> {
        self.entries.remove(&id)
    }

    /// Look up an entry, requiring the registered request type to match.
    pub(crate) fn find(&self, id: u64, expected: MsgType) -> std::result::Result<&Pending, FindError> {
        let entry = self.entries.get(&id).ok_or(FindError::NotFound)?;
        if entry.msg_type() != expected {
            return Err(FindError::KindMismatch);
        }
        Ok(entry)
    }

    /// As [`MailboxState::find`], with mutable access.
    pub(crate) fn find_mut(
        &mut self,
        id: u64,
        expected: MsgType,
    ) -> std::result::Result<&mut Pending, FindError> {
        let entry = self.entries.get_mut(&id).ok_or(FindError::NotFound)?;
        if entry.msg_type() != expected {
            return Err(FindError::KindMismatch);
        }
        Ok(entry)
    }

    /// Invoke the failure path of every outstanding request. Entries stay
    /// registered; their owners deregister on their own teardown.
    ///
    /// Returns the inference references the mailbox owned, to be dropped by
    /// the caller after releasing the device lock.
    pub(crate) fn fail_all(&mut self) -> Vec<Arc<InferenceInner>> {
        let mut owned = Vec::new();
        for entry in self.entries.values_mut() {
            if let Some(inf) = entry.fail() {
                owned.push(inf);
            }
        }
        owned
    }

    /// Whether the table is empty (diagnostics and tests).
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The concurrency and transport core.
#[derive(Debug)]
pub(crate) struct Mailbox {
    transport: Arc<dyn Transport>,
    state: Mutex<MailboxState>,
    send_queue: Condvar,
}

impl Mailbox {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(MailboxState {
                next_id: 0,
                entries: BTreeMap::new(),
                shutdown: false,
                tickets: VecDeque::new(),
                next_ticket: 0,
                last_ping: None,
            }),
            send_queue: Condvar::new(),
        }
    }

    /// Take the device-wide serialization lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock()
    }

    /// Blocking, FIFO-fair packet sender. Must be called with the device
    /// lock held; the lock is released while suspended on a transmit slot
    /// and held again on return.
    ///
    /// # Errors
    ///
    /// `NoDevice` if the mailbox shuts down before the send, `Interrupted`
    /// if the caller's interrupt flag is raised while waiting, `Timeout`
    /// after [`SEND_TIMEOUT`], or the transport's hard error.
    pub(crate) fn send_locked(
        &self,
        st: &mut MutexGuard<'_, MailboxState>,
        data: &[u8],
        interrupt: Option<&AtomicBool>,
    ) -> Result<()> {
        let deadline = Instant::now() + SEND_TIMEOUT;
        let ticket = st.next_ticket;
        st.next_ticket += 1;

        // Attempt immediately only when nobody is queued ahead.
        let mut attempt = st.tickets.is_empty();
        st.tickets.push_back(ticket);

        let result = loop {
            if st.shutdown {
                break Err(AevumError::NoDevice);
            }

            if attempt && st.tickets.front() == Some(&ticket) {
                match self.transport.try_send(data) {
                    Ok(()) => break Ok(()),
                    Err(TrySendError::NoSlots) => {}
                    Err(TrySendError::Failed(reason)) => break Err(AevumError::transport(reason)),
                }
            } else {
                attempt = true;
            }

            // Suspend until a slot may be free. The wait drops the device
            // lock and reacquires it before returning.
            let timed_out = self.send_queue.wait_until(st, deadline).timed_out();

            if interrupt.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
                break Err(AevumError::Interrupted);
            }
            if timed_out {
                break Err(AevumError::timeout(SEND_TIMEOUT));
            }
        };

        let was_front = st.tickets.front() == Some(&ticket);
        if let Some(pos) = st.tickets.iter().position(|&t| t == ticket) {
            st.tickets.remove(pos);
        }

        // A successful send may have freed a slot for the next waiter, and
        // a departing queue head must pass the turn on.
        if (result.is_ok() || was_front) && !st.tickets.is_empty() {
            self.send_queue.notify_all();
        }

        result
    }

    /// Send a liveness probe. Uncorrelated, single packet.
    pub(crate) fn ping(
        &self,
        st: &mut MutexGuard<'_, MailboxState>,
        interrupt: Option<&AtomicBool>,
    ) -> Result<()> {
        self.send_locked(st, &wire::encode(0, &Message::Ping), interrupt)
    }

    /// Answer a received ping.
    pub(crate) fn pong(&self, st: &mut MutexGuard<'_, MailboxState>) -> Result<()> {
        self.send_locked(st, &wire::encode(0, &Message::Pong), None)
    }

    /// Wake the send queue: the dispatcher calls this after every inbound
    /// packet, since receiving one may have freed a transmit slot.
    pub(crate) fn wake_senders(&self) {
        self.send_queue.notify_all();
    }

    /// Stop the sender: set the shutdown flag and wake every waiter. Does
    /// not drain the table; teardown broadcasts failure separately.
    pub(crate) fn shutdown(&self) {
        let mut st = self.state.lock();
        if !st.shutdown {
            debug!("Mailbox shutdown");
            st.shutdown = true;
        }
        drop(st);
        self.send_queue.notify_all();
    }
}

/// Log a failed response lookup; stale responses are dropped without state
/// mutation.
pub(crate) fn warn_lookup(kind: &str, msg_id: u64, err: FindError) {
    match err {
        FindError::NotFound => {
            warn!("Id for {kind} msg not found. id={msg_id:#x}");
        }
        FindError::KindMismatch => {
            warn!("Id for {kind} msg registered with different kind. id={msg_id:#x}");
        }
    }
}
