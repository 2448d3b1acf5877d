//! Shared harness for the runtime integration tests.
//!
//! `TestTransport` records every packet the mailbox sends and models the
//! transmit-slot pool with a manual counter, so tests control exactly when
//! a send may proceed. `Responder` plays a scripted firmware on a side
//! thread for the flows that block the calling thread (probe, cancel).
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use aevum_driver::transport::{CrashReporter, Transport, TrySendError};
use aevum_driver::{AevumDevice, CarveoutAllocator};
use aevum_proto::{wire, Message, Packet};
use parking_lot::Mutex;

/// Transport double: records sends, enforces a manual slot quota.
#[derive(Debug)]
pub struct TestTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    /// Remaining transmit slots; `usize::MAX` means unlimited.
    slots: AtomicUsize,
}

impl TestTransport {
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            slots: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn with_slots(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            slots: AtomicUsize::new(slots),
        })
    }

    pub fn add_slots(&self, n: usize) {
        self.slots.fetch_add(n, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Decoded view of the `n`-th packet sent.
    pub fn sent_packet(&self, n: usize) -> Packet {
        let raw = self.sent.lock()[n].clone();
        wire::decode(&raw).expect("sent packet decodes")
    }

    pub fn last_packet(&self) -> Packet {
        let count = self.sent_count();
        assert!(count > 0, "nothing was sent");
        self.sent_packet(count - 1)
    }
}

impl Transport for TestTransport {
    fn try_send(&self, data: &[u8]) -> Result<(), TrySendError> {
        let mut slots = self.slots.load(Ordering::SeqCst);
        loop {
            if slots == 0 {
                return Err(TrySendError::NoSlots);
            }
            let next = if slots == usize::MAX { slots } else { slots - 1 };
            match self
                .slots
                .compare_exchange(slots, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(current) => slots = current,
            }
        }
        self.sent.lock().push(data.to_vec());
        Ok(())
    }
}

/// Crash sink that counts invocations.
#[derive(Debug, Default)]
pub struct CountingReporter {
    count: AtomicUsize,
}

impl CountingReporter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl CrashReporter for CountingReporter {
    fn report_crash(&self, reason: &str) {
        eprintln!("crash reported: {reason}");
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a test needs to drive the runtime by hand.
pub struct Harness {
    pub device: Arc<AevumDevice>,
    pub transport: Arc<TestTransport>,
    pub reporter: Arc<CountingReporter>,
}

impl Harness {
    pub fn new(transport: Arc<TestTransport>) -> Self {
        let reporter = Arc::new(CountingReporter::default());
        let dma = Arc::new(CarveoutAllocator::new(0x6000_0000, 1 << 20).expect("carveout"));
        let device = Arc::new(
            AevumDevice::new(transport.clone(), dma, Box::new(reporter.clone()))
                .expect("device create"),
        );
        Self {
            device,
            transport,
            reporter,
        }
    }

    /// Feed one encoded message into the dispatcher.
    pub fn inject(&self, msg_id: u64, msg: &Message) {
        self.device
            .on_packet(&wire::encode(msg_id, msg))
            .expect("dispatch");
    }
}

/// Busy-wait (with sleeps) for a condition, panicking after `timeout`.
pub fn wait_for(timeout: Duration, what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// A scripted firmware on a side thread: polls the transport for new
/// requests and feeds each reply straight back into the dispatcher.
pub struct Responder {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Responder {
    pub fn spawn(
        device: Arc<AevumDevice>,
        transport: Arc<TestTransport>,
        script: impl Fn(&Packet) -> Option<Message> + Send + 'static,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let worker = std::thread::spawn(move || {
            let mut seen = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                while seen < transport.sent_count() {
                    let request = transport.sent_packet(seen);
                    seen += 1;
                    if let Some(reply) = script(&request) {
                        let _ = device.on_packet(&wire::encode(request.msg_id, &reply));
                    }
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        });
        Self {
            stop,
            worker: Some(worker),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
