//! In-process firmware emulator.
//!
//! Plays the accelerator side of the wire protocol over an in-memory
//! transport with a finite transmit-slot pool, so the whole runtime can be
//! exercised without hardware — CI, the CLI self-test, and examples all
//! run against it. It models a healthy firmware: version and capability
//! answers, canned network metadata, immediately-successful inferences
//! with deterministic PMU counts.
//!
//! This is a stand-in, not a simulator: it does not execute models and it
//! never misbehaves. Tests that need a silent or hostile firmware drive
//! [`crate::AevumDevice::on_packet`] by hand instead.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use aevum_proto::{
    wire, CancelInferenceRsp, CapabilitiesRsp, InferenceRsp, Message, NetworkInfoRsp, Packet,
    Status, VersionRsp, BUFFER_MAX, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::device::AevumDevice;
use crate::transport::{Transport, TrySendError};

/// What the emulated firmware reports about itself.
#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Transmit slots available to the host.
    pub slots: usize,
    /// Protocol version to report.
    pub version: (u8, u8, u8),
    /// Capability words to report.
    pub capabilities: CapabilitiesRsp,
    /// Metadata reported for every network-info query.
    pub network_info: NetworkInfoRsp,
    /// Cycle count attached to successful inferences.
    pub cycle_count: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        let mut network_info = NetworkInfoRsp {
            ifm_count: 1,
            ofm_count: 1,
            status: Status::Ok as u32,
            ..NetworkInfoRsp::default()
        };
        network_info.desc[..8].copy_from_slice(b"emulated");
        network_info.ifm_size[0] = 784;
        network_info.ofm_size[0] = 10;

        Self {
            slots: 4,
            version: (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH),
            capabilities: CapabilitiesRsp {
                version_status: 1,
                version_major: 1,
                product_major: 6,
                arch_major_rev: 1,
                arch_minor_rev: 0,
                arch_patch_rev: 6,
                driver_major_rev: 0,
                driver_minor_rev: 1,
                driver_patch_rev: 0,
                macs_per_cc: 256,
                cmd_stream_version: 1,
                custom_dma: 0,
                ..CapabilitiesRsp::default()
            },
            network_info,
            cycle_count: 12345,
        }
    }
}

#[derive(Debug)]
struct EmuShared {
    config: EmulatorConfig,
    state: Mutex<EmuState>,
    wake: Condvar,
}

#[derive(Debug)]
struct EmuState {
    queue: VecDeque<Vec<u8>>,
    device: Option<Weak<AevumDevice>>,
    stop: bool,
}

/// The host-visible endpoint of the emulator.
#[derive(Debug)]
pub struct EmulatorTransport {
    shared: Arc<EmuShared>,
}

impl Transport for EmulatorTransport {
    fn try_send(&self, data: &[u8]) -> std::result::Result<(), TrySendError> {
        let mut state = self.shared.state.lock();
        if state.queue.len() >= self.shared.config.slots {
            return Err(TrySendError::NoSlots);
        }
        state.queue.push_back(data.to_vec());
        self.shared.wake.notify_one();
        Ok(())
    }
}

/// An emulated Aevum firmware instance with its own service thread.
#[derive(Debug)]
pub struct Emulator {
    shared: Arc<EmuShared>,
    transport: Arc<EmulatorTransport>,
    worker: Option<JoinHandle<()>>,
}

impl Emulator {
    /// Start an emulator with the given behaviour.
    pub fn new(config: EmulatorConfig) -> Self {
        let shared = Arc::new(EmuShared {
            config,
            state: Mutex::new(EmuState {
                queue: VecDeque::new(),
                device: None,
                stop: false,
            }),
            wake: Condvar::new(),
        });

        let transport = Arc::new(EmulatorTransport {
            shared: Arc::clone(&shared),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("aevum-emu".into())
            .spawn(move || service_loop(&worker_shared))
            .expect("spawn emulator thread");

        Self {
            shared,
            transport,
            worker: Some(worker),
        }
    }

    /// Start an emulator with default behaviour.
    pub fn with_defaults() -> Self {
        Self::new(EmulatorConfig::default())
    }

    /// The transport endpoint to hand to [`AevumDevice::new`].
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport) as Arc<dyn Transport>
    }

    /// Connect the device whose `on_packet` receives the responses.
    pub fn connect(&self, device: &Arc<AevumDevice>) {
        self.shared.state.lock().device = Some(Arc::downgrade(device));
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.shared.state.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn service_loop(shared: &EmuShared) {
    loop {
        let (request, device) = {
            let mut state = shared.state.lock();
            loop {
                if state.stop {
                    return;
                }
                if let Some(request) = state.queue.pop_front() {
                    break (request, state.device.clone());
                }
                shared.wake.wait(&mut state);
            }
        };

        let Some(device) = device.and_then(|weak| weak.upgrade()) else {
            debug!("Emulator dropping request: no device connected");
            continue;
        };

        for response in respond(&shared.config, &request) {
            if let Err(e) = device.on_packet(&response) {
                warn!("Emulator response rejected by device: {e}");
            }
        }
    }
}

/// The firmware's reaction to one request packet.
fn respond(config: &EmulatorConfig, request: &[u8]) -> Vec<Vec<u8>> {
    let Ok(Packet { msg_id, msg }) = wire::decode(request) else {
        warn!("Emulator received undecodable packet");
        return Vec::new();
    };

    let reply = match msg {
        Message::Ping => Message::Pong,
        Message::Pong => return Vec::new(),
        Message::VersionReq => Message::VersionRsp(VersionRsp {
            major: config.version.0,
            minor: config.version.1,
            patch: config.version.2,
        }),
        Message::CapabilitiesReq => Message::CapabilitiesRsp(config.capabilities),
        Message::NetworkInfoReq(_) => Message::NetworkInfoRsp(Box::new(config.network_info)),
        Message::InferenceReq(req) => {
            let mut rsp = InferenceRsp {
                ofm_count: req.ofm_count,
                status: Status::Ok as u32,
                pmu_event_config: req.pmu_event_config,
                pmu_cycle_counter_enable: req.pmu_cycle_counter_enable,
                pmu_cycle_counter_count: if req.pmu_cycle_counter_enable != 0 {
                    config.cycle_count
                } else {
                    0
                },
                ..InferenceRsp::default()
            };
            let count = (req.ofm_count as usize).min(BUFFER_MAX);
            for i in 0..count {
                rsp.ofm_size[i] = req.ofm[i].size;
            }
            for (i, event_count) in rsp.pmu_event_count.iter_mut().enumerate() {
                if req.pmu_event_config[i] != 0 {
                    *event_count = (i as u64 + 1) * 10;
                }
            }
            Message::InferenceRsp(Box::new(rsp))
        }
        // Inferences complete immediately here, so there is never a job
        // left to abort.
        Message::CancelInferenceReq(_) => Message::CancelInferenceRsp(CancelInferenceRsp {
            status: Status::Error as u32,
        }),
        other => {
            warn!("Emulator received unexpected message type {:?}", other.msg_type());
            return Vec::new();
        }
    };

    vec![wire::encode(msg_id, &reply)]
}
