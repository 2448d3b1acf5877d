//! Host-side RPC runtime for the Aevum NPU subsystem.
//!
//! The accelerator runs firmware on a privileged remote processor; this
//! crate is the host half of the conversation. It multiplexes many
//! concurrent user sessions onto one rpmsg-style transport endpoint,
//! manages the DMA-backed buffers shared with the accelerator, dispatches
//! inference jobs, correlates asynchronous replies, and fails everything
//! cleanly when the firmware crashes.
//!
//! # Architecture
//!
//! ```text
//! Session ──▶ AevumDevice (facade) ──▶ Mailbox ──▶ Transport (trait)
//!                  │                      ▲
//!                  ▼                      │ correlation table
//!        Buffer / Network / Inference ────┘
//! ```
//!
//! User calls construct a request, register it in the mailbox under a
//! fresh correlation id, encode a packet and send it through the
//! flow-controlled blocking sender. The transport owner feeds inbound
//! packets to [`AevumDevice::on_packet`], which routes each response to
//! its waiter by correlation id and message type.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use aevum_driver::{
//!     AevumDevice, CarveoutAllocator, Emulator, LogCrashReporter, NetworkSpec, PmuConfig,
//! };
//!
//! # fn main() -> aevum_driver::Result<()> {
//! let firmware = Emulator::with_defaults();
//! let dma = Arc::new(CarveoutAllocator::new(0x6000_0000, 1 << 20)?);
//! let device = Arc::new(AevumDevice::new(
//!     firmware.transport(),
//!     dma,
//!     Box::new(LogCrashReporter),
//! )?);
//! firmware.connect(&device);
//! device.probe()?;
//!
//! let session = device.open();
//! let ifm = session.buffer_create(784)?;
//! let ofm = session.buffer_create(10)?;
//! let network = session.network_create(NetworkSpec::Index(0))?;
//!
//! let job = network.inference(&session, &[ifm], &[ofm.clone()], &PmuConfig::default())?;
//! job.wait(std::time::Duration::from_secs(1));
//! println!("inference: {}", job.status().status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]

mod buffer;
mod cancel;
mod capabilities;
mod completion;
mod device;
mod dma;
pub mod emulator;
mod error;
mod inference;
mod mailbox;
mod netinfo;
mod network;
mod session;
pub mod transport;
mod version;

/// Maximum number of feature-map buffers per direction of one inference.
pub const FD_MAX: usize = 16;

/// PMU event slots exposed to users.
pub const PMU_EVENT_MAX: usize = 4;

pub use aevum_proto::Status;
pub use buffer::{Buffer, BufferView};
pub use capabilities::{Capabilities, VersionTriplet};
pub use device::{AevumDevice, DriverVersion};
pub use dma::{CarveoutAllocator, DmaAllocator, DmaMemory, DmaRegion};
pub use emulator::{Emulator, EmulatorConfig};
pub use error::{AevumError, Result};
pub use inference::{Inference, InferenceStatus, PmuConfig};
pub use netinfo::NetworkInfo;
pub use network::{Network, NetworkSpec};
pub use session::Session;
pub use transport::{CrashReporter, LogCrashReporter, Transport, TrySendError};
