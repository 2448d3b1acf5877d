//! Wire protocol model for the Aevum NPU message interface.
//!
//! The Aevum accelerator runs firmware on a remote processor; the host talks
//! to it over an rpmsg-style transport that delivers discrete, ordered,
//! length-prefixed packets. This crate is a **pure model** of that protocol:
//! message types, status codes, limits, and the little-endian codec. It has
//! no I/O and no driver state.
//!
//! Payload layouts match the firmware's C ABI exactly, including padding, so
//! a packet encoded here is byte-identical to one produced by the reference
//! headers. See [`wire`] for the layout constants.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | crate root | magic, protocol version, limits, message/status types |
//! | [`wire`] | payload sizes, encode/decode |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod wire;

/// Magic word leading every packet ("AEv1").
pub const MAGIC: u32 = 0x4145_7631;

/// Protocol version expected from the firmware. `major` and `minor` must
/// match exactly; `patch` differences are accepted.
pub const VERSION_MAJOR: u8 = 0;
/// See [`VERSION_MAJOR`].
pub const VERSION_MINOR: u8 = 2;
/// See [`VERSION_MAJOR`].
pub const VERSION_PATCH: u8 = 0;

/// Maximum number of IFM/OFM buffers carried by one inference message.
pub const BUFFER_MAX: usize = 16;

/// Number of PMU counter slots on the wire.
pub const PMU_MAX: usize = 8;

/// Message types, shared between the host and the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    /// Asynchronous error report from the firmware.
    Err = 1,
    /// Liveness probe, answered with [`MsgType::Pong`].
    Ping = 2,
    /// Answer to a [`MsgType::Ping`].
    Pong = 3,
    /// Inference job submission.
    InferenceReq = 4,
    /// Inference job completion.
    InferenceRsp = 5,
    /// Protocol version query.
    VersionReq = 6,
    /// Protocol version answer.
    VersionRsp = 7,
    /// Hardware/firmware capabilities query.
    CapabilitiesReq = 8,
    /// Capabilities answer.
    CapabilitiesRsp = 9,
    /// Network metadata query.
    NetworkInfoReq = 10,
    /// Network metadata answer.
    NetworkInfoRsp = 11,
    /// Request to abort a running inference.
    CancelInferenceReq = 12,
    /// Outcome of a cancellation request.
    CancelInferenceRsp = 13,
}

impl MsgType {
    /// Decode a raw wire value.
    pub const fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Err,
            2 => Self::Ping,
            3 => Self::Pong,
            4 => Self::InferenceReq,
            5 => Self::InferenceRsp,
            6 => Self::VersionReq,
            7 => Self::VersionRsp,
            8 => Self::CapabilitiesReq,
            9 => Self::CapabilitiesRsp,
            10 => Self::NetworkInfoReq,
            11 => Self::NetworkInfoRsp,
            12 => Self::CancelInferenceReq,
            13 => Self::CancelInferenceRsp,
            _ => return None,
        })
    }
}

/// Operation status as reported on the wire and surfaced to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Status {
    /// Completed successfully.
    #[default]
    Ok = 0,
    /// Failed.
    Error = 1,
    /// Still executing on the accelerator.
    Running = 2,
    /// Refused by the firmware before execution.
    Rejected = 3,
    /// Aborted.
    Aborted = 4,
    /// Abort requested, outcome pending.
    Aborting = 5,
}

impl Status {
    /// Decode a raw wire value.
    pub const fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Ok,
            1 => Self::Error,
            2 => Self::Running,
            3 => Self::Rejected,
            4 => Self::Aborted,
            5 => Self::Aborting,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ok => "Ok",
            Self::Error => "Error",
            Self::Running => "Running",
            Self::Rejected => "Rejected",
            Self::Aborted => "Aborted",
            Self::Aborting => "Aborting",
        };
        f.write_str(name)
    }
}

/// Error classes carried in the [`ErrMsg`] payload.
///
/// The field stays a raw `u32` on the wire; unknown values are reported
/// verbatim.
pub mod err_type {
    /// Unclassified firmware error.
    pub const GENERIC: u32 = 0;
    /// The firmware received a message type it does not implement.
    pub const UNSUPPORTED_TYPE: u32 = 1;
    /// Payload contents failed validation.
    pub const INVALID_PAYLOAD: u32 = 2;
    /// Payload length did not match the message type.
    pub const INVALID_SIZE: u32 = 3;
    /// Header magic mismatch.
    pub const INVALID_MAGIC: u32 = 4;
}

/// A buffer descriptor within the accelerator's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireBuffer {
    /// Device-visible address of the buffer.
    pub ptr: u32,
    /// Size in bytes.
    pub size: u32,
}

/// Reference to a network, either DMA-resident or firmware-resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkRef {
    /// Model weights live in a DMA buffer supplied by the host.
    Buffer(WireBuffer),
    /// Model is built into the firmware, selected by index.
    Index(u32),
}

/// Asynchronous error report payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrMsg {
    /// Error class, see [`err_type`].
    pub err_type: u32,
    /// NUL-terminated diagnostic text.
    pub msg: [u8; 128],
}

impl Default for ErrMsg {
    fn default() -> Self {
        Self {
            err_type: err_type::GENERIC,
            msg: [0; 128],
        }
    }
}

impl ErrMsg {
    /// Build an error message, truncating `text` to fit with a trailing NUL.
    pub fn new(err_type: u32, text: &str) -> Self {
        let mut msg = [0u8; 128];
        let n = text.len().min(msg.len() - 1);
        msg[..n].copy_from_slice(&text.as_bytes()[..n]);
        Self { err_type, msg }
    }

    /// Diagnostic text up to the first NUL, lossily decoded.
    pub fn text(&self) -> String {
        let end = self.msg.iter().position(|&b| b == 0).unwrap_or(self.msg.len());
        String::from_utf8_lossy(&self.msg[..end]).into_owned()
    }
}

/// Inference job submission payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceReq {
    /// Number of valid entries in `ifm`.
    pub ifm_count: u32,
    /// Input feature map buffers.
    pub ifm: [WireBuffer; BUFFER_MAX],
    /// Number of valid entries in `ofm`.
    pub ofm_count: u32,
    /// Output feature map buffers.
    pub ofm: [WireBuffer; BUFFER_MAX],
    /// The network to execute.
    pub network: NetworkRef,
    /// PMU event identifiers to count.
    pub pmu_event_config: [u8; PMU_MAX],
    /// Non-zero enables the cycle counter.
    pub pmu_cycle_counter_enable: u32,
}

impl Default for InferenceReq {
    fn default() -> Self {
        Self {
            ifm_count: 0,
            ifm: [WireBuffer::default(); BUFFER_MAX],
            ofm_count: 0,
            ofm: [WireBuffer::default(); BUFFER_MAX],
            network: NetworkRef::Index(0),
            pmu_event_config: [0; PMU_MAX],
            pmu_cycle_counter_enable: 0,
        }
    }
}

/// Inference completion payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceRsp {
    /// Number of valid entries in `ofm_size`.
    pub ofm_count: u32,
    /// Bytes written to each OFM buffer.
    pub ofm_size: [u32; BUFFER_MAX],
    /// Job outcome, raw [`Status`] value.
    pub status: u32,
    /// PMU event identifiers that were counted.
    pub pmu_event_config: [u8; PMU_MAX],
    /// Per-event counts.
    pub pmu_event_count: [u64; PMU_MAX],
    /// Non-zero if the cycle counter ran.
    pub pmu_cycle_counter_enable: u32,
    /// Cycle count for the job.
    pub pmu_cycle_counter_count: u64,
}

impl Default for InferenceRsp {
    fn default() -> Self {
        Self {
            ofm_count: 0,
            ofm_size: [0; BUFFER_MAX],
            status: Status::Ok as u32,
            pmu_event_config: [0; PMU_MAX],
            pmu_event_count: [0; PMU_MAX],
            pmu_cycle_counter_enable: 0,
            pmu_cycle_counter_count: 0,
        }
    }
}

/// Network metadata query payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfoReq {
    /// The network being queried.
    pub network: NetworkRef,
}

/// Network metadata answer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfoRsp {
    /// NUL-terminated model description.
    pub desc: [u8; 32],
    /// Number of input feature maps the model expects.
    pub ifm_count: u32,
    /// Size of each input feature map.
    pub ifm_size: [u32; BUFFER_MAX],
    /// Number of output feature maps the model produces.
    pub ofm_count: u32,
    /// Size of each output feature map.
    pub ofm_size: [u32; BUFFER_MAX],
    /// Query outcome, raw [`Status`] value.
    pub status: u32,
}

impl Default for NetworkInfoRsp {
    fn default() -> Self {
        Self {
            desc: [0; 32],
            ifm_count: 0,
            ifm_size: [0; BUFFER_MAX],
            ofm_count: 0,
            ofm_size: [0; BUFFER_MAX],
            status: Status::Ok as u32,
        }
    }
}

/// Protocol version answer payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionRsp {
    /// Incompatible protocol revisions.
    pub major: u8,
    /// Compatible feature additions.
    pub minor: u8,
    /// Fixes, always accepted.
    pub patch: u8,
}

/// Capabilities answer payload: thirteen little-endian words in firmware
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitiesRsp {
    /// Hardware version status word.
    pub version_status: u32,
    /// Hardware minor version.
    pub version_minor: u32,
    /// Hardware major version.
    pub version_major: u32,
    /// Product major generation.
    pub product_major: u32,
    /// Architecture patch revision.
    pub arch_patch_rev: u32,
    /// Architecture minor revision.
    pub arch_minor_rev: u32,
    /// Architecture major revision.
    pub arch_major_rev: u32,
    /// Firmware driver patch revision.
    pub driver_patch_rev: u32,
    /// Firmware driver minor revision.
    pub driver_minor_rev: u32,
    /// Firmware driver major revision.
    pub driver_major_rev: u32,
    /// Multiply-accumulate operations per clock cycle.
    pub macs_per_cc: u32,
    /// Command stream format version.
    pub cmd_stream_version: u32,
    /// Non-zero if the accelerator has a custom DMA engine.
    pub custom_dma: u32,
}

/// Cancellation request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelInferenceReq {
    /// Correlation id of the inference to abort.
    pub inference_handle: u64,
}

/// Cancellation outcome payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CancelInferenceRsp {
    /// Outcome, raw [`Status`] value.
    pub status: u32,
}

/// One decoded message, payload included.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message {
    Err(ErrMsg),
    Ping,
    Pong,
    InferenceReq(Box<InferenceReq>),
    InferenceRsp(Box<InferenceRsp>),
    VersionReq,
    VersionRsp(VersionRsp),
    CapabilitiesReq,
    CapabilitiesRsp(CapabilitiesRsp),
    NetworkInfoReq(NetworkInfoReq),
    NetworkInfoRsp(Box<NetworkInfoRsp>),
    CancelInferenceReq(CancelInferenceReq),
    CancelInferenceRsp(CancelInferenceRsp),
}

impl Message {
    /// The wire type tag for this message.
    pub const fn msg_type(&self) -> MsgType {
        match self {
            Self::Err(_) => MsgType::Err,
            Self::Ping => MsgType::Ping,
            Self::Pong => MsgType::Pong,
            Self::InferenceReq(_) => MsgType::InferenceReq,
            Self::InferenceRsp(_) => MsgType::InferenceRsp,
            Self::VersionReq => MsgType::VersionReq,
            Self::VersionRsp(_) => MsgType::VersionRsp,
            Self::CapabilitiesReq => MsgType::CapabilitiesReq,
            Self::CapabilitiesRsp(_) => MsgType::CapabilitiesRsp,
            Self::NetworkInfoReq(_) => MsgType::NetworkInfoReq,
            Self::NetworkInfoRsp(_) => MsgType::NetworkInfoRsp,
            Self::CancelInferenceReq(_) => MsgType::CancelInferenceReq,
            Self::CancelInferenceRsp(_) => MsgType::CancelInferenceRsp,
        }
    }
}

/// A decoded packet: header correlation id plus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Correlation id from the header. Zero for uncorrelated messages
    /// (ping, pong, error).
    pub msg_id: u64,
    /// The message body.
    pub msg: Message,
}
