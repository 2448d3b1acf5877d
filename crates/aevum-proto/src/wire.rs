//! Little-endian codec for Aevum packets.
//!
//! Every packet is a 16-byte header followed by a type-specific payload.
//! Payload layouts mirror the firmware's C structs, so the sizes below
//! include C alignment padding: the version response carries one reserved
//! byte, and the inference response pads four bytes before its final
//! 64-bit cycle count. Decoding is strict — a payload whose length is not
//! exactly the expected size for its type is rejected.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::{
    CancelInferenceReq, CancelInferenceRsp, CapabilitiesRsp, ErrMsg, InferenceReq, InferenceRsp,
    Message, MsgType, NetworkInfoReq, NetworkInfoRsp, NetworkRef, Packet, VersionRsp, WireBuffer,
    BUFFER_MAX, MAGIC, PMU_MAX,
};

/// Header size: magic, type, correlation id.
pub const HEADER_SIZE: usize = 16;

/// `ErrMsg` payload size.
pub const ERR_SIZE: usize = 132;
/// `InferenceReq` payload size.
pub const INFERENCE_REQ_SIZE: usize = 288;
/// `InferenceRsp` payload size.
pub const INFERENCE_RSP_SIZE: usize = 160;
/// `VersionRsp` payload size.
pub const VERSION_RSP_SIZE: usize = 4;
/// `CapabilitiesRsp` payload size.
pub const CAPABILITIES_RSP_SIZE: usize = 52;
/// `NetworkInfoReq` payload size.
pub const NETWORK_INFO_REQ_SIZE: usize = 12;
/// `NetworkInfoRsp` payload size.
pub const NETWORK_INFO_RSP_SIZE: usize = 172;
/// `CancelInferenceReq` payload size.
pub const CANCEL_INFERENCE_REQ_SIZE: usize = 8;
/// `CancelInferenceRsp` payload size.
pub const CANCEL_INFERENCE_RSP_SIZE: usize = 4;

/// Codec failures. Magic and size violations map to "bad message" at the
/// driver level; an unknown type is a protocol error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Shorter than a header.
    #[error("packet too short for header: {got} bytes")]
    Truncated {
        /// Bytes received.
        got: usize,
    },

    /// Header magic mismatch.
    #[error("invalid message magic {magic:#010x}")]
    BadMagic {
        /// Magic received.
        magic: u32,
    },

    /// Type tag outside the known range.
    #[error("unknown message type {raw}")]
    UnknownType {
        /// Type received.
        raw: u32,
    },

    /// Payload length does not exactly match the type's layout.
    #[error("{msg_type:?} payload of incorrect size: got {got} bytes, expected {expected}")]
    BadSize {
        /// Message type from the header.
        msg_type: MsgType,
        /// Layout size for that type.
        expected: usize,
        /// Bytes received after the header.
        got: usize,
    },

    /// Network reference kind outside {buffer, index}.
    #[error("invalid network reference kind {kind}")]
    BadNetworkKind {
        /// Kind received.
        kind: u32,
    },
}

/// Expected payload size for a message type, if fixed.
pub const fn payload_size(msg_type: MsgType) -> usize {
    match msg_type {
        MsgType::Err => ERR_SIZE,
        MsgType::Ping | MsgType::Pong | MsgType::VersionReq | MsgType::CapabilitiesReq => 0,
        MsgType::InferenceReq => INFERENCE_REQ_SIZE,
        MsgType::InferenceRsp => INFERENCE_RSP_SIZE,
        MsgType::VersionRsp => VERSION_RSP_SIZE,
        MsgType::CapabilitiesRsp => CAPABILITIES_RSP_SIZE,
        MsgType::NetworkInfoReq => NETWORK_INFO_REQ_SIZE,
        MsgType::NetworkInfoRsp => NETWORK_INFO_RSP_SIZE,
        MsgType::CancelInferenceReq => CANCEL_INFERENCE_REQ_SIZE,
        MsgType::CancelInferenceRsp => CANCEL_INFERENCE_RSP_SIZE,
    }
}

/// Encode a packet for transmission.
pub fn encode(msg_id: u64, msg: &Message) -> Vec<u8> {
    let msg_type = msg.msg_type();
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_size(msg_type));

    buf.put_u32_le(MAGIC);
    buf.put_u32_le(msg_type as u32);
    buf.put_u64_le(msg_id);

    match msg {
        Message::Ping
        | Message::Pong
        | Message::VersionReq
        | Message::CapabilitiesReq => {}
        Message::Err(err) => {
            buf.put_u32_le(err.err_type);
            buf.put_slice(&err.msg);
        }
        Message::InferenceReq(req) => put_inference_req(&mut buf, req),
        Message::InferenceRsp(rsp) => put_inference_rsp(&mut buf, rsp),
        Message::VersionRsp(rsp) => {
            buf.put_u8(rsp.major);
            buf.put_u8(rsp.minor);
            buf.put_u8(rsp.patch);
            buf.put_u8(0);
        }
        Message::CapabilitiesRsp(rsp) => put_capabilities_rsp(&mut buf, rsp),
        Message::NetworkInfoReq(req) => put_network_ref(&mut buf, req.network),
        Message::NetworkInfoRsp(rsp) => put_network_info_rsp(&mut buf, rsp),
        Message::CancelInferenceReq(req) => buf.put_u64_le(req.inference_handle),
        Message::CancelInferenceRsp(rsp) => buf.put_u32_le(rsp.status),
    }

    debug_assert_eq!(buf.len(), HEADER_SIZE + payload_size(msg_type));
    buf.to_vec()
}

/// Decode one packet. Strict: magic must match, the type must be known, and
/// the payload length must equal the type's layout size exactly.
///
/// # Errors
///
/// Returns a [`WireError`] describing the first violation found.
pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
    if data.len() < HEADER_SIZE {
        return Err(WireError::Truncated { got: data.len() });
    }

    let mut buf = data;
    let magic = buf.get_u32_le();
    if magic != MAGIC {
        return Err(WireError::BadMagic { magic });
    }

    let raw_type = buf.get_u32_le();
    let msg_type = MsgType::from_u32(raw_type).ok_or(WireError::UnknownType { raw: raw_type })?;
    let msg_id = buf.get_u64_le();

    let expected = payload_size(msg_type);
    if buf.len() != expected {
        return Err(WireError::BadSize {
            msg_type,
            expected,
            got: buf.len(),
        });
    }

    let msg = match msg_type {
        MsgType::Ping => Message::Ping,
        MsgType::Pong => Message::Pong,
        MsgType::VersionReq => Message::VersionReq,
        MsgType::CapabilitiesReq => Message::CapabilitiesReq,
        MsgType::Err => {
            let err_type = buf.get_u32_le();
            let mut msg = [0u8; 128];
            buf.copy_to_slice(&mut msg);
            Message::Err(ErrMsg { err_type, msg })
        }
        MsgType::InferenceReq => Message::InferenceReq(Box::new(get_inference_req(&mut buf)?)),
        MsgType::InferenceRsp => Message::InferenceRsp(Box::new(get_inference_rsp(&mut buf))),
        MsgType::VersionRsp => {
            let rsp = VersionRsp {
                major: buf.get_u8(),
                minor: buf.get_u8(),
                patch: buf.get_u8(),
            };
            buf.advance(1);
            Message::VersionRsp(rsp)
        }
        MsgType::CapabilitiesRsp => Message::CapabilitiesRsp(get_capabilities_rsp(&mut buf)),
        MsgType::NetworkInfoReq => Message::NetworkInfoReq(NetworkInfoReq {
            network: get_network_ref(&mut buf)?,
        }),
        MsgType::NetworkInfoRsp => {
            Message::NetworkInfoRsp(Box::new(get_network_info_rsp(&mut buf)))
        }
        MsgType::CancelInferenceReq => Message::CancelInferenceReq(CancelInferenceReq {
            inference_handle: buf.get_u64_le(),
        }),
        MsgType::CancelInferenceRsp => Message::CancelInferenceRsp(CancelInferenceRsp {
            status: buf.get_u32_le(),
        }),
    };

    Ok(Packet { msg_id, msg })
}

fn put_wire_buffer(buf: &mut BytesMut, wb: WireBuffer) {
    buf.put_u32_le(wb.ptr);
    buf.put_u32_le(wb.size);
}

fn get_wire_buffer(buf: &mut &[u8]) -> WireBuffer {
    WireBuffer {
        ptr: buf.get_u32_le(),
        size: buf.get_u32_le(),
    }
}

fn put_network_ref(buf: &mut BytesMut, net: NetworkRef) {
    match net {
        NetworkRef::Buffer(wb) => {
            buf.put_u32_le(1);
            put_wire_buffer(buf, wb);
        }
        NetworkRef::Index(index) => {
            buf.put_u32_le(2);
            buf.put_u32_le(index);
            buf.put_u32_le(0); // union padding
        }
    }
}

fn get_network_ref(buf: &mut &[u8]) -> Result<NetworkRef, WireError> {
    let kind = buf.get_u32_le();
    let net = match kind {
        1 => NetworkRef::Buffer(get_wire_buffer(buf)),
        2 => {
            let index = buf.get_u32_le();
            buf.advance(4);
            NetworkRef::Index(index)
        }
        _ => return Err(WireError::BadNetworkKind { kind }),
    };
    Ok(net)
}

fn put_inference_req(buf: &mut BytesMut, req: &InferenceReq) {
    buf.put_u32_le(req.ifm_count);
    for wb in req.ifm {
        put_wire_buffer(buf, wb);
    }
    buf.put_u32_le(req.ofm_count);
    for wb in req.ofm {
        put_wire_buffer(buf, wb);
    }
    put_network_ref(buf, req.network);
    buf.put_slice(&req.pmu_event_config);
    buf.put_u32_le(req.pmu_cycle_counter_enable);
}

fn get_inference_req(buf: &mut &[u8]) -> Result<InferenceReq, WireError> {
    let mut req = InferenceReq {
        ifm_count: buf.get_u32_le(),
        ..InferenceReq::default()
    };
    for wb in &mut req.ifm {
        *wb = get_wire_buffer(buf);
    }
    req.ofm_count = buf.get_u32_le();
    for wb in &mut req.ofm {
        *wb = get_wire_buffer(buf);
    }
    req.network = get_network_ref(buf)?;
    buf.copy_to_slice(&mut req.pmu_event_config);
    req.pmu_cycle_counter_enable = buf.get_u32_le();
    Ok(req)
}

fn put_inference_rsp(buf: &mut BytesMut, rsp: &InferenceRsp) {
    buf.put_u32_le(rsp.ofm_count);
    for size in rsp.ofm_size {
        buf.put_u32_le(size);
    }
    buf.put_u32_le(rsp.status);
    buf.put_slice(&rsp.pmu_event_config);
    for count in rsp.pmu_event_count {
        buf.put_u64_le(count);
    }
    buf.put_u32_le(rsp.pmu_cycle_counter_enable);
    buf.put_u32_le(0); // alignment padding before the u64 below
    buf.put_u64_le(rsp.pmu_cycle_counter_count);
}

fn get_inference_rsp(buf: &mut &[u8]) -> InferenceRsp {
    let mut rsp = InferenceRsp {
        ofm_count: buf.get_u32_le(),
        ..InferenceRsp::default()
    };
    for size in &mut rsp.ofm_size {
        *size = buf.get_u32_le();
    }
    rsp.status = buf.get_u32_le();
    buf.copy_to_slice(&mut rsp.pmu_event_config);
    for count in &mut rsp.pmu_event_count {
        *count = buf.get_u64_le();
    }
    rsp.pmu_cycle_counter_enable = buf.get_u32_le();
    buf.advance(4);
    rsp.pmu_cycle_counter_count = buf.get_u64_le();
    rsp
}

fn put_capabilities_rsp(buf: &mut BytesMut, rsp: &CapabilitiesRsp) {
    for word in [
        rsp.version_status,
        rsp.version_minor,
        rsp.version_major,
        rsp.product_major,
        rsp.arch_patch_rev,
        rsp.arch_minor_rev,
        rsp.arch_major_rev,
        rsp.driver_patch_rev,
        rsp.driver_minor_rev,
        rsp.driver_major_rev,
        rsp.macs_per_cc,
        rsp.cmd_stream_version,
        rsp.custom_dma,
    ] {
        buf.put_u32_le(word);
    }
}

fn get_capabilities_rsp(buf: &mut &[u8]) -> CapabilitiesRsp {
    CapabilitiesRsp {
        version_status: buf.get_u32_le(),
        version_minor: buf.get_u32_le(),
        version_major: buf.get_u32_le(),
        product_major: buf.get_u32_le(),
        arch_patch_rev: buf.get_u32_le(),
        arch_minor_rev: buf.get_u32_le(),
        arch_major_rev: buf.get_u32_le(),
        driver_patch_rev: buf.get_u32_le(),
        driver_minor_rev: buf.get_u32_le(),
        driver_major_rev: buf.get_u32_le(),
        macs_per_cc: buf.get_u32_le(),
        cmd_stream_version: buf.get_u32_le(),
        custom_dma: buf.get_u32_le(),
    }
}

fn put_network_info_rsp(buf: &mut BytesMut, rsp: &NetworkInfoRsp) {
    buf.put_slice(&rsp.desc);
    buf.put_u32_le(rsp.ifm_count);
    for size in rsp.ifm_size {
        buf.put_u32_le(size);
    }
    buf.put_u32_le(rsp.ofm_count);
    for size in rsp.ofm_size {
        buf.put_u32_le(size);
    }
    buf.put_u32_le(rsp.status);
}

fn get_network_info_rsp(buf: &mut &[u8]) -> NetworkInfoRsp {
    let mut rsp = NetworkInfoRsp::default();
    buf.copy_to_slice(&mut rsp.desc);
    rsp.ifm_count = buf.get_u32_le();
    for size in &mut rsp.ifm_size {
        *size = buf.get_u32_le();
    }
    rsp.ofm_count = buf.get_u32_le();
    for size in &mut rsp.ofm_size {
        *size = buf.get_u32_le();
    }
    rsp.status = buf.get_u32_le();
    rsp
}
