//! Device wire protocol
//!
//! Every message is a fixed 64-byte frame: a 16-byte header
//! `[version:1][type:1][device id:6][counter:8]` followed by a 48-byte
//! payload padded with `0xFF`. The device id is big-endian; the counter is
//! little-endian, as the controllers copy it straight from memory.

use crate::heater::HeaterMode;
use std::fmt;
use thiserror::Error;

pub const FRAME_SIZE: usize = 64;
pub const HEADER_SIZE: usize = 16;
pub const PAYLOAD_SIZE: usize = FRAME_SIZE - HEADER_SIZE;
pub const PROTOCOL_VERSION: u8 = 1;

const PADDING: u8 = 0xFF;

/// Message type codes
pub const TYPE_STATE_REQUEST: u8 = 1;
pub const TYPE_STATE_REPLY: u8 = 2;

/// 48-bit link-layer address packed into the low bits of a u64
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; 6]) -> Self {
        let mut packed = [0u8; 8];
        packed[2..].copy_from_slice(&bytes);
        Self(u64::from_be_bytes(packed))
    }

    pub fn to_bytes(self) -> [u8; 6] {
        let packed = self.0.to_be_bytes();
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&packed[2..]);
        bytes
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: u8,
    pub device_id: DeviceId,
    pub counter: u64,
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Device asks which mode to run; `name` is already upper-cased and
    /// validated, `None` when absent or rejected.
    StateRequest {
        header: Header,
        name: Option<String>,
    },
    /// Hub-to-device reply. Never legitimate when received by the hub.
    StateReply { header: Header, mode_code: u8 },
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::StateRequest { header, .. } | Message::StateReply { header, .. } => header,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame is {0} bytes, expected {FRAME_SIZE}")]
    WrongLength(usize),

    #[error("protocol version {0} not supported")]
    UnsupportedVersion(u8),

    #[error("unknown message type {message_type} from device {device_id}")]
    UnknownType { message_type: u8, device_id: DeviceId },
}

/// Decode one frame. The buffer must be exactly [`FRAME_SIZE`] bytes.
pub fn decode(frame: &[u8]) -> Result<Message, DecodeError> {
    let frame: &[u8; FRAME_SIZE] = frame
        .try_into()
        .map_err(|_| DecodeError::WrongLength(frame.len()))?;

    let header = decode_header(frame);
    if header.version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(header.version));
    }

    let payload = &frame[HEADER_SIZE..];
    match header.message_type {
        TYPE_STATE_REQUEST => Ok(Message::StateRequest {
            header,
            name: decode_name(payload),
        }),
        TYPE_STATE_REPLY => Ok(Message::StateReply {
            header,
            mode_code: payload[0],
        }),
        other => Err(DecodeError::UnknownType {
            message_type: other,
            device_id: header.device_id,
        }),
    }
}

fn decode_header(frame: &[u8; FRAME_SIZE]) -> Header {
    let mut id = [0u8; 6];
    id.copy_from_slice(&frame[2..8]);
    let mut counter = [0u8; 8];
    counter.copy_from_slice(&frame[8..16]);

    Header {
        version: frame[0],
        message_type: frame[1],
        device_id: DeviceId::from_bytes(id),
        counter: u64::from_le_bytes(counter),
    }
}

/// Read the NUL/0xFF-terminated name, upper-casing as we go.
fn decode_name(payload: &[u8]) -> Option<String> {
    let raw: String = payload
        .iter()
        .take_while(|&&b| b != 0x00 && b != PADDING)
        .map(|&b| (b as char).to_ascii_uppercase())
        .collect();

    if raw.is_empty() {
        return None;
    }
    if !crate::access::is_valid_heater_name(&raw) {
        tracing::warn!(name = %raw.escape_debug(), "Invalid name in state request, treating device as anonymous");
        return None;
    }
    Some(raw)
}

fn encode_header(header: &Header, frame: &mut [u8; FRAME_SIZE]) {
    frame[0] = header.version;
    frame[1] = header.message_type;
    frame[2..8].copy_from_slice(&header.device_id.to_bytes());
    frame[8..16].copy_from_slice(&header.counter.to_le_bytes());
}

/// Build the hub's reply carrying `mode` for the requesting device.
pub fn encode_state_reply(hub_id: DeviceId, counter: u64, mode: HeaterMode) -> [u8; FRAME_SIZE] {
    let mut frame = [PADDING; FRAME_SIZE];
    encode_header(
        &Header {
            version: PROTOCOL_VERSION,
            message_type: TYPE_STATE_REPLY,
            device_id: hub_id,
            counter,
        },
        &mut frame,
    );
    frame[HEADER_SIZE] = mode.code();
    frame
}

/// Build a device-side state request. Used by tooling and tests.
pub fn encode_state_request(
    device_id: DeviceId,
    counter: u64,
    name: Option<&str>,
) -> [u8; FRAME_SIZE] {
    let mut frame = [PADDING; FRAME_SIZE];
    encode_header(
        &Header {
            version: PROTOCOL_VERSION,
            message_type: TYPE_STATE_REQUEST,
            device_id,
            counter,
        },
        &mut frame,
    );
    if let Some(name) = name {
        let bytes = name.as_bytes();
        // Leave room for the terminator
        let len = bytes.len().min(PAYLOAD_SIZE - 1);
        frame[HEADER_SIZE..HEADER_SIZE + len].copy_from_slice(&bytes[..len]);
        frame[HEADER_SIZE + len] = 0x00;
    }
    frame
}
