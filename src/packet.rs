//! Packet framing for the OASE wire protocol.
//!
//! Every frame is a fixed 16-byte header followed by the payload. All
//! multi-byte integers are little-endian.
//!
//! ```text
//! offset 0  : 4 bytes  magic delimiter  5C 23 4F 41
//! offset 4  : 4 bytes  payload length (u32)
//! offset 8  : 1 byte   version (2)
//! offset 9  : 1 byte   transaction id (wraps at 255)
//! offset 10 : 2 bytes  message type (u16)
//! offset 12 : 4 bytes  reserved (zero)
//! offset 16 : N bytes  payload
//! ```
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::warn;

/// Frame start delimiter.
pub const MAGIC: [u8; 4] = [0x5c, 0x23, 0x4f, 0x41];
/// Size of the fixed header.
pub const HEADER_LEN: usize = 16;
/// Version tag stamped on every outbound packet.
pub const PROTOCOL_VERSION: u8 = 2;
/// Largest payload accepted from the secure stream.
pub const MAX_FRAME_PAYLOAD: usize = 64 * 1024;

/// Message type identifiers carried in the header.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Discovery / device-info request.
    DeviceInfo = 4096,
    Alive = 4352,
    /// Instructs the device to dial back over TLS.
    TcpHandoff = 5120,
    PasswordCheck = 40704,
    SetLiveScene = 50176,
    GetLiveScene = 50432,
}

impl MessageType {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4096 => Some(Self::DeviceInfo),
            4352 => Some(Self::Alive),
            5120 => Some(Self::TcpHandoff),
            40704 => Some(Self::PasswordCheck),
            50176 => Some(Self::SetLiveScene),
            50432 => Some(Self::GetLiveScene),
            _ => None,
        }
    }
}

/// Errors raised while parsing frames or message payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    #[error("packet length mismatch: header declares {declared} bytes, {actual} present")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("invalid length for {message}: need at least {expected} bytes, got {actual}")]
    ResponseTooShort {
        message: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("invalid length for {message}: need exactly {expected} bytes, got {actual}")]
    UnexpectedLength {
        message: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("frame payload of {0} bytes exceeds the stream limit")]
    Oversized(usize),
}

/// A parsed frame. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub length: u32,
    pub version: u8,
    pub transaction_id: u8,
    pub message_type: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Known message type, if the code is one the engine understands.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_code(self.message_type)
    }
}

/// Wrapping 8-bit transaction counter shared by every transport of one protocol instance.
#[derive(Debug, Default)]
pub struct TransactionCounter {
    next: AtomicU8,
}

impl TransactionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current id and advances; 255 wraps to 0.
    pub fn advance(&self) -> u8 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    pub fn peek(&self) -> u8 {
        self.next.load(Ordering::Relaxed)
    }
}

/// Encoder/decoder for complete frames.
#[derive(Debug, Default)]
pub struct PacketCodec {
    counter: TransactionCounter,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> &TransactionCounter {
        &self.counter
    }

    /// Builds a frame for `message_type`, consuming one transaction id.
    pub fn encode(&self, message_type: MessageType, payload: &[u8]) -> Vec<u8> {
        self.encode_raw(message_type.code(), payload)
    }

    /// Same as [`encode`](Self::encode) for codes outside [`MessageType`].
    pub fn encode_raw(&self, message_type: u16, payload: &[u8]) -> Vec<u8> {
        let txn = self.counter.advance();
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.push(PROTOCOL_VERSION);
        buf.push(txn);
        buf.extend_from_slice(&message_type.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(payload);
        buf
    }

    /// Parses a complete frame.
    ///
    /// The payload is everything after the header. A header that declares more
    /// payload than is present fails with [`PacketError::LengthMismatch`].
    pub fn decode(bytes: &[u8]) -> Result<Packet, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::Malformed("shorter than header"));
        }
        if bytes[0..4] != MAGIC {
            return Err(PacketError::Malformed("invalid start delimiter"));
        }
        let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let payload = &bytes[HEADER_LEN..];
        if length as usize > payload.len() {
            return Err(PacketError::LengthMismatch {
                declared: length,
                actual: payload.len(),
            });
        }
        Ok(Packet {
            length,
            version: bytes[8],
            transaction_id: bytes[9],
            message_type: u16::from_le_bytes([bytes[10], bytes[11]]),
            payload: payload.to_vec(),
        })
    }
}

/// Splits a byte stream into whole frames using the header's length field.
#[derive(Debug, Default)]
pub struct PacketFramer;

impl Decoder for PacketFramer {
    type Item = Vec<u8>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(start) = find_magic(src) {
            if start > 0 {
                warn!(discarded = start, "dropping bytes before frame delimiter");
                src.advance(start);
            }
        } else {
            // Keep a possible partial delimiter at the tail.
            let keep = src.len().min(MAGIC.len() - 1);
            if src.len() > keep {
                warn!(discarded = src.len() - keep, "dropping bytes without frame delimiter");
                src.advance(src.len() - keep);
            }
            return Ok(None);
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                PacketError::Oversized(length),
            ));
        }
        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(total).to_vec()))
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// Uppercase hex dump used in packet logs.
pub fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_writes_header_fields_in_order() {
        let codec = PacketCodec::new();
        let bytes = codec.encode(MessageType::TcpHandoff, &[1, 2, 3]);
        assert_eq!(&bytes[0..4], &MAGIC);
        assert_eq!(&bytes[4..8], &3u32.to_le_bytes());
        assert_eq!(bytes[8], PROTOCOL_VERSION);
        assert_eq!(bytes[9], 0);
        assert_eq!(&bytes[10..12], &5120u16.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        assert_eq!(&bytes[16..], &[1, 2, 3]);
    }

    #[test]
    fn decode_recovers_type_and_payload() {
        let codec = PacketCodec::new();
        let payload = vec![0xAA; 40];
        let packet = PacketCodec::decode(&codec.encode(MessageType::GetLiveScene, &payload)).unwrap();
        assert_eq!(packet.kind(), Some(MessageType::GetLiveScene));
        assert_eq!(packet.payload, payload);
        assert_eq!(packet.length, 40);
        assert_eq!(packet.version, PROTOCOL_VERSION);
    }

    #[test]
    fn transaction_id_wraps_after_255() {
        let codec = PacketCodec::new();
        let mut seen = Vec::new();
        for _ in 0..258 {
            let bytes = codec.encode(MessageType::Alive, &[]);
            seen.push(bytes[9]);
        }
        assert_eq!(seen[0], 0);
        assert_eq!(seen[255], 255);
        assert_eq!(seen[256], 0);
        assert_eq!(seen[257], 1);
        for pair in seen.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1));
        }
    }

    #[test]
    fn decode_rejects_short_and_foreign_frames() {
        assert_eq!(
            PacketCodec::decode(&[0x5c, 0x23, 0x4f]),
            Err(PacketError::Malformed("shorter than header"))
        );
        let mut bytes = PacketCodec::new().encode(MessageType::Alive, &[]);
        bytes[0] = 0x00;
        assert_eq!(
            PacketCodec::decode(&bytes),
            Err(PacketError::Malformed("invalid start delimiter"))
        );
    }

    #[test]
    fn decode_flags_truncated_payload() {
        let mut bytes = PacketCodec::new().encode(MessageType::Alive, &[1, 2, 3, 4]);
        bytes.truncate(18);
        assert_eq!(
            PacketCodec::decode(&bytes),
            Err(PacketError::LengthMismatch {
                declared: 4,
                actual: 2
            })
        );
    }

    #[test]
    fn framer_splits_coalesced_and_partial_frames() {
        let codec = PacketCodec::new();
        let first = codec.encode(MessageType::PasswordCheck, &[1]);
        let second = codec.encode(MessageType::SetLiveScene, &[1, 2]);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xde, 0xad]);
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..10]);

        let mut framer = PacketFramer;
        assert_eq!(framer.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(framer.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&second[10..]);
        assert_eq!(framer.decode(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn framer_rejects_oversized_frames() {
        let mut header = Vec::from(MAGIC);
        header.extend_from_slice(&((MAX_FRAME_PAYLOAD as u32) + 1).to_le_bytes());
        header.extend_from_slice(&[2, 0, 0, 0x10, 0, 0, 0, 0]);
        let mut buf = BytesMut::from(&header[..]);
        assert!(PacketFramer.decode(&mut buf).is_err());
    }

    #[test]
    fn hex_dump_is_uppercase() {
        assert_eq!(hex(&[0x5c, 0x0a]), "5C0A");
    }
}
