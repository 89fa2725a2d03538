//! Payload layouts for each OASE message type.
//!
//! Request payloads are built here; reply decoders check the documented minimum
//! length before touching any offset and report [`PacketError`] otherwise.
use crate::packet::PacketError;

/// Minimum discovery reply size.
pub const DISCOVERY_REPLY_LEN: usize = 324;
/// Minimum alive reply size.
pub const ALIVE_REPLY_LEN: usize = 33;
/// Fixed password buffer size.
pub const PASSWORD_LEN: usize = 64;
/// Header bytes of a live scene reply before the sub-payload.
pub const LIVE_SCENE_HEADER_LEN: usize = 11;
/// Size of the socket scene sub-payload.
pub const SOCKET_SCENE_LEN: usize = 5;

fn require_min(message: &'static str, data: &[u8], expected: usize) -> Result<(), PacketError> {
    if data.len() < expected {
        return Err(PacketError::ResponseTooShort {
            message,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn require_exact(message: &'static str, data: &[u8], expected: usize) -> Result<(), PacketError> {
    if data.len() != expected {
        return Err(PacketError::UnexpectedLength {
            message,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// ASCII field with trailing NULs removed.
fn ascii_trimmed(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Reply to a discovery / device-info request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryReply {
    pub hardware_type: u8,
    pub device_index: u8,
    pub name: String,
    pub serial: String,
    pub long_name: String,
    pub order: u32,
    pub firmware: u8,
    pub rmem_version: u8,
    pub cmem_version: u8,
    pub firmware_low: u8,
    pub firmware_high: u8,
    pub wifi_channel: u8,
    pub network: u8,
    pub status: String,
}

impl DiscoveryReply {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require_min("discovery reply", data, DISCOVERY_REPLY_LEN)?;
        Ok(Self {
            hardware_type: data[0],
            device_index: data[1],
            name: ascii_trimmed(&data[2..34]),
            serial: String::from_utf8_lossy(&data[34..46]).into_owned(),
            long_name: ascii_trimmed(&data[66..130]),
            order: read_u32(data, 130),
            firmware: data[187],
            rmem_version: data[192],
            cmem_version: data[193],
            firmware_low: data[194],
            firmware_high: data[195],
            wifi_channel: data[196],
            network: data[197],
            status: ascii_trimmed(&data[199..323]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveReply {
    pub serial: String,
}

impl AliveReply {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require_min("alive reply", data, ALIVE_REPLY_LEN)?;
        Ok(Self {
            serial: String::from_utf8_lossy(&data[0..12]).into_owned(),
        })
    }
}

/// Asks the device to open a TLS connection back to `port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHandoffRequest {
    pub port: u16,
    /// Unix time in seconds, truncated to 32 bits.
    pub timestamp: u32,
}

impl TcpHandoffRequest {
    pub fn encode(&self) -> [u8; 7] {
        let mut buf = [0u8; 7];
        buf[1..3].copy_from_slice(&self.port.to_le_bytes());
        buf[3..7].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHandoffReply {
    pub success: bool,
    pub connection_count: u8,
}

impl TcpHandoffReply {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require_min("tcp handoff reply", data, 2)?;
        Ok(Self {
            success: data[0] == 1,
            connection_count: data[1],
        })
    }
}

/// Builds the fixed 64-byte password buffer.
///
/// With `unicode_escaped` set, `\uXXXX` sequences are decoded first. The UTF-8
/// bytes are truncated to 64 and the rest of the buffer stays zero.
pub fn encode_password(password: &str, unicode_escaped: bool) -> [u8; PASSWORD_LEN] {
    let decoded;
    let input = if unicode_escaped {
        decoded = decode_unicode_escapes(password);
        decoded.as_str()
    } else {
        password
    };
    let mut buf = [0u8; PASSWORD_LEN];
    let bytes = input.as_bytes();
    let len = bytes.len().min(PASSWORD_LEN);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

/// Replaces `\uXXXX` escapes with the characters they name.
///
/// Escapes are UTF-16 code units, so surrogate pairs combine and lone
/// surrogates become U+FFFD. Anything that is not a complete escape is kept.
pub fn decode_unicode_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut units: Vec<u16> = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(unit) = parse_escape(rest) {
            units.push(unit);
            rest = &rest[6..];
            continue;
        }
        flush_units(&mut units, &mut out);
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    flush_units(&mut units, &mut out);
    out
}

fn parse_escape(s: &str) -> Option<u16> {
    let hex = s.strip_prefix("\\u")?.get(..4)?;
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

fn flush_units(units: &mut Vec<u16>, out: &mut String) {
    out.extend(
        char::decode_utf16(units.drain(..)).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)),
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordReply {
    pub success: bool,
}

impl PasswordReply {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require_exact("password check reply", data, 1)?;
        Ok(Self {
            success: data[0] == 1,
        })
    }
}

/// Reply to a get-live-scene request. `data` holds the vendor sub-payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSceneReply {
    pub scene_type: u8,
    pub id: u32,
    pub count: u32,
    pub sub_type: u8,
    pub sub_length: u8,
    pub data: Vec<u8>,
}

impl LiveSceneReply {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require_min("live scene reply", data, LIVE_SCENE_HEADER_LEN)?;
        let sub_length = data[10];
        let end = (LIVE_SCENE_HEADER_LEN + sub_length as usize).min(data.len());
        Ok(Self {
            scene_type: data[0],
            id: read_u32(data, 1),
            count: read_u32(data, 5),
            sub_type: data[9],
            sub_length,
            data: data[LIVE_SCENE_HEADER_LEN..end].to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetLiveSceneReply {
    pub success: bool,
}

impl SetLiveSceneReply {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require_min("set live scene reply", data, 1)?;
        Ok(Self {
            success: data[0] == 1,
        })
    }
}

/// Outlet/dimmer snapshot carried in a live scene sub-payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketScene {
    pub outlets: [bool; 4],
    pub dimmer: u8,
}

impl SocketScene {
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        require_exact("socket scene", data, SOCKET_SCENE_LEN)?;
        Ok(Self {
            outlets: [
                data[0] == 0xFF,
                data[1] == 0xFF,
                data[2] == 0xFF,
                data[3] == 0xFF,
            ],
            dimmer: data[4],
        })
    }
}
