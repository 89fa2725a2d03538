//! FM-Master outlet/dimmer helpers and the typed device state published to hosts.
use std::fmt;

use crate::messages::{DiscoveryReply, SocketScene};

/// Long-name prefix of the only supported device family.
pub const SUPPORTED_FAMILY: &str = "FM-Master EGC";

const SOCKET_SCENE_ID: u8 = 4;
const SOCKET_SCENE_TYPE: u8 = 100;

/// Identity reported by a discovery reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub serial: String,
    pub long_name: String,
}

impl DeviceIdentity {
    pub fn is_supported_by(&self, family: &str) -> bool {
        self.long_name.starts_with(family)
    }
}

impl From<&DiscoveryReply> for DeviceIdentity {
    fn from(reply: &DiscoveryReply) -> Self {
        Self {
            name: reply.name.clone(),
            serial: reply.serial.clone(),
            long_name: reply.long_name.clone(),
        }
    }
}

/// The five writable items of an FM-Master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutletSlot {
    Outlet1,
    Outlet2,
    Outlet3,
    Outlet4,
    /// Intensity of outlet 4.
    Dimmer,
}

impl OutletSlot {
    pub const ALL: [OutletSlot; 5] = [
        OutletSlot::Outlet1,
        OutletSlot::Outlet2,
        OutletSlot::Outlet3,
        OutletSlot::Outlet4,
        OutletSlot::Dimmer,
    ];

    pub fn item_id(self) -> u8 {
        match self {
            OutletSlot::Outlet1 => 0x00,
            OutletSlot::Outlet2 => 0x01,
            OutletSlot::Outlet3 => 0x02,
            OutletSlot::Outlet4 => 0x03,
            OutletSlot::Dimmer => 0x04,
        }
    }

    pub fn from_item_id(item_id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|slot| slot.item_id() == item_id)
    }

    /// Index of the outlet whose write protection governs this slot.
    pub(crate) fn outlet_index(self) -> usize {
        match self {
            OutletSlot::Outlet1 => 0,
            OutletSlot::Outlet2 => 1,
            OutletSlot::Outlet3 => 2,
            OutletSlot::Outlet4 | OutletSlot::Dimmer => 3,
        }
    }
}

impl fmt::Display for OutletSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutletSlot::Outlet1 => write!(f, "outlet1"),
            OutletSlot::Outlet2 => write!(f, "outlet2"),
            OutletSlot::Outlet3 => write!(f, "outlet3"),
            OutletSlot::Outlet4 => write!(f, "outlet4"),
            OutletSlot::Dimmer => write!(f, "outlet4_dimmer"),
        }
    }
}

/// Rejected outlet write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown item id {0:#04x}")]
    UnknownItem(u8),
    #[error("value {0} outside 0..=255")]
    ValueOutOfRange(i64),
}

/// A validated write for one outlet or the dimmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutletCommand {
    pub slot: OutletSlot,
    pub value: u8,
}

impl OutletCommand {
    /// Validates a raw item id / value pair as delivered by a host.
    pub fn new(item_id: u8, value: i64) -> Result<Self, CommandError> {
        let slot = OutletSlot::from_item_id(item_id).ok_or(CommandError::UnknownItem(item_id))?;
        let value = u8::try_from(value).map_err(|_| CommandError::ValueOutOfRange(value))?;
        Ok(Self { slot, value })
    }

    /// On maps to 0xFF, off to 0x00.
    pub fn switch(slot: OutletSlot, on: bool) -> Self {
        Self {
            slot,
            value: if on { 0xFF } else { 0x00 },
        }
    }

    pub fn dimmer(intensity: u8) -> Self {
        Self {
            slot: OutletSlot::Dimmer,
            value: intensity,
        }
    }

    /// Set-live-scene payload carrying this write.
    pub fn scene_payload(&self) -> [u8; 13] {
        socket_scene_set_request(self.slot, self.value)
    }
}

/// Get-live-scene payload that selects the socket scene.
pub fn socket_scene_get_request() -> [u8; 5] {
    let mut buf = [0u8; 5];
    buf[0] = SOCKET_SCENE_ID;
    buf
}

/// Set-live-scene payload: scene id, two zero words, scene type, sub-length 2, item, value.
pub fn socket_scene_set_request(slot: OutletSlot, value: u8) -> [u8; 13] {
    let mut buf = [0u8; 13];
    buf[0] = SOCKET_SCENE_ID;
    buf[9] = SOCKET_SCENE_TYPE;
    buf[10] = 2;
    buf[11] = slot.item_id();
    buf[12] = value;
    buf
}

/// Snapshot of everything the engine knows about the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub identity: Option<DeviceIdentity>,
    pub connected: bool,
    pub outlets: [bool; 4],
    pub dimmer: u8,
}

impl DeviceState {
    pub fn apply_scene(&mut self, scene: &SocketScene) {
        self.outlets = scene.outlets;
        self.dimmer = scene.dimmer;
    }

    pub fn outlet(&self, slot: OutletSlot) -> Option<bool> {
        match slot {
            OutletSlot::Dimmer => None,
            other => Some(self.outlets[other.outlet_index()]),
        }
    }
}

/// Host-controlled write protection for the four outlets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutletProtection {
    read_only: [bool; 4],
}

impl OutletProtection {
    pub fn set(&mut self, slot: OutletSlot, read_only: bool) {
        self.read_only[slot.outlet_index()] = read_only;
    }

    /// The dimmer shares outlet 4's flag.
    pub fn is_read_only(&self, slot: OutletSlot) -> bool {
        self.read_only[slot.outlet_index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_validation() {
        let cmd = OutletCommand::new(0x02, 0xFF).unwrap();
        assert_eq!(cmd.slot, OutletSlot::Outlet3);
        assert_eq!(cmd.value, 0xFF);

        assert_eq!(OutletCommand::new(0x05, 1), Err(CommandError::UnknownItem(0x05)));
        assert_eq!(OutletCommand::new(0x04, 256), Err(CommandError::ValueOutOfRange(256)));
        assert_eq!(OutletCommand::new(0x00, -1), Err(CommandError::ValueOutOfRange(-1)));
        assert!(OutletCommand::new(0x04, 0).is_ok());
    }

    #[test]
    fn switch_maps_booleans() {
        assert_eq!(OutletCommand::switch(OutletSlot::Outlet1, true).value, 0xFF);
        assert_eq!(OutletCommand::switch(OutletSlot::Outlet1, false).value, 0x00);
    }

    #[test]
    fn scene_requests_layout() {
        assert_eq!(socket_scene_get_request(), [4, 0, 0, 0, 0]);
        assert_eq!(
            OutletCommand::switch(OutletSlot::Outlet3, true).scene_payload(),
            [4, 0, 0, 0, 0, 0, 0, 0, 0, 100, 2, 0x02, 0xFF]
        );
        assert_eq!(
            OutletCommand::dimmer(0x40).scene_payload(),
            [4, 0, 0, 0, 0, 0, 0, 0, 0, 100, 2, 0x04, 0x40]
        );
    }

    #[test]
    fn dimmer_follows_outlet4_protection() {
        let mut protection = OutletProtection::default();
        protection.set(OutletSlot::Outlet4, true);
        assert!(protection.is_read_only(OutletSlot::Dimmer));
        assert!(!protection.is_read_only(OutletSlot::Outlet1));
    }

    #[test]
    fn supported_family_is_prefix_match() {
        let identity = DeviceIdentity {
            long_name: "FM-Master EGC-v2".into(),
            ..Default::default()
        };
        assert!(identity.is_supported_by(SUPPORTED_FAMILY));
        let other = DeviceIdentity {
            long_name: "Other-Device".into(),
            ..Default::default()
        };
        assert!(!other.is_supported_by(SUPPORTED_FAMILY));
    }
}
