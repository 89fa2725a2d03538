//! Control engine for OASE FM-Master pond controllers.
//!
//! Implements the binary frame codec, the per-message payload layouts, the UDP
//! and dial-back TLS channels with single-flight request correlation, and the
//! session lifecycle that discovers, authenticates and polls the device.

pub mod config;
pub mod control;
pub mod device;
pub mod messages;
pub mod packet;
pub mod sdk;
pub mod session;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use control::{ControlClient, Protocol, RequestError};
pub use device::{DeviceIdentity, DeviceState, OutletCommand, OutletSlot};
pub use messages::{DiscoveryReply, SocketScene};
pub use packet::{MessageType, Packet, PacketCodec, PacketError};
pub use sdk::{probe_device, ClientError, OaseClient};
pub use session::{Session, SessionConfig, SessionError, SessionEvent, SessionState};
pub use transport::{Channel, DatagramChannel, StreamChannel, TransportError};
