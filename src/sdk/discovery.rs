use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::control::{ControlClient, Protocol, RequestError};
use crate::device::{DeviceIdentity, SUPPORTED_FAMILY};
use crate::messages::DiscoveryReply;
use crate::transport::{Channel, DatagramChannel, TransportError};

/// A device that answered a discovery request.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub addr: SocketAddr,
    pub identity: DeviceIdentity,
    pub reply: DiscoveryReply,
}

impl DiscoveredDevice {
    pub fn is_supported(&self) -> bool {
        self.identity.is_supported_by(SUPPORTED_FAMILY)
    }
}

/// Errors emitted by the SDK discovery helper.
#[derive(Debug, Error)]
pub enum DiscoveryClientError {
    #[error("io error: {0}")]
    Io(#[from] TransportError),
    #[error("discovery failed: {0}")]
    Request(#[from] RequestError),
}

/// One discovery exchange with `device`, without starting a session.
pub async fn probe_device(
    local: SocketAddr,
    device: SocketAddr,
    timeout: Duration,
) -> Result<DiscoveredDevice, DiscoveryClientError> {
    let channel = DatagramChannel::connect(local, device).await?;
    let control = ControlClient::new(Protocol::new(timeout));
    let result = control.discover(&channel).await;
    channel.close().await;
    let reply = result?;
    Ok(DiscoveredDevice {
        addr: device,
        identity: DeviceIdentity::from(&reply),
        reply,
    })
}
