use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::device::{socket_scene_get_request, OutletCommand};
use crate::messages::{
    encode_password, AliveReply, DiscoveryReply, LiveSceneReply, PasswordReply,
    SetLiveSceneReply, SocketScene, TcpHandoffReply, TcpHandoffRequest,
};
use crate::packet::{hex, MessageType, Packet, PacketCodec, PacketError};
use crate::transport::{Channel, TransportError};

/// Deadline applied to every request on either channel.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Failure of a single request/response exchange.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

impl RequestError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestError::Transport(TransportError::Timeout { .. }))
    }
}

/// Pairs each outbound frame with the next inbound frame on the same channel.
///
/// One `Protocol` owns the transaction counter for every channel it talks
/// through. Replies are not matched by transaction id: callers must keep
/// strict request/response alternation per channel, which the channel's
/// single pending slot enforces.
#[derive(Debug)]
pub struct Protocol {
    codec: PacketCodec,
    timeout: Duration,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Protocol {
    pub fn new(timeout: Duration) -> Self {
        Self {
            codec: PacketCodec::new(),
            timeout,
        }
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn send_request(
        &self,
        message_type: MessageType,
        payload: &[u8],
        channel: &dyn Channel,
    ) -> Result<Packet, RequestError> {
        if !channel.is_available() {
            return Err(TransportError::ChannelUnavailable(channel.name()).into());
        }

        // A busy slot must not consume a transaction id.
        let pending = channel.register()?;
        let frame = self.codec.encode(message_type, payload);
        let transaction_id = frame[9];

        debug!(
            channel = channel.name(),
            ?message_type,
            transaction_id,
            raw = %hex(&frame),
            "sending request"
        );
        if let Err(err) = channel.send(&frame).await {
            pending.abandon();
            return Err(err.into());
        }

        let reply = pending.receive(self.timeout).await?;
        let packet = PacketCodec::decode(&reply)?;
        if packet.transaction_id != transaction_id {
            debug!(
                channel = channel.name(),
                expected = transaction_id,
                actual = packet.transaction_id,
                "reply transaction id differs from request"
            );
        }
        debug!(
            channel = channel.name(),
            message_type = packet.message_type,
            len = packet.length,
            "reply received"
        );
        Ok(packet)
    }
}

/// Typed request helpers over [`Protocol::send_request`].
#[derive(Debug, Default)]
pub struct ControlClient {
    protocol: Protocol,
}

impl ControlClient {
    pub fn new(protocol: Protocol) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub async fn discover(&self, channel: &dyn Channel) -> Result<DiscoveryReply, RequestError> {
        let packet = self
            .protocol
            .send_request(MessageType::DeviceInfo, &[], channel)
            .await?;
        Ok(DiscoveryReply::decode(&packet.payload)?)
    }

    pub async fn alive(&self, channel: &dyn Channel) -> Result<AliveReply, RequestError> {
        let packet = self
            .protocol
            .send_request(MessageType::Alive, &[], channel)
            .await?;
        Ok(AliveReply::decode(&packet.payload)?)
    }

    pub async fn tcp_handoff(
        &self,
        channel: &dyn Channel,
        request: TcpHandoffRequest,
    ) -> Result<TcpHandoffReply, RequestError> {
        let packet = self
            .protocol
            .send_request(MessageType::TcpHandoff, &request.encode(), channel)
            .await?;
        Ok(TcpHandoffReply::decode(&packet.payload)?)
    }

    pub async fn check_password(
        &self,
        channel: &dyn Channel,
        password: &str,
        unicode_escaped: bool,
    ) -> Result<PasswordReply, RequestError> {
        let payload = encode_password(password, unicode_escaped);
        let packet = self
            .protocol
            .send_request(MessageType::PasswordCheck, &payload, channel)
            .await?;
        Ok(PasswordReply::decode(&packet.payload)?)
    }

    pub async fn get_live_scene(
        &self,
        channel: &dyn Channel,
        request: &[u8],
    ) -> Result<LiveSceneReply, RequestError> {
        let packet = self
            .protocol
            .send_request(MessageType::GetLiveScene, request, channel)
            .await?;
        Ok(LiveSceneReply::decode(&packet.payload)?)
    }

    pub async fn set_live_scene(
        &self,
        channel: &dyn Channel,
        scene: &[u8],
    ) -> Result<SetLiveSceneReply, RequestError> {
        let packet = self
            .protocol
            .send_request(MessageType::SetLiveScene, scene, channel)
            .await?;
        Ok(SetLiveSceneReply::decode(&packet.payload)?)
    }

    /// Reads the outlet/dimmer scene.
    pub async fn socket_scene(&self, channel: &dyn Channel) -> Result<SocketScene, RequestError> {
        let reply = self
            .get_live_scene(channel, &socket_scene_get_request())
            .await?;
        Ok(SocketScene::decode(&reply.data)?)
    }

    pub async fn write_outlet(
        &self,
        channel: &dyn Channel,
        command: OutletCommand,
    ) -> Result<SetLiveSceneReply, RequestError> {
        self.set_live_scene(channel, &command.scene_payload()).await
    }
}
