use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{ConfigError, EngineConfig};
use crate::device::{CommandError, DeviceIdentity, DeviceState, OutletCommand, OutletSlot};
use crate::session::{Session, SessionError, SessionEvent, SessionState};
use crate::transport::{
    CertificateProvider, Channel, DatagramChannel, SecureListener, SelfSignedCertificate,
    StreamChannel, TransportError,
};

/// Errors emitted by the high-level SDK client.
///
/// Configuration problems surface before any socket is opened; transport errors
/// come from binding the UDP socket or the TLS listener; session errors come
/// from the lifecycle itself or from a rejected write.
#[derive(Debug)]
#[non_exhaustive]
pub enum ClientError {
    Config(ConfigError),
    Transport(TransportError),
    Session(SessionError),
    Command(CommandError),
    /// The session task panicked or was aborted.
    Io(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Config(err) => write!(f, "config error: {}", err),
            ClientError::Transport(err) => write!(f, "transport error: {}", err),
            ClientError::Session(err) => write!(f, "session error: {}", err),
            ClientError::Command(err) => write!(f, "invalid command: {}", err),
            ClientError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Config(err) => Some(err),
            ClientError::Transport(err) => Some(err),
            ClientError::Session(err) => Some(err),
            ClientError::Command(err) => Some(err),
            ClientError::Io(_) => None,
        }
    }
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        ClientError::Config(err)
    }
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        ClientError::Transport(err)
    }
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        ClientError::Session(err)
    }
}

impl From<CommandError> for ClientError {
    fn from(err: CommandError) -> Self {
        ClientError::Command(err)
    }
}

/// Engine front door for a host: owns the channels, the TLS listener and the
/// session task.
///
/// # Guarantees
/// * The listener is bound before the handoff announces its port.
/// * Outlet state is published on a watch channel; lifecycle events on a broadcast channel.
/// * `close()` cancels the session, closes both channels and stops the listener.
#[derive(Debug)]
pub struct OaseClient {
    session: Arc<Session>,
    listener_addr: SocketAddr,
    device_addr: SocketAddr,
    listener_handle: Option<JoinHandle<()>>,
    session_handle: Option<JoinHandle<Result<(), SessionError>>>,
}

impl OaseClient {
    /// Starts the engine with a freshly generated self-signed certificate.
    ///
    /// # Errors
    /// Returns `ClientError::Config` for an invalid configuration and
    /// `ClientError::Transport` when a socket cannot be bound.
    pub async fn start(config: EngineConfig) -> Result<Self, ClientError> {
        Self::with_certificates(config, &SelfSignedCertificate::default()).await
    }

    pub async fn with_certificates(
        config: EngineConfig,
        provider: &dyn CertificateProvider,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let device_addr = config.device_addr()?;

        let tls = StreamChannel::new();
        let listener = SecureListener::bind(config.listen_addr()?, provider, Arc::clone(&tls)).await?;
        let listener_addr = listener.local_addr()?;
        let udp: Arc<dyn Channel> =
            Arc::new(DatagramChannel::connect(wildcard_for(device_addr), device_addr).await?);
        let secure: Arc<dyn Channel> = tls.clone();

        let session = Arc::new(Session::new(
            config.session_config(listener_addr.port()),
            udp,
            secure,
            tls.monitor(),
        ));
        let listener_handle = listener.spawn();
        let runner = Arc::clone(&session);
        let session_handle = tokio::spawn(async move { runner.run().await });
        info!(device = %device_addr, listener = %listener_addr, "oase engine started");

        Ok(Self {
            session,
            listener_addr,
            device_addr,
            listener_handle: Some(listener_handle),
            session_handle: Some(session_handle),
        })
    }

    pub fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    pub fn device_addr(&self) -> SocketAddr {
        self.device_addr
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.session.snapshot().identity
    }

    pub fn snapshot(&self) -> DeviceState {
        self.session.snapshot()
    }

    pub fn device_state(&self) -> watch::Receiver<DeviceState> {
        self.session.device_state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn set_read_only(&self, slot: OutletSlot, read_only: bool) {
        self.session.set_read_only(slot, read_only);
    }

    /// Validates a raw host write and sends it.
    ///
    /// # Errors
    /// `ClientError::Command` for an unknown item or a value outside 0..=255;
    /// `ClientError::Session` when the write is refused or fails on the wire.
    pub async fn write_outlet(&self, item_id: u8, value: i64) -> Result<(), ClientError> {
        let command = OutletCommand::new(item_id, value)?;
        self.send(command).await
    }

    pub async fn switch(&self, slot: OutletSlot, on: bool) -> Result<(), ClientError> {
        self.send(OutletCommand::switch(slot, on)).await
    }

    pub async fn send(&self, command: OutletCommand) -> Result<(), ClientError> {
        self.session.write_outlet(command).await.map_err(ClientError::from)
    }

    /// Waits for the session to end. `Ok` means it was closed deliberately.
    pub async fn wait(&mut self) -> Result<(), ClientError> {
        match self.session_handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result.map_err(ClientError::from),
                Err(err) => Err(ClientError::Io(err.to_string())),
            },
            None => Ok(()),
        }
    }

    /// Cancels the session and releases every socket.
    pub async fn close(mut self) {
        self.session.close();
        if let Some(handle) = self.session_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for OaseClient {
    fn drop(&mut self) {
        self.session.close();
        if let Some(handle) = self.listener_handle.take() {
            handle.abort();
        }
    }
}

fn wildcard_for(peer: SocketAddr) -> SocketAddr {
    let ip = match peer.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
