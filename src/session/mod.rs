//! Connection lifecycle for one FM-Master device.
//!
//! [`Session::run`] walks the device from discovery through the TLS handoff and
//! password check into steady-state scene polling. Discovery, handoff and
//! handshake failures are retried with [`Backoff`]; an authentication failure
//! or an exhausted poll budget ends the session and the owner must restart it.
//! A lost or replaced secure link drops the session back to `Authenticating`
//! until the device's next connection passes the password check again.
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::control::{ControlClient, Protocol, RequestError, DEFAULT_REQUEST_TIMEOUT};
use crate::device::{
    CommandError, DeviceIdentity, DeviceState, OutletCommand, OutletProtection, OutletSlot,
    SUPPORTED_FAMILY,
};
use crate::messages::TcpHandoffRequest;
use crate::transport::{Channel, LinkMonitor, TransportError};

pub mod backoff;
pub mod state;

pub use backoff::Backoff;
pub use state::{SessionState, SessionStateError};

/// Poll intervals above this risk the device dropping an idle connection.
pub const KEEPALIVE_THRESHOLD: Duration = Duration::from_secs(60);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(50);
pub const DEFAULT_POLL_RETRIES: u32 = 3;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
/// Delay between a successful write and the confirming scene poll.
pub const REFRESH_DELAY: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 32;

/// Alive requests sent alongside slow polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub interval: Duration,
    /// Offset of the first tick so keepalives fall between polls.
    pub first_tick: Duration,
}

impl KeepalivePolicy {
    /// `None` when the poll interval alone keeps the connection warm.
    pub fn for_poll_interval(poll_interval: Duration) -> Option<Self> {
        (poll_interval > KEEPALIVE_THRESHOLD).then(|| Self {
            interval: KEEPALIVE_INTERVAL,
            first_tick: KEEPALIVE_INTERVAL / 2,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub password: String,
    pub password_unicode_escaped: bool,
    /// Port announced in the TCP handoff; the device dials back to it.
    pub handoff_port: u16,
    pub poll_interval: Duration,
    pub keepalive: Option<KeepalivePolicy>,
    pub request_timeout: Duration,
    pub backoff: Backoff,
    pub poll_retries: u32,
    /// `None` waits for the device indefinitely.
    pub handshake_timeout: Option<Duration>,
    pub supported_family: String,
    pub refresh_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let poll_interval = Duration::from_secs(30);
        Self {
            password: String::new(),
            password_unicode_escaped: false,
            handoff_port: 5999,
            poll_interval,
            keepalive: KeepalivePolicy::for_poll_interval(poll_interval),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: Backoff::default(),
            poll_retries: DEFAULT_POLL_RETRIES,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            supported_family: SUPPORTED_FAMILY.to_string(),
            refresh_delay: REFRESH_DELAY,
        }
    }
}

/// Lifecycle notifications for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Discovered(DeviceIdentity),
    /// Authentication succeeded; the session is active.
    Connected,
    Disconnected,
    AuthenticationFailed,
    RetryScheduled {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("unsupported device {0:?}")]
    UnsupportedDevice(String),
    #[error("device rejected the tcp handoff")]
    HandoffRejected,
    #[error("device did not complete the secure handshake within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("scene polling failed {0} times in a row")]
    PollingExhausted(u32),
    #[error(transparent)]
    InvalidCommand(#[from] CommandError),
    #[error("{0} is read only")]
    ReadOnly(OutletSlot),
    #[error("device rejected write to {0}")]
    WriteRejected(OutletSlot),
    #[error("session is not active")]
    NotConnected,
    #[error(transparent)]
    State(#[from] SessionStateError),
    #[error("session cancelled")]
    Cancelled,
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::Request(err.into())
    }
}

impl SessionError {
    /// Failures the discovery loop recovers from by backing off and retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Request(_)
                | SessionError::UnsupportedDevice(_)
                | SessionError::HandoffRejected
                | SessionError::HandshakeTimeout(_)
        )
    }
}

/// One device conversation over a datagram and a stream channel.
pub struct Session {
    config: SessionConfig,
    control: ControlClient,
    udp: Arc<dyn Channel>,
    tls: Arc<dyn Channel>,
    link: LinkMonitor,
    state: parking_lot::Mutex<SessionState>,
    backoff: parking_lot::Mutex<Backoff>,
    protection: parking_lot::Mutex<OutletProtection>,
    device: watch::Sender<DeviceState>,
    events: broadcast::Sender<SessionEvent>,
    /// Held for the duration of every stream request.
    tx_lock: tokio::sync::Mutex<()>,
    refresh: Notify,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.lock())
            .field("udp", &self.udp.name())
            .field("tls", &self.tls.name())
            .finish()
    }
}

impl Session {
    pub fn new(
        config: SessionConfig,
        udp: Arc<dyn Channel>,
        tls: Arc<dyn Channel>,
        link: LinkMonitor,
    ) -> Self {
        let (device, _) = watch::channel(DeviceState::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            control: ControlClient::new(Protocol::new(config.request_timeout)),
            backoff: parking_lot::Mutex::new(config.backoff.clone()),
            config,
            udp,
            tls,
            link,
            state: parking_lot::Mutex::new(SessionState::Idle),
            protection: parking_lot::Mutex::new(OutletProtection::default()),
            device,
            events,
            tx_lock: tokio::sync::Mutex::new(()),
            refresh: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn device_state(&self) -> watch::Receiver<DeviceState> {
        self.device.subscribe()
    }

    pub fn snapshot(&self) -> DeviceState {
        self.device.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn set_read_only(&self, slot: OutletSlot, read_only: bool) {
        self.protection.lock().set(slot, read_only);
        debug!(%slot, read_only, "write protection updated");
    }

    pub fn is_read_only(&self, slot: OutletSlot) -> bool {
        self.protection.lock().is_read_only(slot)
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops [`run`](Self::run), dropping any pending backoff timer or request.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Drives the lifecycle until cancelled or a fatal error.
    ///
    /// Returns `Ok(())` after [`close`](Self::close); every other exit is an error
    /// that requires a fresh session.
    pub async fn run(&self) -> Result<(), SessionError> {
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            result = self.drive() => result,
        };

        self.udp.close().await;
        self.tls.close().await;
        self.mark_disconnected();

        match result {
            Ok(()) | Err(SessionError::Cancelled) => {
                self.force_state(SessionState::Closed);
                info!("session closed");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "session failed");
                self.force_state(SessionState::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    async fn drive(&self) -> Result<(), SessionError> {
        let mut link = self.link.clone();
        self.set_state(SessionState::Discovering)?;

        let generation = loop {
            match self.establish(&mut link).await {
                Ok(generation) => break generation,
                Err(err) if err.is_retryable() => {
                    let (attempt, delay) = {
                        let mut backoff = self.backoff.lock();
                        let attempt = backoff.attempt();
                        (attempt, backoff.next_delay())
                    };
                    warn!(error = %err, attempt, ?delay, "connection attempt failed, retrying");
                    self.emit(SessionEvent::RetryScheduled {
                        attempt,
                        delay,
                        reason: err.to_string(),
                    });
                    time::sleep(delay).await;
                    self.set_state(SessionState::Discovering)?;
                }
                Err(err) => return Err(err),
            }
        };

        self.set_state(SessionState::Authenticating)?;
        self.authenticate().await?;
        self.activate()?;
        self.steady_state(&mut link, generation).await
    }

    /// Discovery, handoff and the wait for the device's dial-back.
    /// Returns the generation of the attached stream.
    async fn establish(&self, link: &mut LinkMonitor) -> Result<u64, SessionError> {
        let reply = self.control.discover(self.udp.as_ref()).await?;
        let identity = DeviceIdentity::from(&reply);
        if !identity.is_supported_by(&self.config.supported_family) {
            return Err(SessionError::UnsupportedDevice(identity.long_name));
        }
        self.backoff.lock().reset();
        info!(
            name = %identity.name,
            serial = %identity.serial,
            long_name = %identity.long_name,
            "device discovered"
        );
        self.device
            .send_modify(|state| state.identity = Some(identity.clone()));
        self.emit(SessionEvent::Discovered(identity));

        self.set_state(SessionState::AwaitingHandoffAck)?;
        let request = TcpHandoffRequest {
            port: self.config.handoff_port,
            timestamp: unix_timestamp(),
        };
        let ack = self.control.tcp_handoff(self.udp.as_ref(), request).await?;
        if !ack.success {
            return Err(SessionError::HandoffRejected);
        }
        debug!(connections = ack.connection_count, "tcp handoff acknowledged");

        self.set_state(SessionState::AwaitingSecureHandshake)?;
        let generation = match self.config.handshake_timeout {
            Some(limit) => time::timeout(limit, link.wait_up())
                .await
                .map_err(|_| SessionError::HandshakeTimeout(limit))??,
            None => link.wait_up().await?,
        };
        info!(generation, "secure channel established");
        Ok(generation)
    }

    /// Password check over the current stream.
    async fn authenticate(&self) -> Result<(), SessionError> {
        let _guard = self.tx_lock.lock().await;
        let reply = self
            .control
            .check_password(
                self.tls.as_ref(),
                &self.config.password,
                self.config.password_unicode_escaped,
            )
            .await?;
        if !reply.success {
            self.emit(SessionEvent::AuthenticationFailed);
            return Err(SessionError::AuthenticationFailed);
        }
        info!("authenticated");
        Ok(())
    }

    fn activate(&self) -> Result<(), SessionError> {
        self.set_state(SessionState::Active)?;
        self.device.send_modify(|state| state.connected = true);
        self.emit(SessionEvent::Connected);
        Ok(())
    }

    /// Leaves `Active` until the next stream passes the password check.
    fn suspend(&self) -> Result<(), SessionError> {
        if self.state().is_active() {
            self.set_state(SessionState::Authenticating)?;
        }
        self.mark_disconnected();
        Ok(())
    }

    async fn steady_state(
        &self,
        link: &mut LinkMonitor,
        generation: u64,
    ) -> Result<(), SessionError> {
        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keepalive = self.config.keepalive.map(|policy| {
            let mut interval =
                time::interval_at(time::Instant::now() + policy.first_tick, policy.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let refresh = time::sleep(Duration::ZERO);
        tokio::pin!(refresh);
        let mut refresh_armed = false;
        let mut retries_left = self.config.poll_retries;
        // Generation of the stream that passed the password check.
        let mut authenticated = Some(generation);

        info!(interval = ?self.config.poll_interval, keepalive = keepalive.is_some(), "polling device");
        loop {
            tokio::select! {
                _ = poll.tick() => match authenticated {
                    Some(_) => self.poll(&mut retries_left).await?,
                    None => {
                        let err = TransportError::ChannelUnavailable(self.tls.name());
                        self.poll_failed(&mut retries_left, &err)?;
                    }
                },
                _ = &mut refresh, if refresh_armed => {
                    refresh_armed = false;
                    if authenticated.is_some() {
                        debug!("polling updated outlet states");
                        self.poll(&mut retries_left).await?;
                    }
                }
                _ = self.refresh.notified() => {
                    refresh.as_mut().reset(time::Instant::now() + self.config.refresh_delay);
                    refresh_armed = true;
                }
                _ = next_tick(&mut keepalive), if authenticated.is_some() => self.keepalive().await,
                current = link.wait_change(authenticated) => match current? {
                    None => {
                        warn!("secure channel lost");
                        authenticated = None;
                        self.suspend()?;
                    }
                    Some(next) => {
                        if authenticated.is_some() {
                            warn!(generation = next, "device re-dialed, secure channel replaced");
                            self.suspend()?;
                        }
                        authenticated = self.reauthenticate(next, &mut retries_left).await?;
                    }
                },
            }
        }
    }

    /// Password check on a re-dialed stream. Transport failures count
    /// against the poll budget; a rejected password ends the session.
    async fn reauthenticate(
        &self,
        generation: u64,
        retries_left: &mut u32,
    ) -> Result<Option<u64>, SessionError> {
        info!(generation, "authenticating re-dialed secure channel");
        match self.authenticate().await {
            Ok(()) => {
                *retries_left = self.config.poll_retries;
                self.activate()?;
                self.poll(retries_left).await?;
                Ok(Some(generation))
            }
            Err(SessionError::AuthenticationFailed) => Err(SessionError::AuthenticationFailed),
            Err(err) => {
                self.poll_failed(retries_left, &err)?;
                Ok(None)
            }
        }
    }

    async fn poll(&self, retries_left: &mut u32) -> Result<(), SessionError> {
        let Ok(_guard) = self.tx_lock.try_lock() else {
            debug!("poll skipped, request in flight");
            return Ok(());
        };
        match self.control.socket_scene(self.tls.as_ref()).await {
            Ok(scene) => {
                *retries_left = self.config.poll_retries;
                self.device.send_if_modified(|state| {
                    let before = (state.outlets, state.dimmer);
                    state.apply_scene(&scene);
                    before != (state.outlets, state.dimmer)
                });
                debug!(outlets = ?scene.outlets, dimmer = scene.dimmer, "outlet states polled");
                Ok(())
            }
            Err(err) => self.poll_failed(retries_left, &err),
        }
    }

    fn poll_failed(
        &self,
        retries_left: &mut u32,
        err: &dyn std::fmt::Display,
    ) -> Result<(), SessionError> {
        *retries_left = retries_left.saturating_sub(1);
        warn!(error = %err, retries_left = *retries_left, "polling of outlet states failed");
        if *retries_left == 0 {
            return Err(SessionError::PollingExhausted(self.config.poll_retries));
        }
        Ok(())
    }

    async fn keepalive(&self) {
        let Ok(_guard) = self.tx_lock.try_lock() else {
            debug!("keepalive skipped, request in flight");
            return;
        };
        match self.control.alive(self.tls.as_ref()).await {
            Ok(reply) => debug!(serial = %reply.serial, "keepalive acknowledged"),
            Err(err) => warn!(error = %err, "keepalive failed"),
        }
    }

    /// Sends one outlet or dimmer write, waiting for any in-flight poll first.
    pub async fn write_outlet(&self, command: OutletCommand) -> Result<(), SessionError> {
        if !self.state().is_active() {
            return Err(SessionError::NotConnected);
        }
        if self.is_read_only(command.slot) {
            info!(slot = %command.slot, "ignoring write to read only outlet");
            return Err(SessionError::ReadOnly(command.slot));
        }

        let _guard = self.tx_lock.lock().await;
        let reply = self
            .control
            .write_outlet(self.tls.as_ref(), command)
            .await?;
        if !reply.success {
            return Err(SessionError::WriteRejected(command.slot));
        }
        debug!(slot = %command.slot, value = command.value, "outlet write acknowledged");
        self.refresh.notify_one();
        Ok(())
    }

    fn set_state(&self, next: SessionState) -> Result<(), SessionError> {
        {
            let mut state = self.state.lock();
            *state = state.transition(next.clone())?;
        }
        info!(state = %next, "session state changed");
        self.emit(SessionEvent::StateChanged(next));
        Ok(())
    }

    fn force_state(&self, next: SessionState) {
        *self.state.lock() = next.clone();
        self.emit(SessionEvent::StateChanged(next));
    }

    fn mark_disconnected(&self) {
        let was_connected = self.device.send_if_modified(|state| {
            let was = state.connected;
            state.connected = false;
            was
        });
        if was_connected {
            self.emit(SessionEvent::Disconnected);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}
