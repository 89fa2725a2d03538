use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use super::{Channel, PendingReply, PendingSlot, TransportError};
use crate::packet::{hex, PacketFramer};

const CHANNEL: &str = "tls";

/// Idle ceiling for the device connection. Also the TCP keepalive time on accepted sockets.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Watches the secure link.
///
/// The value is the generation of the attached stream, or `None` while no
/// device connection is attached. A re-dial shows up as a new generation even
/// when the old stream was never seen to drop.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    rx: watch::Receiver<Option<u64>>,
}

impl LinkMonitor {
    pub fn is_up(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn current(&self) -> Option<u64> {
        *self.rx.borrow()
    }

    /// Resolves with the stream generation once the link is up.
    pub async fn wait_up(&mut self) -> Result<u64, TransportError> {
        let generation = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(generation.unwrap_or_default())
    }

    /// Resolves once the link goes down.
    pub async fn wait_down(&mut self) -> Result<(), TransportError> {
        self.rx
            .wait_for(Option::is_none)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    /// Resolves with the link value as soon as it differs from `known`.
    pub async fn wait_change(
        &mut self,
        known: Option<u64>,
    ) -> Result<Option<u64>, TransportError> {
        let current = self
            .rx
            .wait_for(|current| *current != known)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(*current)
    }
}

/// The device's dial-back connection.
///
/// The channel starts empty. A listener (normally [`SecureListener`](super::SecureListener))
/// attaches each accepted stream and publishes its generation through
/// [`LinkMonitor`]. Peer resets, idle expiry and decode
/// failures detach the stream, fail any pending request and lower the link.
pub struct StreamChannel {
    writer: Mutex<Option<BoxedWriter>>,
    slot: Arc<PendingSlot>,
    connected: AtomicBool,
    link: watch::Sender<Option<u64>>,
    generation: AtomicU64,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    idle_timeout: Duration,
}

impl std::fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamChannel")
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("pending", &self.slot.is_pending())
            .finish()
    }
}

impl StreamChannel {
    pub fn new() -> Arc<Self> {
        Self::with_idle_timeout(IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Arc<Self> {
        let (link, _) = watch::channel(None);
        Arc::new(Self {
            writer: Mutex::new(None),
            slot: PendingSlot::new(CHANNEL),
            connected: AtomicBool::new(false),
            link,
            generation: AtomicU64::new(0),
            reader: parking_lot::Mutex::new(None),
            idle_timeout,
        })
    }

    pub fn monitor(&self) -> LinkMonitor {
        LinkMonitor {
            rx: self.link.subscribe(),
        }
    }

    /// Adopts a freshly established connection, replacing any previous one.
    pub async fn attach<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (read_half, write_half) = tokio::io::split(stream);

        if let Some(previous) = self.reader.lock().take() {
            previous.abort();
        }
        self.slot.fail(TransportError::Closed);
        *self.writer.lock().await = Some(Box::new(write_half));
        self.connected.store(true, Ordering::Release);

        let channel = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let reason = channel.read_frames(read_half).await;
            channel.detach(generation, reason).await;
        });
        *self.reader.lock() = Some(reader);

        self.link.send_replace(Some(generation));
        info!(generation, "secure channel attached");
    }

    async fn read_frames<R>(&self, read_half: R) -> String
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut frames = FramedRead::new(read_half, PacketFramer);
        loop {
            match time::timeout(self.idle_timeout, frames.next()).await {
                Ok(Some(Ok(frame))) => {
                    debug!(len = frame.len(), raw = %hex(&frame), "tls frame received");
                    if !self.slot.resolve(frame) {
                        debug!("tls frame without pending request dropped");
                    }
                }
                Ok(Some(Err(err))) => return format!("read error: {}", err),
                Ok(None) => return "connection ended".into(),
                Err(_) => return format!("idle for {:?}", self.idle_timeout),
            }
        }
    }

    async fn detach(&self, generation: u64, reason: String) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        warn!(%reason, "secure channel detached");
        self.connected.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.slot.fail(TransportError::Closed);
        self.link.send_replace(None);
    }
}

#[async_trait]
impl Channel for StreamChannel {
    fn name(&self) -> &'static str {
        CHANNEL
    }

    fn is_available(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn register(&self) -> Result<PendingReply, TransportError> {
        self.slot.register()
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or(TransportError::ChannelUnavailable(CHANNEL))?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.connected.store(false, Ordering::Release);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.slot.fail(TransportError::Closed);
        self.link.send_replace(None);
        debug!("secure channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MessageType, PacketCodec};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn unattached_channel_is_unavailable() {
        let channel = StreamChannel::new();
        assert!(!channel.is_available());
        assert_eq!(
            channel.send(&[1]).await.unwrap_err(),
            TransportError::ChannelUnavailable("tls")
        );
    }

    #[tokio::test]
    async fn attach_raises_link_and_resolves_frames() {
        let channel = StreamChannel::new();
        let mut monitor = channel.monitor();
        let (local, mut device) = tokio::io::duplex(1024);
        channel.attach(local).await;
        monitor.wait_up().await.unwrap();

        let codec = PacketCodec::new();
        let pending = channel.register().unwrap();
        channel.send(&codec.encode(MessageType::Alive, &[])).await.unwrap();

        let mut header = [0u8; 16];
        device.read_exact(&mut header).await.unwrap();
        let reply = codec.encode(MessageType::Alive, &[7; 33]);
        // Split the reply across two writes; the framer joins them.
        device.write_all(&reply[..20]).await.unwrap();
        device.write_all(&reply[20..]).await.unwrap();

        let frame = pending.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame, reply);
    }

    #[tokio::test]
    async fn peer_close_fails_pending_and_lowers_link() {
        let channel = StreamChannel::new();
        let mut monitor = channel.monitor();
        let (local, device) = tokio::io::duplex(1024);
        channel.attach(local).await;
        monitor.wait_up().await.unwrap();

        let pending = channel.register().unwrap();
        drop(device);

        assert_eq!(
            pending.receive(Duration::from_secs(1)).await.unwrap_err(),
            TransportError::Closed
        );
        monitor.wait_down().await.unwrap();
        assert!(!channel.is_available());
    }

    #[tokio::test]
    async fn reattach_publishes_new_generation() {
        let channel = StreamChannel::new();
        let mut monitor = channel.monitor();
        let (first, _first_device) = tokio::io::duplex(1024);
        channel.attach(first).await;
        let generation = monitor.wait_up().await.unwrap();

        let (second, _second_device) = tokio::io::duplex(1024);
        channel.attach(second).await;
        let next = monitor.wait_change(Some(generation)).await.unwrap();
        assert_eq!(next, Some(generation + 1));
        assert!(channel.is_available());

        channel.close().await;
        assert_eq!(monitor.wait_change(next).await.unwrap(), None);
    }
}
