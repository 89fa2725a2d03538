//! Transport channels carrying OASE frames.
//!
//! Two channels share one contract: the [`DatagramChannel`] for one-shot UDP
//! exchanges with the device's discovery port, and the [`StreamChannel`] for the
//! TLS connection the device opens back to us after a TCP handoff.
//!
//! Each channel owns exactly one [`PendingSlot`]. A request registers the slot
//! before writing, and the next inbound frame resolves it. A second registration
//! while the slot is occupied is refused with [`TransportError::Busy`].
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time;

pub mod datagram;
pub mod stream;
pub mod tls;

pub use datagram::DatagramChannel;
pub use stream::{LinkMonitor, StreamChannel};
pub use tls::{CertificateProvider, SecureListener, SelfSignedCertificate};

/// Failures raised by a transport channel.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{channel} response timeout after {timeout:?}")]
    Timeout {
        channel: &'static str,
        timeout: Duration,
    },
    #[error("{0} channel unavailable")]
    ChannelUnavailable(&'static str),
    #[error("{0} channel already has a request in flight")]
    Busy(&'static str),
    #[error("send failed: {0}")]
    Send(String),
    #[error("channel closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("certificate error: {0}")]
    Certificate(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Byte transport shared by the datagram and stream channels.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Whether a request could be written right now.
    fn is_available(&self) -> bool;

    /// Claims the channel's single pending slot for the next inbound frame.
    fn register(&self) -> Result<PendingReply, TransportError>;

    /// Writes one complete frame.
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Tears the channel down and fails any pending request with `Closed`.
    async fn close(&self);
}

type Resolver = oneshot::Sender<Result<Vec<u8>, TransportError>>;

#[derive(Debug)]
struct PendingRequest {
    generation: u64,
    resolver: Resolver,
}

/// At most one outstanding request per channel.
#[derive(Debug)]
pub struct PendingSlot {
    channel: &'static str,
    slot: parking_lot::Mutex<Option<PendingRequest>>,
    generation: AtomicU64,
}

impl PendingSlot {
    pub fn new(channel: &'static str) -> Arc<Self> {
        Arc::new(Self {
            channel,
            slot: parking_lot::Mutex::new(None),
            generation: AtomicU64::new(0),
        })
    }

    /// Occupies the slot; fails with `Busy` and leaves the current occupant untouched.
    pub fn register(self: &Arc<Self>) -> Result<PendingReply, TransportError> {
        let mut slot = self.slot.lock();
        if let Some(existing) = slot.as_ref() {
            if !existing.resolver.is_closed() {
                return Err(TransportError::Busy(self.channel));
            }
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (resolver, receiver) = oneshot::channel();
        *slot = Some(PendingRequest {
            generation,
            resolver,
        });
        Ok(PendingReply {
            slot: Arc::clone(self),
            generation,
            receiver,
        })
    }

    /// Hands an inbound frame to the waiting request. Returns `false` if nobody waits.
    pub fn resolve(&self, bytes: Vec<u8>) -> bool {
        match self.slot.lock().take() {
            Some(pending) => pending.resolver.send(Ok(bytes)).is_ok(),
            None => false,
        }
    }

    /// Fails the waiting request, if any.
    pub fn fail(&self, err: TransportError) {
        if let Some(pending) = self.slot.lock().take() {
            let _ = pending.resolver.send(Err(err));
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .as_ref()
            .map_or(false, |pending| !pending.resolver.is_closed())
    }

    fn clear(&self, generation: u64) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|p| p.generation) == Some(generation) {
            *slot = None;
        }
    }
}

/// Handle on an occupied [`PendingSlot`].
#[derive(Debug)]
pub struct PendingReply {
    slot: Arc<PendingSlot>,
    generation: u64,
    receiver: oneshot::Receiver<Result<Vec<u8>, TransportError>>,
}

impl PendingReply {
    /// Waits for the next inbound frame. On expiry the slot is cleared.
    pub async fn receive(mut self, deadline: Duration) -> Result<Vec<u8>, TransportError> {
        let result = match time::timeout(deadline, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                channel: self.slot.channel,
                timeout: deadline,
            }),
        };
        self.slot.clear(self.generation);
        result
    }

    /// Releases the slot without waiting, e.g. after a failed write.
    pub fn abandon(self) {
        self.slot.clear(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_registration_is_refused_without_disturbing_first() {
        let slot = PendingSlot::new("test");
        let first = slot.register().unwrap();
        assert_eq!(slot.register().unwrap_err(), TransportError::Busy("test"));

        assert!(slot.resolve(vec![1, 2, 3]));
        assert_eq!(first.receive(Duration::from_secs(1)).await.unwrap(), vec![1, 2, 3]);
        assert!(!slot.is_pending());
    }

    #[tokio::test]
    async fn timeout_clears_slot() {
        let slot = PendingSlot::new("test");
        let reply = slot.register().unwrap();
        let err = reply.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
        assert!(!slot.is_pending());
        assert!(!slot.resolve(vec![9]));
        assert!(slot.register().is_ok());
    }

    #[tokio::test]
    async fn fail_surfaces_to_waiter() {
        let slot = PendingSlot::new("test");
        let reply = slot.register().unwrap();
        slot.fail(TransportError::Closed);
        assert_eq!(
            reply.receive(Duration::from_secs(1)).await.unwrap_err(),
            TransportError::Closed
        );
    }

    #[test]
    fn abandoned_reply_frees_slot() {
        let slot = PendingSlot::new("test");
        let reply = slot.register().unwrap();
        reply.abandon();
        assert!(slot.register().is_ok());
    }

    #[test]
    fn dropped_reply_does_not_block_next_request() {
        let slot = PendingSlot::new("test");
        drop(slot.register().unwrap());
        assert!(slot.register().is_ok());
    }
}
