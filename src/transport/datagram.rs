use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use super::{Channel, PendingReply, PendingSlot, TransportError};
use crate::packet::hex;

const CHANNEL: &str = "udp";
const MAX_DATAGRAM: usize = 2048;
/// Pause after an unexpected receive error before reading again.
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// UDP channel bound to the device's discovery port.
///
/// A background reader hands every inbound datagram from the peer to the
/// pending slot; datagrams that arrive with no request waiting are dropped.
#[derive(Debug)]
pub struct DatagramChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    slot: Arc<PendingSlot>,
    open: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl DatagramChannel {
    /// Binds `local` and targets `peer`. Must run inside a tokio runtime.
    pub async fn connect(local: SocketAddr, peer: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        debug!(%peer, local = %socket.local_addr()?, "udp channel connected");

        let socket = Arc::new(socket);
        let slot = PendingSlot::new(CHANNEL);
        let open = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&socket),
            Arc::clone(&slot),
            Arc::clone(&open),
        ));

        Ok(Self {
            socket,
            peer,
            slot,
            open,
            reader: parking_lot::Mutex::new(Some(reader)),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

async fn read_loop(socket: Arc<UdpSocket>, slot: Arc<PendingSlot>, open: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => {
                let datagram = buf[..len].to_vec();
                debug!(len, raw = %hex(&datagram), "udp datagram received");
                if !slot.resolve(datagram) {
                    debug!("udp datagram without pending request dropped");
                }
            }
            Err(_) if !open.load(Ordering::Acquire) => break,
            // ICMP port-unreachable from an earlier send; the request deadline handles it.
            Err(err) if is_peer_unreachable(&err) => {
                debug!(error = %err, "udp peer unreachable");
            }
            Err(err) => {
                warn!(error = %err, "udp receive failed");
                time::sleep(RECV_ERROR_PAUSE).await;
            }
        }
    }
}

fn is_peer_unreachable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

#[async_trait]
impl Channel for DatagramChannel {
    fn name(&self) -> &'static str {
        CHANNEL
    }

    fn is_available(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn register(&self) -> Result<PendingReply, TransportError> {
        self.slot.register()
    }

    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_available() {
            return Err(TransportError::ChannelUnavailable(CHANNEL));
        }
        self.socket
            .send(bytes)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.slot.fail(TransportError::Closed);
        debug!(peer = %self.peer, "udp channel closed");
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn exchanges_one_datagram_per_request() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();
        let channel = DatagramChannel::connect("127.0.0.1:0".parse().unwrap(), device_addr)
            .await
            .unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..len].to_vec();
            reply.reverse();
            device.send_to(&reply, from).await.unwrap();
        });

        let pending = channel.register().unwrap();
        channel.send(&[1, 2, 3]).await.unwrap();
        let reply = pending.receive(Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel =
            DatagramChannel::connect("127.0.0.1:0".parse().unwrap(), device.local_addr().unwrap())
                .await
                .unwrap();
        let pending = channel.register().unwrap();
        channel.send(&[0]).await.unwrap();
        let err = pending.receive(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout { channel: "udp", .. }));
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let channel =
            DatagramChannel::connect("127.0.0.1:0".parse().unwrap(), device.local_addr().unwrap())
                .await
                .unwrap();
        channel.close().await;
        assert!(!channel.is_available());
        assert_eq!(
            channel.send(&[0]).await.unwrap_err(),
            TransportError::ChannelUnavailable("udp")
        );
    }

    #[test]
    fn icmp_errors_count_as_unreachable() {
        assert!(is_peer_unreachable(&io::ErrorKind::ConnectionRefused.into()));
        assert!(is_peer_unreachable(&io::ErrorKind::ConnectionReset.into()));
        assert!(!is_peer_unreachable(&io::ErrorKind::PermissionDenied.into()));
    }

    #[tokio::test]
    async fn reader_survives_unreachable_peer() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();
        drop(device);
        let channel = DatagramChannel::connect("127.0.0.1:0".parse().unwrap(), device_addr)
            .await
            .unwrap();

        // Nobody listens yet; the refusal lands on the reader.
        let pending = channel.register().unwrap();
        channel.send(&[0]).await.unwrap();
        assert!(pending.receive(Duration::from_millis(100)).await.is_err());

        let device = UdpSocket::bind(device_addr).await.unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (len, from) = device.recv_from(&mut buf).await.unwrap();
            device.send_to(&buf[..len], from).await.unwrap();
        });
        let pending = channel.register().unwrap();
        channel.send(&[9]).await.unwrap();
        assert_eq!(pending.receive(Duration::from_secs(2)).await.unwrap(), vec![9]);
    }
}
