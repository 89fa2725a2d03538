//! Scripted FM-Master used by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::FramedRead;

use oase::messages::DISCOVERY_REPLY_LEN;
use oase::packet::{MessageType, Packet, PacketCodec, PacketFramer, HEADER_LEN, MAGIC, PROTOCOL_VERSION};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Reply frame echoing the request's transaction id.
pub fn reply_frame(request: &Packet, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.push(PROTOCOL_VERSION);
    buf.push(request.transaction_id);
    buf.extend_from_slice(&request.message_type.to_le_bytes());
    buf.extend_from_slice(&[0u8; 4]);
    buf.extend_from_slice(payload);
    buf
}

pub fn discovery_payload(long_name: &str) -> Vec<u8> {
    let mut data = vec![0u8; DISCOVERY_REPLY_LEN];
    data[2..10].copy_from_slice(b"Pond Box");
    data[34..46].copy_from_slice(b"SN0123456789");
    data[66..66 + long_name.len()].copy_from_slice(long_name.as_bytes());
    data
}

/// Device-side state shared between the UDP and stream responders.
pub struct DeviceModel {
    pub long_name: String,
    pub password: String,
    /// Four outlet bytes and the dimmer.
    pub scene: Mutex<[u8; 5]>,
    pub scene_delay: Mutex<Duration>,
    /// Stops answering scene reads when set.
    pub silent: Mutex<bool>,
    /// Stops answering alive requests when set.
    pub mute_alive: Mutex<bool>,
    pub received: Mutex<Vec<u16>>,
    pub scene_requested: Notify,
}

impl DeviceModel {
    pub fn new(long_name: &str, password: &str) -> Arc<Self> {
        Arc::new(Self {
            long_name: long_name.to_string(),
            password: password.to_string(),
            scene: Mutex::new([0xFF, 0x00, 0x00, 0x00, 0x40]),
            scene_delay: Mutex::new(Duration::ZERO),
            silent: Mutex::new(false),
            mute_alive: Mutex::new(false),
            received: Mutex::new(Vec::new()),
            scene_requested: Notify::new(),
        })
    }

    pub fn received(&self, message_type: MessageType) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|code| **code == message_type.code())
            .count()
    }
}

/// Answers discovery and handoff. Each accepted handoff reports its port on `handoffs`.
pub async fn serve_udp(socket: UdpSocket, model: Arc<DeviceModel>, handoffs: mpsc::UnboundedSender<u16>) {
    let mut buf = [0u8; 2048];
    loop {
        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let Ok(request) = PacketCodec::decode(&buf[..len]) else {
            continue;
        };
        model.received.lock().push(request.message_type);
        let payload = match request.kind() {
            Some(MessageType::DeviceInfo) => discovery_payload(&model.long_name),
            Some(MessageType::TcpHandoff) => {
                let port = u16::from_le_bytes([request.payload[1], request.payload[2]]);
                let _ = handoffs.send(port);
                vec![1, 1]
            }
            _ => continue,
        };
        let _ = socket.send_to(&reply_frame(&request, &payload), from).await;
    }
}

/// Answers password, scene and alive requests on the dial-back stream.
pub async fn serve_stream<S>(stream: S, model: Arc<DeviceModel>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read_half, PacketFramer);
    while let Some(Ok(frame)) = frames.next().await {
        let Ok(request) = PacketCodec::decode(&frame) else {
            continue;
        };
        model.received.lock().push(request.message_type);
        let payload = match request.kind() {
            Some(MessageType::PasswordCheck) => {
                let end = request.payload.iter().position(|b| *b == 0).unwrap_or(64);
                let ok = &request.payload[..end] == model.password.as_bytes();
                vec![u8::from(ok)]
            }
            Some(MessageType::GetLiveScene) => {
                model.scene_requested.notify_one();
                if *model.silent.lock() {
                    continue;
                }
                let delay = *model.scene_delay.lock();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let mut payload = vec![100, 4, 0, 0, 0, 1, 0, 0, 0, 2, 5];
                payload.extend_from_slice(&*model.scene.lock());
                payload
            }
            Some(MessageType::SetLiveScene) => {
                let item = request.payload[11] as usize;
                model.scene.lock()[item] = request.payload[12];
                vec![1]
            }
            Some(MessageType::Alive) => {
                if *model.mute_alive.lock() {
                    continue;
                }
                let mut payload = b"SN0123456789".to_vec();
                payload.resize(33, 0);
                payload
            }
            _ => continue,
        };
        if write_half.write_all(&reply_frame(&request, &payload)).await.is_err() {
            return;
        }
    }
}
