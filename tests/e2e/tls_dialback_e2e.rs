use std::error::Error;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use openssl::ssl::{Ssl, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_openssl::SslStream;

use oase::device::OutletSlot;
use oase::packet::MessageType;
use oase::transport::tls::LEGACY_CIPHERS;
use oase::{EngineConfig, OaseClient, SessionState};

#[path = "../common/mod.rs"]
mod common;
use common::{init_tracing, serve_stream, serve_udp, DeviceModel};

const WAIT: Duration = Duration::from_secs(10);

/// Dials the engine's listener the way the device firmware does.
async fn dial_back(port: u16) -> Result<SslStream<TcpStream>, Box<dyn Error + Send + Sync>> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_cipher_list(LEGACY_CIPHERS)?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_verify(SslVerifyMode::NONE);
    let connector = builder.build();

    let tcp = TcpStream::connect(("127.0.0.1", port)).await?;
    let ssl: Ssl = connector.configure()?.verify_hostname(false).into_ssl("localhost")?;
    let mut stream = SslStream::new(ssl, tcp)?;
    Pin::new(&mut stream).connect().await?;
    Ok(stream)
}

#[tokio::test]
async fn device_dials_back_over_legacy_tls() -> Result<(), Box<dyn Error + Send + Sync>> {
    init_tracing();
    let model = DeviceModel::new("FM-Master EGC-v3", "pond");
    let device = UdpSocket::bind("127.0.0.1:0").await?;
    let device_addr: SocketAddr = device.local_addr()?;
    let (handoff_tx, mut handoff_rx) = mpsc::unbounded_channel();
    tokio::spawn(serve_udp(device, Arc::clone(&model), handoff_tx));

    let config = EngineConfig {
        device_ip: "127.0.0.1".into(),
        device_port: device_addr.port(),
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        password: "pond".into(),
        poll_interval_secs: 10,
        ..EngineConfig::default()
    };
    let client = OaseClient::start(config).await?;
    let mut states = client.device_state();

    let port = timeout(WAIT, handoff_rx.recv()).await?.ok_or("no handoff")?;
    assert_eq!(port, client.listener_addr().port());
    let stream = dial_back(port).await?;
    tokio::spawn(serve_stream(stream, Arc::clone(&model)));

    timeout(WAIT, states.wait_for(|s| s.connected && s.outlets[0])).await??;
    assert_eq!(client.state(), SessionState::Active);
    assert_eq!(
        client.identity().map(|id| id.serial),
        Some("SN0123456789".to_string())
    );

    client.write_outlet(0x02, 0xFF).await?;
    timeout(WAIT, states.wait_for(|s| s.outlets[2])).await??;
    assert!(client.write_outlet(0x07, 1).await.is_err());

    client.switch(OutletSlot::Outlet1, false).await?;
    timeout(WAIT, states.wait_for(|s| !s.outlets[0])).await??;
    assert_eq!(model.received(MessageType::SetLiveScene), 2);

    client.close().await;
    Ok(())
}
