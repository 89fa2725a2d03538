//! Legacy TLS listener for the device's dial-back connection.
//!
//! The FM-Master firmware only speaks TLS 1.2 with old RSA-kex/CBC cipher
//! suites and never verifies our certificate. The settings below weaken
//! transport security compared to modern defaults and exist solely so the
//! device can complete its handshake. Do not reuse them for anything else.
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::ssl::{Ssl, SslAcceptor, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::{X509NameBuilder, X509};
use sha2::{Digest, Sha256};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

use super::stream::IDLE_TIMEOUT;
use super::{StreamChannel, TransportError};

/// Cipher suites the device firmware negotiates. Legacy by necessity.
pub const LEGACY_CIPHERS: &str =
    "AES128-SHA:DES-CBC3-SHA:RC4-SHA:RC4-MD5:AES256-SHA:AES128-SHA256:AES256-SHA256";
/// Time the device gets to finish its TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Common name the vendor app presents.
pub const DEFAULT_COMMON_NAME: &str = "com.oase.easycontrol";

/// Key pair and certificate presented to the device.
pub struct ServerIdentity {
    pub key: PKey<Private>,
    pub cert: X509,
}

impl ServerIdentity {
    /// SHA-256 of the DER certificate, lowercase hex.
    pub fn fingerprint(&self) -> Result<String, TransportError> {
        let der = self
            .cert
            .to_der()
            .map_err(|e| TransportError::Certificate(e.to_string()))?;
        let digest = Sha256::digest(&der);
        Ok(digest.iter().map(|byte| format!("{:02x}", byte)).collect())
    }
}

/// Source of the listener's certificate material.
pub trait CertificateProvider: Send + Sync {
    fn identity(&self) -> Result<ServerIdentity, TransportError>;
}

/// Throwaway RSA-2048 self-signed certificate, valid one week either side of now.
#[derive(Debug, Clone)]
pub struct SelfSignedCertificate {
    common_name: String,
}

impl SelfSignedCertificate {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
        }
    }
}

impl Default for SelfSignedCertificate {
    fn default() -> Self {
        Self::new(DEFAULT_COMMON_NAME)
    }
}

impl CertificateProvider for SelfSignedCertificate {
    fn identity(&self) -> Result<ServerIdentity, TransportError> {
        generate_self_signed(&self.common_name)
            .map_err(|e| TransportError::Certificate(e.to_string()))
    }
}

fn generate_self_signed(common_name: &str) -> Result<ServerIdentity, openssl::error::ErrorStack> {
    let key = PKey::from_rsa(Rsa::generate(2048)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut cert = X509::builder()?;
    cert.set_version(2)?;
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    cert.set_serial_number(&serial)?;
    cert.set_subject_name(&name)?;
    cert.set_issuer_name(&name)?;
    cert.set_pubkey(&key)?;
    let not_before = Asn1Time::from_unix(unix_now() - 7 * 24 * 60 * 60)?;
    cert.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(7)?;
    cert.set_not_after(&not_after)?;
    cert.sign(&key, MessageDigest::sha256())?;

    Ok(ServerIdentity {
        key,
        cert: cert.build(),
    })
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Acceptor restricted to what the device supports: legacy suites, TLS 1.2 at
/// most, no client certificate.
pub fn legacy_acceptor(identity: &ServerIdentity) -> Result<SslAcceptor, TransportError> {
    let build = || -> Result<SslAcceptor, openssl::error::ErrorStack> {
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls_server())?;
        // Weakened on purpose: the device cannot negotiate TLS 1.3 or AEAD suites.
        builder.set_cipher_list(LEGACY_CIPHERS)?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_verify(SslVerifyMode::NONE);
        builder.set_private_key(&identity.key)?;
        builder.set_certificate(&identity.cert)?;
        builder.check_private_key()?;
        Ok(builder.build())
    };
    build().map_err(|e| TransportError::Tls(e.to_string()))
}

/// TCP listener the device dials back into after a handoff.
///
/// Each accepted connection goes through the TLS handshake and is then
/// attached to the shared [`StreamChannel`].
pub struct SecureListener {
    listener: TcpListener,
    acceptor: Arc<SslAcceptor>,
    channel: Arc<StreamChannel>,
    handshake_timeout: Duration,
}

impl SecureListener {
    pub async fn bind(
        addr: SocketAddr,
        provider: &dyn CertificateProvider,
        channel: Arc<StreamChannel>,
    ) -> Result<Self, TransportError> {
        debug!("generating listener certificate");
        let identity = provider.identity()?;
        info!(fingerprint = %identity.fingerprint()?, "listener certificate ready");
        let acceptor = legacy_acceptor(&identity)?;

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                warn!(%addr, "address and port already in use");
            }
            TransportError::from(e)
        })?;
        debug!(addr = %listener.local_addr()?, "tls listener bound");

        Ok(Self {
            listener,
            acceptor: Arc::new(acceptor),
            channel,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs the accept loop until the returned handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        loop {
            let (tcp, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!(error = %err, "tls accept failed");
                    continue;
                }
            };
            debug!(%peer, "device connected, starting tls handshake");
            if let Err(err) = enable_keepalive(&tcp) {
                warn!(%peer, error = %err, "tcp keepalive not enabled");
            }
            let acceptor = Arc::clone(&self.acceptor);
            let channel = Arc::clone(&self.channel);
            let handshake_timeout = self.handshake_timeout;
            tokio::spawn(async move {
                match time::timeout(handshake_timeout, handshake(&acceptor, tcp)).await {
                    Ok(Ok(stream)) => {
                        let ssl = stream.ssl();
                        debug!(
                            %peer,
                            protocol = ssl.version_str(),
                            cipher = ssl.current_cipher().map(|c| c.name()).unwrap_or("?"),
                            "tls handshake completed"
                        );
                        channel.attach(stream).await;
                    }
                    Ok(Err(err)) => warn!(%peer, error = %err, "tls client error"),
                    Err(_) => warn!(%peer, "tls handshake timed out"),
                }
            });
        }
    }
}

/// TCP keepalive probing after the same idle period as the read timeout.
fn enable_keepalive(tcp: &TcpStream) -> Result<(), TransportError> {
    let keepalive = TcpKeepalive::new().with_time(IDLE_TIMEOUT);
    SockRef::from(tcp).set_tcp_keepalive(&keepalive)?;
    Ok(())
}

async fn handshake(
    acceptor: &SslAcceptor,
    tcp: TcpStream,
) -> Result<SslStream<TcpStream>, TransportError> {
    let ssl = Ssl::new(acceptor.context()).map_err(|e| TransportError::Tls(e.to_string()))?;
    let mut stream = SslStream::new(ssl, tcp).map_err(|e| TransportError::Tls(e.to_string()))?;
    Pin::new(&mut stream)
        .accept()
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_identity_is_usable() {
        let identity = SelfSignedCertificate::default().identity().unwrap();
        let fingerprint = identity.fingerprint().unwrap();
        assert_eq!(fingerprint.len(), 64);
        let cn = identity
            .cert
            .subject_name()
            .entries()
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string());
        assert_eq!(cn.as_deref(), Some(DEFAULT_COMMON_NAME));
        assert!(legacy_acceptor(&identity).is_ok());
    }

    #[tokio::test]
    async fn accepted_sockets_get_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (tcp, _) = listener.accept().await.unwrap();

        assert!(!SockRef::from(&tcp).keepalive().unwrap());
        enable_keepalive(&tcp).unwrap();
        assert!(SockRef::from(&tcp).keepalive().unwrap());
    }
}
