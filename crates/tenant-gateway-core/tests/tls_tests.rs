//! Secure listener tests.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use tenant_gateway_core::config::TlsListenerConfig;
use tenant_gateway_core::testing::fixtures::{TEST_CERT, TEST_KEY};
use tenant_gateway_core::testing::TestHarnessBuilder;

const WAIT: Duration = Duration::from_secs(5);

/// The test certificate carries no subject alternative name, so the client
/// skips server verification.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn connector() -> TlsConnector {
    let provider = Arc::new(ring::default_provider());
    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn pem_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

struct PemFiles {
    cert: NamedTempFile,
    key: NamedTempFile,
}

impl PemFiles {
    fn new() -> Self {
        Self {
            cert: pem_file(TEST_CERT),
            key: pem_file(TEST_KEY),
        }
    }

    fn listener(&self, require_client_cert: bool) -> TlsListenerConfig {
        TlsListenerConfig {
            address: "127.0.0.1:0".into(),
            cert_path: self.cert.path().to_path_buf(),
            key_path: self.key.path().to_path_buf(),
            ca_cert_path: require_client_cert.then(|| self.cert.path().to_path_buf()),
            require_client_cert,
        }
    }
}

#[tokio::test]
async fn test_tls_device_without_certificate_self_identifies() {
    let pem = PemFiles::new();
    let harness = TestHarnessBuilder::new()
        .device("T1", "dev42", "hub.example.net", "sig")
        .tls(pem.listener(false))
        .build()
        .await;

    let tcp = harness.connect().await.unwrap();
    let mut device = connector()
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    device
        .write_all(b"T1~2024-01-01T00:00:00Z~dev42~temp=21\n")
        .await
        .unwrap();
    device.flush().await.unwrap();

    let sent = harness.backend.wait_for_messages(1, WAIT).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].address, "devices/dev42/messages/events");
    assert_eq!(&sent[0].payload[..], b"temp=21");

    let text = harness.metrics.encode().unwrap();
    assert!(text.contains("tenant_gateway_connections_accepted_total{listener=\"tls\"} 1"));
}

#[tokio::test]
async fn test_required_client_certificate_rejects_anonymous_device() {
    let pem = PemFiles::new();
    let harness = TestHarnessBuilder::new()
        .tls(pem.listener(true))
        .build()
        .await;

    let tcp = harness.connect().await.unwrap();
    match connector()
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
    {
        // TLS 1.3 clients finish before the server checks for a certificate;
        // the rejection then shows up on the first read.
        Ok(mut device) => {
            let mut buf = [0u8; 8];
            let read = timeout(WAIT, device.read(&mut buf)).await.unwrap();
            assert!(matches!(read, Ok(0) | Err(_)));
        }
        Err(_) => {}
    }

    assert_eq!(harness.wait_for_connections(0, WAIT).await, 0);
    assert!(harness.backend.sent().is_empty());
}

#[tokio::test]
async fn test_plain_bytes_on_tls_listener_are_dropped() {
    let pem = PemFiles::new();
    let harness = TestHarnessBuilder::new()
        .device("T1", "dev42", "hub.example.net", "sig")
        .tls(pem.listener(false))
        .build()
        .await;

    let mut tcp = harness.connect().await.unwrap();
    tcp.write_all(b"T1~2024-01-01T00:00:00Z~dev42~temp=21\n")
        .await
        .unwrap();

    let mut buf = [0u8; 64];
    // The server answers garbage with an alert or a reset, never with data relay.
    let _ = timeout(WAIT, tcp.read(&mut buf)).await;
    assert_eq!(harness.wait_for_connections(0, WAIT).await, 0);
    assert!(harness.backend.sent().is_empty());
}
