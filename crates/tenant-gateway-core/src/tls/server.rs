//! TLS acceptor for the secure device listener.
//!
//! The gateway is the TLS server. Client certificates are optional unless the
//! listener demands them; a presented certificate names the device's tenant.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;
use tracing::{debug, warn};

use crate::config::TlsListenerConfig;
use crate::error::{TlsError, TlsResult};

/// Install the ring crypto provider if not already installed.
fn ensure_crypto_provider() {
    let _ = CryptoProvider::install_default(default_provider());
}

/// Wraps accepted device sockets in server-side TLS.
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: TokioTlsAcceptor,
}

impl std::fmt::Debug for TlsServerAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerAcceptor").finish_non_exhaustive()
    }
}

impl TlsServerAcceptor {
    /// Create an acceptor from the secure listener configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The server certificate or key cannot be loaded
    /// - Client certificates are required but no CA is configured
    /// - The CA file holds no usable certificate
    pub fn new(config: &TlsListenerConfig) -> TlsResult<Self> {
        ensure_crypto_provider();
        let server_config = build_server_config(config)?;
        Ok(Self {
            inner: TokioTlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Run the server handshake on `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    pub async fn accept(&self, stream: TcpStream) -> TlsResult<TlsStream<TcpStream>> {
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

fn build_server_config(config: &TlsListenerConfig) -> TlsResult<ServerConfig> {
    let certs = load_certificates(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;
    let builder = ServerConfig::builder();

    let builder = match (&config.ca_cert_path, config.require_client_cert) {
        (None, true) => {
            return Err(TlsError::Config(
                "CA certificate path required when require_client_cert is true".to_string(),
            ));
        }
        (Some(ca_path), required) => {
            debug!(ca_path = %ca_path.display(), required, "verifying device certificates");
            builder.with_client_cert_verifier(client_verifier(ca_path, required)?)
        }
        (None, false) => {
            // Tenancy then always comes from payload content.
            debug!("device certificates not requested");
            builder.with_no_client_auth()
        }
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))
}

/// Verifier for device certificates signed by the CA at `ca_path`.
/// Unless `required`, devices may connect without one.
fn client_verifier(ca_path: &Path, required: bool) -> TlsResult<Arc<dyn ClientCertVerifier>> {
    let mut root_store = RootCertStore::empty();
    let (added, _ignored) = root_store.add_parsable_certificates(load_certificates(ca_path)?);
    if added == 0 {
        return Err(TlsError::NoCertificates(ca_path.display().to_string()));
    }

    let builder = WebPkiClientVerifier::builder(Arc::new(root_store));
    let builder = if required {
        builder
    } else {
        builder.allow_unauthenticated()
    };
    builder
        .build()
        .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))
}

/// Load certificates from a PEM file.
fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.display().to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "loaded certificates");
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file.
fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| TlsError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyLoad {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::NoPrivateKeys(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{TEST_CERT, TEST_KEY};
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    fn listener_config(
        cert: &NamedTempFile,
        key: &NamedTempFile,
        ca: Option<&NamedTempFile>,
        require_client_cert: bool,
    ) -> TlsListenerConfig {
        TlsListenerConfig {
            address: "127.0.0.1:0".to_string(),
            cert_path: cert.path().to_path_buf(),
            key_path: key.path().to_path_buf(),
            ca_cert_path: ca.map(|f| f.path().to_path_buf()),
            require_client_cert,
        }
    }

    #[test]
    fn test_load_server_certificates() {
        let cert_file = pem_file(TEST_CERT);
        let certs = load_certificates(cert_file.path()).unwrap();
        assert_eq!(certs.len(), 1);
    }

    #[test]
    fn test_load_server_private_key() {
        let key_file = pem_file(TEST_KEY);
        assert!(matches!(
            load_private_key(key_file.path()),
            Ok(PrivateKeyDer::Pkcs8(_))
        ));
    }

    #[test]
    fn test_key_file_without_key() {
        let cert_file = pem_file(TEST_CERT);
        assert!(matches!(
            load_private_key(cert_file.path()),
            Err(TlsError::NoPrivateKeys(_))
        ));
    }

    #[test]
    fn test_acceptor_without_client_auth() {
        let cert = pem_file(TEST_CERT);
        let key = pem_file(TEST_KEY);
        let acceptor = TlsServerAcceptor::new(&listener_config(&cert, &key, None, false));
        assert!(acceptor.is_ok(), "Expected Ok, got: {:?}", acceptor.err());
    }

    #[test]
    fn test_acceptor_with_optional_client_auth() {
        let cert = pem_file(TEST_CERT);
        let key = pem_file(TEST_KEY);
        let acceptor = TlsServerAcceptor::new(&listener_config(&cert, &key, Some(&cert), false));
        assert!(acceptor.is_ok(), "Expected Ok, got: {:?}", acceptor.err());
    }

    #[test]
    fn test_acceptor_with_required_client_auth() {
        let cert = pem_file(TEST_CERT);
        let key = pem_file(TEST_KEY);
        let acceptor = TlsServerAcceptor::new(&listener_config(&cert, &key, Some(&cert), true));
        assert!(acceptor.is_ok(), "Expected Ok, got: {:?}", acceptor.err());
    }

    #[test]
    fn test_acceptor_missing_ca_for_mtls() {
        let cert = pem_file(TEST_CERT);
        let key = pem_file(TEST_KEY);
        let acceptor = TlsServerAcceptor::new(&listener_config(&cert, &key, None, true));
        assert!(matches!(acceptor, Err(TlsError::Config(_))));
    }

    #[test]
    fn test_acceptor_missing_cert() {
        let key = pem_file(TEST_KEY);
        let mut config = listener_config(&key, &key, None, false);
        config.cert_path = PathBuf::from("/nonexistent/cert.pem");
        assert!(matches!(
            TlsServerAcceptor::new(&config),
            Err(TlsError::CertificateLoad { .. })
        ));
    }

    #[test]
    fn test_acceptor_missing_key() {
        let cert = pem_file(TEST_CERT);
        let mut config = listener_config(&cert, &cert, None, false);
        config.key_path = PathBuf::from("/nonexistent/key.pem");
        assert!(matches!(
            TlsServerAcceptor::new(&config),
            Err(TlsError::PrivateKeyLoad { .. })
        ));
    }
}
