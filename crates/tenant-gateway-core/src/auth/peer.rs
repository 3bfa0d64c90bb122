//! Identity of a TLS peer, taken from its client certificate.
//!
//! The certificate subject selects the tenant; the thumbprint is kept as the
//! tenant's trust information.

use std::fmt;

use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};

use crate::error::{TlsError, TlsResult};

/// Subject and thumbprint of a presented client certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    /// Subject distinguished name, e.g. `CN=tenant-a,O=Example`.
    pub subject: String,
    /// Uppercase hex SHA-256 of the DER certificate.
    pub thumbprint: String,
}

impl PeerIdentity {
    /// Build from a single DER certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::PeerCertificate`] if the certificate cannot be parsed.
    pub fn from_certificate(cert: &CertificateDer<'_>) -> TlsResult<Self> {
        let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
            .map_err(|e| TlsError::PeerCertificate(e.to_string()))?;

        Ok(Self {
            subject: parsed.subject().to_string(),
            thumbprint: thumbprint(cert.as_ref()),
        })
    }

    /// Build from a presented chain; the first certificate is the peer's.
    ///
    /// Returns `Ok(None)` for an empty chain.
    ///
    /// # Errors
    ///
    /// Returns [`TlsError::PeerCertificate`] if the leaf cannot be parsed.
    pub fn from_chain(chain: &[CertificateDer<'_>]) -> TlsResult<Option<Self>> {
        chain.first().map(Self::from_certificate).transpose()
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.subject, self.thumbprint)
    }
}

fn thumbprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}
