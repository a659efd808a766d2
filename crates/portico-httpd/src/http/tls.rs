//! TLS configuration for the HTTPS constructor.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::sync::Arc;

/// Why the supplied TLS material was unusable.
#[derive(Debug)]
pub enum TlsError {
    /// The certificate PEM contained no certificates.
    NoCertificate,
    /// The key PEM contained no private key.
    NoPrivateKey,
    /// PEM parsing failed.
    InvalidPem(std::io::Error),
    /// rustls rejected the certificate/key pair.
    Rejected(rustls::Error),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCertificate => write!(f, "no certificate found in PEM data"),
            Self::NoPrivateKey => write!(f, "no private key found in PEM data"),
            Self::InvalidPem(e) => write!(f, "invalid PEM data: {e}"),
            Self::Rejected(e) => write!(f, "TLS material rejected: {e}"),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidPem(e) => Some(e),
            Self::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

/// A validated server-side TLS configuration, shared by every accepted
/// connection.
#[derive(Clone)]
pub(crate) struct TlsContext {
    config: Arc<rustls::ServerConfig>,
}

impl TlsContext {
    /// Build from in-memory PEM data (certificate chain and private key).
    pub(crate) fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, TlsError> {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_bytes())
                .collect::<Result<_, _>>()
                .map_err(TlsError::InvalidPem)?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate);
        }

        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .map_err(TlsError::InvalidPem)?
            .ok_or(TlsError::NoPrivateKey)?;

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(TlsError::Rejected)?;

        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub(crate) fn server_config(&self) -> Arc<rustls::ServerConfig> {
        Arc::clone(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_certificate_pem_is_rejected() {
        let result = TlsContext::from_pem("not a certificate", "not a key");
        assert!(matches!(result, Err(TlsError::NoCertificate)));
    }

    #[test]
    fn missing_key_is_rejected() {
        // A syntactically valid but empty-of-keys PEM block.
        let cert_pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let result = TlsContext::from_pem(cert_pem, "");
        assert!(matches!(result, Err(TlsError::NoPrivateKey)));
    }
}
