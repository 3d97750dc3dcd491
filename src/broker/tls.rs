//! TLS acceptor setup
//!
//! Loads the PEM certificate chain and key named by [`TlsConfig`] and builds
//! the acceptor shared by the TLS and WebSocket/TLS listeners.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{danger::ClientCertVerifier, WebPkiClientVerifier};
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

use super::TlsConfig;

/// Error type for TLS setup
#[derive(Debug)]
pub enum TlsError {
    /// Reading a PEM file failed
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// The certificate set does not form a usable server config
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    let certs = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("{}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(format!(
            "no certificates found in {}",
            path
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let reader = BufReader::new(File::open(path)?);
    PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKeyError(format!("{}: {}", path, e)))
}

fn load_ca_certs(path: &str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::CertificateError(format!("bad CA certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Client certificate policy: required, optional (verified when
/// presented) or not requested at all.
fn client_verifier(config: &TlsConfig) -> Result<Option<Arc<dyn ClientCertVerifier>>, TlsError> {
    let Some(ca_path) = config.ca_cert_path.as_deref() else {
        if config.require_client_cert {
            return Err(TlsError::ConfigError(
                "ca_cert_path is required when require_client_cert is true".to_string(),
            ));
        }
        return Ok(None);
    };

    let builder = WebPkiClientVerifier::builder(Arc::new(load_ca_certs(ca_path)?));
    let builder = if config.require_client_cert {
        builder
    } else {
        builder.allow_unauthenticated()
    };
    builder
        .build()
        .map(Some)
        .map_err(|e| TlsError::ConfigError(format!("client verifier: {}", e)))
}

/// Build a `TlsAcceptor` from PEM files
pub fn load_tls_config(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let builder = ServerConfig::builder();
    let server_config = match client_verifier(config)? {
        Some(verifier) => builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key),
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| TlsError::ConfigError(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
