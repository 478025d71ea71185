use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use medvault_core::SerialNumber;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid certificate material in {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },
    #[error("invalid private key in {path}: {reason}")]
    PrivateKey { path: PathBuf, reason: String },
    #[error("TLS configuration rejected: {0}")]
    Config(String),
    #[error("peer certificate could not be parsed: {0}")]
    PeerCertificate(String),
}

/// Build an acceptor that requires a client certificate chaining to the CA bundle
/// at `ca_cert`.
///
/// # Errors
/// Returns [`TlsError`] when a PEM file is unreadable or empty, or when rustls
/// rejects the resulting configuration.
pub fn build_acceptor(
    ca_cert: &Path,
    server_cert: &Path,
    server_key: &Path,
) -> Result<TlsAcceptor, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(ca_cert)? {
        roots.add(cert).map_err(|err| TlsError::Certificate {
            path: ca_cert.to_path_buf(),
            reason: format!("failed to add CA certificate: {err}"),
        })?;
    }

    let chain = load_certificates(server_cert)?;
    let key = load_private_key(server_key)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| TlsError::Config(format!("client verifier error: {err}")))?;
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .map_err(|err| TlsError::Config(format!("server config error: {err}")))?;

    tracing::info!(ca = %ca_cert.display(), cert = %server_cert.display(), "loaded TLS credentials");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serial number of a DER-encoded certificate, in canonical decimal form.
///
/// # Errors
/// Returns [`TlsError::PeerCertificate`] when the certificate cannot be parsed.
pub fn peer_serial(cert: &CertificateDer<'_>) -> Result<SerialNumber, TlsError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|err| TlsError::PeerCertificate(err.to_string()))?;
    let serial = parsed.tbs_certificate.serial.to_string();
    SerialNumber::parse(&serial)
        .ok_or_else(|| TlsError::PeerCertificate(format!("unusable serial number {serial}")))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read { path: path.to_path_buf(), source })
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = read_pem(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| TlsError::Certificate {
            path: path.to_path_buf(),
            reason: format!("failed to parse certificates: {err}"),
        })?;
    if certs.is_empty() {
        return Err(TlsError::Certificate {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_pem(path)?;
    PrivateKeyDer::from_pem_slice(&pem).map_err(|err| TlsError::PrivateKey {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}
