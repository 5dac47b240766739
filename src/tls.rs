//! mTLS listener setup: required client certificate authentication, no plaintext
//! escape hatch. Peer identity is extracted once per connection (not per request)
//! and attached to the request before it reaches any handler.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{RootCertStore, ServerConfig};

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("rustls configuration error: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),

    #[error("client verifier setup error: {0}")]
    ClientVerifier(String),
}

/// Build the server's rustls configuration: trusts any client certificate signed
/// by `ca_cert_path`, and presents `server_cert_path`/`server_key_path` as its own
/// identity. Client certificate verification is required, not optional — there is
/// no configuration under which this controller accepts an unauthenticated
/// connection.
pub fn build_server_config(
    ca_cert_path: &Path,
    server_cert_path: &Path,
    server_key_path: &Path,
) -> Result<Arc<ServerConfig>, TlsSetupError> {
    let ca_certs = read_certs(ca_cert_path)?;
    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);

    let server_certs = read_certs(server_cert_path)?;
    let server_key = read_private_key(server_key_path)?;

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(root_store))
        .build()
        .map_err(|e| TlsSetupError::ClientVerifier(e.to_string()))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(server_certs, server_key)?;

    Ok(Arc::new(config))
}

fn read_certs(
    path: &Path,
) -> Result<Vec<tokio_rustls::rustls::pki_types::CertificateDer<'static>>, TlsSetupError> {
    let file = File::open(path).map_err(|e| TlsSetupError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsSetupError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })
}

fn read_private_key(
    path: &Path,
) -> Result<tokio_rustls::rustls::pki_types::PrivateKeyDer<'static>, TlsSetupError> {
    let file = File::open(path).map_err(|e| TlsSetupError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsSetupError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })?
        .ok_or_else(|| TlsSetupError::NoPrivateKey(path.display().to_string()))
}
