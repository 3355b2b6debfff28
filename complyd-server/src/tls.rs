//! Trust material for the scan-scoped result channel.
//!
//! Both ends of the channel authenticate each other against the scan's root
//! CA: the receiver only accepts clients whose certificate chains to it, and
//! the collector only trusts a receiver that does.

use std::{
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum_server::tls_rustls::RustlsConfig;
use rustls::{RootCertStore, ServerConfig, crypto::CryptoProvider, server::WebPkiClientVerifier};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::fs;

use complyd_config::TlsPaths;

/// TLS-related errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Certificate file not found: {0}")]
    CertificateNotFound(PathBuf),

    #[error("Private key file not found: {0}")]
    PrivateKeyNotFound(PathBuf),

    #[error("Failed to parse certificate: {0}")]
    CertificateParseFailed(String),

    #[error("Failed to parse private key: {0}")]
    PrivateKeyParseFailed(String),

    #[error("No private keys found in file")]
    NoPrivateKeysFound,

    #[error("TLS configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load certificates from PEM file
pub async fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    if !path.exists() {
        return Err(TlsError::CertificateNotFound(path.to_path_buf()));
    }

    let pem_data = fs::read(path).await?;
    let mut reader = BufReader::new(&pem_data[..]);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateParseFailed(e.to_string()))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateParseFailed(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file
pub async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    if !path.exists() {
        return Err(TlsError::PrivateKeyNotFound(path.to_path_buf()));
    }

    let pem_data = fs::read(path).await?;
    let mut reader = BufReader::new(&pem_data[..]);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyParseFailed(e.to_string()))?
        .ok_or(TlsError::NoPrivateKeysFound)
}

/// Root store holding every certificate in the CA bundle.
pub async fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path).await? {
        roots
            .add(cert)
            .map_err(|e| TlsError::CertificateParseFailed(e.to_string()))?;
    }
    Ok(roots)
}

/// Server configuration that requires and verifies client certificates
/// against the CA bundle in `paths.ca`.
pub async fn receiver_server_config(paths: &TlsPaths) -> Result<ServerConfig, TlsError> {
    let cert_chain = load_certificates(&paths.cert).await?;
    let private_key = load_private_key(&paths.key).await?;
    let roots = load_root_store(&paths.ca).await?;

    let provider = provider();
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| TlsError::ConfigurationError(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::ConfigurationError(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, private_key)
        .map_err(|e| TlsError::ConfigurationError(e.to_string()))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// axum-server acceptor configuration for the receiver.
pub async fn receiver_acceptor(paths: &TlsPaths) -> Result<RustlsConfig, TlsError> {
    let config = receiver_server_config(paths).await?;
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

/// HTTPS client presenting the collector's certificate and trusting only the
/// scan CA.
pub async fn collector_client(paths: &TlsPaths) -> Result<reqwest::Client, TlsError> {
    // Parse up front so a broken mount is reported with the file that is wrong.
    load_certificates(&paths.cert).await?;
    load_private_key(&paths.key).await?;
    load_certificates(&paths.ca).await?;

    let mut identity_pem = fs::read(&paths.cert).await?;
    identity_pem.push(b'\n');
    identity_pem.extend(fs::read(&paths.key).await?);
    let identity = reqwest::Identity::from_pem(&identity_pem)
        .map_err(|e| TlsError::PrivateKeyParseFailed(e.to_string()))?;

    let ca_pem = fs::read(&paths.ca).await?;
    let ca = reqwest::Certificate::from_pem(&ca_pem)
        .map_err(|e| TlsError::CertificateParseFailed(e.to_string()))?;

    reqwest::Client::builder()
        .use_rustls_tls()
        .tls_built_in_root_certs(false)
        .add_root_certificate(ca)
        .identity(identity)
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        .https_only(true)
        .build()
        .map_err(|e| TlsError::ConfigurationError(e.to_string()))
}
