//! Diameter over TLS (RFC 6733 Section 2.1, port 5658)
//!
//! Certificate loading and rustls client configuration for dialing a peer
//! over TLS, optionally presenting a client certificate.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::error::{PeerError, PeerResult};
use crate::transport::dial_tcp;

/// TLS options for dialing a peer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSettings {
    /// CA bundle; the web PKI roots are used when absent
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    /// Skip server certificate verification (testing only)
    #[serde(default)]
    pub insecure_skip_verify: bool,
    /// SNI / verification name; defaults to the host part of the address
    #[serde(default)]
    pub server_name: Option<String>,
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load PEM-encoded certificates from a file path.
pub fn load_certs(path: &Path) -> PeerResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        PeerError::Tls(format!("Failed to open cert file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            PeerError::Tls(format!("Failed to parse certs from {}: {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(PeerError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load a PEM-encoded private key from a file path.
pub fn load_private_key(path: &Path) -> PeerResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        PeerError::Tls(format!("Failed to open key file {}: {e}", path.display()))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| PeerError::Tls(format!("Failed to parse key from {}: {e}", path.display())))?
        .ok_or_else(|| PeerError::Tls(format!("No private key found in {}", path.display())))
}

/// Build the client-side TLS config described by `settings`.
pub fn build_client_config(settings: &TlsSettings) -> PeerResult<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    match &settings.ca_cert {
        Some(ca) => {
            for cert in load_certs(ca)? {
                root_store
                    .add(cert)
                    .map_err(|e| PeerError::Tls(format!("Failed to add CA cert: {e}")))?;
            }
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| PeerError::Tls(format!("Failed to set protocol versions: {e}")))?
        .with_root_certificates(root_store);

    let mut config = match (&settings.client_cert, &settings.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| PeerError::Tls(format!("Invalid client certificate: {e}")))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(PeerError::Tls(
                "client_cert and client_key must be given together".into(),
            ))
        }
    };

    if settings.insecure_skip_verify {
        log::warn!("TLS server certificate verification is disabled");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification));
    }

    Ok(config)
}

/// Name to verify the server certificate against
fn server_name(address: &str, settings: &TlsSettings) -> PeerResult<ServerName<'static>> {
    let host = match &settings.server_name {
        Some(name) => name.clone(),
        None => {
            let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
            host.trim_start_matches('[').trim_end_matches(']').to_string()
        }
    };
    ServerName::try_from(host).map_err(|e| PeerError::Tls(format!("Invalid server name: {e}")))
}

/// Dial `address` and complete a TLS handshake.
pub async fn dial_tls(
    address: &str,
    settings: &TlsSettings,
    timeout: Duration,
) -> PeerResult<(TlsStream<TcpStream>, String)> {
    let connector = TlsConnector::from(Arc::new(build_client_config(settings)?));
    let name = server_name(address, settings)?;
    let (stream, peer_addr) = dial_tcp(address, timeout).await?;

    let stream = tokio::time::timeout(timeout, connector.connect(name, stream))
        .await
        .map_err(|_| PeerError::Tls(format!("TLS handshake with {address} timed out")))?
        .map_err(|e| PeerError::Tls(format!("TLS handshake with {address} failed: {e}")))?;

    log::debug!("TLS established with {peer_addr}");
    Ok((stream, peer_addr))
}

/// Dangerous: skip all server certificate verification (for testing only).
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
