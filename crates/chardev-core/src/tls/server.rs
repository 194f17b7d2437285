//! TLS server role, used by listening socket devices.

use std::path::Path;
use std::sync::Arc;

use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor as TokioTlsAcceptor;
use tracing::debug;

use super::{ensure_crypto_provider, load_certificates, load_private_key};
use crate::config::TlsCredsConfig;
use crate::error::{TlsError, TlsResult};

/// Wraps accepted connections in TLS, presenting the configured certificate
/// and optionally verifying a client certificate.
#[derive(Clone)]
pub struct TlsServerAcceptor {
    inner: TokioTlsAcceptor,
}

impl TlsServerAcceptor {
    /// Create an acceptor from a server credential set.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The certificate or key files cannot be loaded
    /// - The CA used for client verification cannot be loaded
    /// - The resulting TLS configuration is rejected by rustls
    pub fn new(config: &TlsCredsConfig) -> TlsResult<Self> {
        ensure_crypto_provider();
        let server_config = build_server_config(config)?;
        Ok(Self {
            inner: TokioTlsAcceptor::from(Arc::new(server_config)),
        })
    }

    /// Run the server side of the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake fails.
    pub async fn accept(&self, stream: TcpStream) -> TlsResult<TlsStream<TcpStream>> {
        debug!("accepting TLS session");
        self.inner
            .accept(stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

fn build_server_config(config: &TlsCredsConfig) -> TlsResult<ServerConfig> {
    let cert_path = config
        .cert_path
        .as_ref()
        .ok_or_else(|| TlsError::Config("server credentials need cert_path".to_string()))?;
    let key_path = config
        .key_path
        .as_ref()
        .ok_or_else(|| TlsError::Config("server credentials need key_path".to_string()))?;
    let certs = load_certificates(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = ServerConfig::builder();
    let builder = match (&config.ca_cert_path, config.verify_peer) {
        (Some(ca_path), true) => {
            debug!(ca_path = %ca_path.display(), "requiring client certificates");
            builder.with_client_cert_verifier(build_client_verifier(ca_path, false)?)
        }
        (Some(ca_path), false) => {
            debug!(ca_path = %ca_path.display(), "verifying optional client certificates");
            builder.with_client_cert_verifier(build_client_verifier(ca_path, true)?)
        }
        (None, true) => {
            return Err(TlsError::Config(
                "verify_peer requires ca_cert_path".to_string(),
            ))
        }
        (None, false) => builder.with_no_client_auth(),
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("failed to configure server cert: {e}")))
}

fn build_client_verifier(
    ca_path: &Path,
    allow_unauthenticated: bool,
) -> TlsResult<Arc<dyn ClientCertVerifier>> {
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(load_certificates(ca_path)?);
    if added == 0 {
        return Err(TlsError::NoCertificates(ca_path.display().to_string()));
    }

    let builder = WebPkiClientVerifier::builder(Arc::new(roots));
    let builder = if allow_unauthenticated {
        builder.allow_unauthenticated()
    } else {
        builder
    };
    builder
        .build()
        .map_err(|e| TlsError::Config(format!("failed to build client verifier: {e}")))
}
