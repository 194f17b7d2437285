//! TLS client role, used by connecting socket devices.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tracing::debug;

use super::{ensure_crypto_provider, load_certificates, load_private_key};
use crate::config::TlsCredsConfig;
use crate::error::{TlsError, TlsResult};

/// Wraps outbound connections in TLS.
#[derive(Clone)]
pub struct TlsConnector {
    inner: TokioTlsConnector,
}

impl TlsConnector {
    /// Create a connector from a client credential set.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The CA or client certificate files cannot be loaded
    /// - The client private key cannot be loaded
    /// - The resulting TLS configuration is rejected by rustls
    pub fn new(config: &TlsCredsConfig) -> TlsResult<Self> {
        ensure_crypto_provider();
        let client_config = build_client_config(config)?;
        Ok(Self {
            inner: TokioTlsConnector::from(Arc::new(client_config)),
        })
    }

    /// Run the client side of the handshake.
    ///
    /// `server_name` is used for SNI and to verify the server certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the handshake fails.
    pub async fn connect(
        &self,
        server_name: &str,
        stream: TcpStream,
    ) -> TlsResult<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TlsError::Config(format!("invalid server name: {e}")))?;

        debug!("initiating TLS handshake");
        self.inner
            .connect(server_name, stream)
            .await
            .map_err(|e| TlsError::Handshake(e.to_string()))
    }
}

fn build_client_config(config: &TlsCredsConfig) -> TlsResult<ClientConfig> {
    let mut roots = RootCertStore::empty();
    if let Some(ca_path) = &config.ca_cert_path {
        debug!(path = %ca_path.display(), "loading CA certificate");
        let (added, _ignored) = roots.add_parsable_certificates(load_certificates(ca_path)?);
        if added == 0 {
            return Err(TlsError::NoCertificates(ca_path.display().to_string()));
        }
    } else {
        debug!("using webpki root certificates");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match (&config.cert_path, &config.key_path) {
        (Some(cert_path), Some(key_path)) => {
            debug!("presenting client certificate");
            builder
                .with_client_auth_cert(load_certificates(cert_path)?, load_private_key(key_path)?)
                .map_err(|e| TlsError::Config(format!("failed to configure client auth: {e}")))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsEndpoint;
    use crate::tls::test_pki::TestPki;

    fn client_creds() -> TlsCredsConfig {
        TlsCredsConfig {
            endpoint: TlsEndpoint::Client,
            cert_path: None,
            key_path: None,
            ca_cert_path: None,
            verify_peer: false,
        }
    }

    #[test]
    fn test_connector_with_webpki_roots() {
        assert!(TlsConnector::new(&client_creds()).is_ok());
    }

    #[test]
    fn test_connector_with_ca_and_client_cert() {
        let pki = TestPki::generate();
        let creds = TlsCredsConfig {
            cert_path: Some(pki.client_cert.path().to_path_buf()),
            key_path: Some(pki.client_key.path().to_path_buf()),
            ca_cert_path: Some(pki.ca_cert.path().to_path_buf()),
            ..client_creds()
        };
        assert!(TlsConnector::new(&creds).is_ok());
    }

    #[test]
    fn test_connector_missing_ca_file() {
        let creds = TlsCredsConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            ..client_creds()
        };
        assert!(matches!(
            TlsConnector::new(&creds),
            Err(TlsError::CertificateLoad { .. })
        ));
    }

    #[test]
    fn test_connector_empty_ca_file() {
        let empty = tempfile::NamedTempFile::new().unwrap();
        let creds = TlsCredsConfig {
            ca_cert_path: Some(empty.path().to_path_buf()),
            ..client_creds()
        };
        assert!(matches!(
            TlsConnector::new(&creds),
            Err(TlsError::NoCertificates(_))
        ));
    }
}
