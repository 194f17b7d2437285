//! TLS gate for socket devices.
//!
//! A socket device that names `tls-creds` runs every new connection through a
//! [`TlsGate`] before the channel is usable: a handshake in the role matching
//! the device (client when it connected out, server when it accepted), then,
//! if `tls-authz` is set, an identity check of the peer certificate. Either
//! failure is treated like a failed connect.
//!
//! Credentials and policies are named objects held in [`TlsObjects`] and
//! looked up when a device is created.

pub mod authz;
pub mod client;
pub mod server;

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub use authz::{AuthzError, AuthzPolicy, PrincipalMapper};
pub use client::TlsConnector;
pub use server::TlsServerAcceptor;

use crate::config::{BridgeConfig, SocketOptions, TlsCredsConfig, TlsEndpoint};
use crate::error::{ConfigError, ConfigResult, Result, TlsError, TlsResult};

/// Install the ring crypto provider if not already installed.
fn ensure_crypto_provider() {
    // Already installed is fine.
    let _ = CryptoProvider::install_default(default_provider());
}

/// Load every certificate from a PEM file.
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
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(TlsError::PrivateKeyLoad {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    Err(TlsError::NoPrivateKeys(path.display().to_string()))
}

/// A loaded credential set, ready for one handshake role.
#[derive(Clone)]
pub enum TlsCreds {
    Server(TlsServerAcceptor),
    Client(TlsConnector),
}

impl TlsCreds {
    /// Load credentials from their YAML form.
    ///
    /// # Errors
    ///
    /// Returns an error if certificate or key material cannot be loaded.
    pub fn from_config(config: &TlsCredsConfig) -> TlsResult<Self> {
        match config.endpoint {
            TlsEndpoint::Server => Ok(Self::Server(TlsServerAcceptor::new(config)?)),
            TlsEndpoint::Client => Ok(Self::Client(TlsConnector::new(config)?)),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> TlsEndpoint {
        match self {
            Self::Server(_) => TlsEndpoint::Server,
            Self::Client(_) => TlsEndpoint::Client,
        }
    }
}

/// Named credential sets and authorization policies.
#[derive(Clone, Default)]
pub struct TlsObjects {
    creds: HashMap<String, TlsCreds>,
    authz: HashMap<String, Arc<AuthzPolicy>>,
}

impl TlsObjects {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every credential set and policy named in a bridge config.
    ///
    /// # Errors
    ///
    /// Returns an error if any credential set fails to load or any policy
    /// has invalid rules.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let mut objects = Self::new();
        for (id, creds) in &config.tls_creds {
            debug!(id = %id, endpoint = creds.endpoint.as_str(), "loading TLS credentials");
            objects.insert_creds(id.clone(), TlsCreds::from_config(creds)?);
        }
        for (id, policy) in &config.authz {
            objects.insert_authz(AuthzPolicy::from_config(id, policy)?);
        }
        Ok(objects)
    }

    pub fn insert_creds(&mut self, id: impl Into<String>, creds: TlsCreds) {
        self.creds.insert(id.into(), creds);
    }

    pub fn insert_authz(&mut self, policy: AuthzPolicy) {
        self.authz.insert(policy.id().to_string(), Arc::new(policy));
    }

    /// Resolve the gate a socket device needs, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the named credentials or policy do not exist, or
    /// if the credentials are for the wrong role.
    pub fn gate_for(&self, opts: &SocketOptions) -> ConfigResult<Option<TlsGate>> {
        let Some(creds_id) = &opts.tls_creds else {
            return Ok(None);
        };
        let creds = self
            .creds
            .get(creds_id)
            .ok_or_else(|| ConfigError::UnknownTlsCreds(creds_id.clone()))?;
        let expected = if opts.server {
            TlsEndpoint::Server
        } else {
            TlsEndpoint::Client
        };
        if creds.endpoint() != expected {
            return Err(ConfigError::TlsEndpointMismatch {
                id: creds_id.clone(),
                expected: expected.as_str(),
            });
        }
        let authz = opts
            .tls_authz
            .as_ref()
            .map(|id| {
                self.authz
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownAuthz(id.clone()))
            })
            .transpose()?;

        Ok(Some(TlsGate {
            creds: creds.clone(),
            authz,
        }))
    }
}

/// Handshake plus optional authorization, run once per connection.
#[derive(Clone)]
pub struct TlsGate {
    creds: TlsCreds,
    authz: Option<Arc<AuthzPolicy>>,
}

impl TlsGate {
    #[must_use]
    pub fn new(creds: TlsCreds, authz: Option<Arc<AuthzPolicy>>) -> Self {
        Self { creds, authz }
    }

    /// Secure `stream`, returning the TLS session and the authorized peer
    /// identity when a policy is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or the peer is not
    /// authorized.
    pub async fn secure(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<(SecureStream, Option<String>)> {
        let secured = match &self.creds {
            TlsCreds::Client(connector) => {
                SecureStream::Client(connector.connect(server_name, stream).await?)
            }
            TlsCreds::Server(acceptor) => SecureStream::Server(acceptor.accept(stream).await?),
        };

        let identity = match &self.authz {
            Some(policy) => Some(policy.check(secured.peer_certificates())?),
            None => None,
        };
        info!(
            role = self.creds.endpoint().as_str(),
            identity = identity.as_deref().unwrap_or("-"),
            "TLS session established"
        );
        Ok((secured, identity))
    }
}

/// A TLS session in either role.
pub enum SecureStream {
    Client(tokio_rustls::client::TlsStream<TcpStream>),
    Server(tokio_rustls::server::TlsStream<TcpStream>),
}

impl SecureStream {
    /// Peer certificate chain, leaf first.
    #[must_use]
    pub fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            Self::Client(stream) => stream.get_ref().1.peer_certificates(),
            Self::Server(stream) => stream.get_ref().1.peer_certificates(),
        }
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Client(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Server(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Client(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Server(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Client(stream) => Pin::new(stream).poll_flush(cx),
            Self::Server(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Client(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Server(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
