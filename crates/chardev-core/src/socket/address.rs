//! Socket address kinds accepted by the socket backend.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::net::{lookup_host, TcpStream, UnixStream};
use tracing::debug;

/// Where a socket device listens or connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    /// TCP host and port. The host may resolve to several addresses.
    Inet { host: String, port: u16 },
    /// Unix stream socket bound to a filesystem path.
    Unix { path: PathBuf },
    /// Linux abstract-namespace unix socket.
    Abstract { name: String },
}

impl SocketAddress {
    /// Whether this is a TCP address.
    #[must_use]
    pub fn is_inet(&self) -> bool {
        matches!(self, Self::Inet { .. })
    }

    /// Whether descriptors can travel over sockets of this kind.
    #[must_use]
    pub fn supports_fd_passing(&self) -> bool {
        !self.is_inet()
    }

    /// Name presented for TLS SNI and certificate checks.
    #[must_use]
    pub fn server_name(&self) -> &str {
        match self {
            Self::Inet { host, .. } => host,
            _ => "localhost",
        }
    }

    /// Resolve an inet address to every socket address it names.
    ///
    /// # Errors
    ///
    /// Returns an error if name resolution fails or yields nothing, or if the
    /// address is not an inet address.
    pub async fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let Self::Inet { host, port } = self else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only inet addresses can be resolved",
            ));
        };
        let addrs: Vec<SocketAddr> = lookup_host((host.as_str(), *port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}:{port}"),
            ));
        }
        debug!(host = %host, port, count = addrs.len(), "resolved address");
        Ok(addrs)
    }

    /// Open an outbound TCP connection, trying each resolved address in turn.
    pub(crate) async fn connect_tcp(&self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.resolve().await? {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)))
    }

    /// Open an outbound unix-domain connection.
    pub(crate) async fn connect_unix(&self) -> io::Result<UnixStream> {
        match self {
            Self::Unix { path } => UnixStream::connect(path).await,
            Self::Abstract { name } => connect_abstract(name),
            Self::Inet { .. } => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "inet address used for a unix connection",
            )),
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr as UnixSocketAddr, UnixStream as StdUnixStream};

    let addr = UnixSocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = StdUnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    UnixStream::from_std(stream)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets require Linux",
    ))
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet { host, port } if host.contains(':') => write!(f, "tcp:[{host}]:{port}"),
            Self::Inet { host, port } => write!(f, "tcp:{host}:{port}"),
            Self::Unix { path } => write!(f, "unix:{}", path.display()),
            Self::Abstract { name } => write!(f, "unix:@{name}"),
        }
    }
}
