//! Listening sockets for server-mode devices.
//!
//! An inet address may resolve to several socket addresses; every one is
//! bound and accepted from together.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::task::Poll;

use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use super::address::SocketAddress;
use super::channel::RawStream;

/// Bound listening sockets.
#[derive(Debug)]
pub enum Listener {
    Tcp(Vec<TcpListener>),
    /// Unix listener, and the path to unlink when it goes away.
    Unix(UnixListener, Option<PathBuf>),
}

impl Listener {
    /// Bind `address`.
    ///
    /// # Errors
    ///
    /// Returns an error if no address could be bound.
    pub async fn bind(address: &SocketAddress) -> io::Result<Self> {
        match address {
            SocketAddress::Inet { .. } => {
                let mut listeners = Vec::new();
                let mut last_err = None;
                for addr in address.resolve().await? {
                    match TcpListener::bind(addr).await {
                        Ok(listener) => listeners.push(listener),
                        Err(e) => {
                            warn!(%addr, error = %e, "failed to bind address");
                            last_err = Some(e);
                        }
                    }
                }
                if listeners.is_empty() {
                    return Err(last_err
                        .unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable)));
                }
                Ok(Self::Tcp(listeners))
            }
            SocketAddress::Unix { path } => {
                if path.exists() {
                    debug!(path = %path.display(), "removing stale socket");
                    std::fs::remove_file(path)?;
                }
                Ok(Self::Unix(UnixListener::bind(path)?, Some(path.clone())))
            }
            SocketAddress::Abstract { name } => Ok(Self::Unix(bind_abstract(name)?, None)),
        }
    }

    /// Accept the next connection on any bound socket.
    pub async fn accept(&self) -> io::Result<(RawStream, String)> {
        match self {
            Self::Tcp(listeners) => {
                poll_fn(|cx| {
                    for listener in listeners {
                        if let Poll::Ready(result) = listener.poll_accept(cx) {
                            return Poll::Ready(
                                result.map(|(s, peer)| (RawStream::Tcp(s), peer.to_string())),
                            );
                        }
                    }
                    Poll::Pending
                })
                .await
            }
            Self::Unix(listener, _) => {
                let (stream, _) = listener.accept().await?;
                let stream = RawStream::Unix(stream);
                let peer = stream.peer_label();
                Ok((stream, peer))
            }
        }
    }

    /// Bound TCP addresses (empty for unix listeners).
    #[must_use]
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        match self {
            Self::Tcp(listeners) => listeners.iter().filter_map(|l| l.local_addr().ok()).collect(),
            Self::Unix(..) => Vec::new(),
        }
    }

    /// Printable bound addresses.
    #[must_use]
    pub fn local_labels(&self, address: &SocketAddress) -> Vec<String> {
        match self {
            Self::Tcp(_) => self.local_addrs().iter().map(ToString::to_string).collect(),
            Self::Unix(..) => vec![address.to_string()],
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Unix(_, Some(path)) = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                debug!(path = %path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_abstract(name: &str) -> io::Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr as UnixSocketAddr, UnixListener as StdUnixListener};

    let addr = UnixSocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = StdUnixListener::bind_addr(&addr)?;
    listener.set_nonblocking(true)?;
    info!(name, "bound abstract socket");
    UnixListener::from_std(listener)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract unix sockets require Linux",
    ))
}
