//! The active data channel of a socket device.
//!
//! A plain channel reads and writes the socket directly, which is what makes
//! descriptor passing and hang-up detection possible. TLS and websocket
//! channels go through their protocol stacks instead.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UnixStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace};

use crate::fdpass::MAX_FDS;
use crate::tls::SecureStream;

/// A connected stream socket.
#[derive(Debug)]
pub enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl RawStream {
    /// Adopt a connected descriptor. `inet` selects TCP over unix.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be registered with the
    /// runtime.
    pub fn from_owned_fd(fd: OwnedFd, inet: bool) -> io::Result<Self> {
        if inet {
            let stream = std::net::TcpStream::from(fd);
            stream.set_nonblocking(true)?;
            Ok(Self::Tcp(TcpStream::from_std(stream)?))
        } else {
            let stream = std::os::unix::net::UnixStream::from(fd);
            stream.set_nonblocking(true)?;
            Ok(Self::Unix(UnixStream::from_std(stream)?))
        }
    }

    /// Printable peer address.
    #[must_use]
    pub fn peer_label(&self) -> String {
        match self {
            Self::Tcp(s) => s
                .peer_addr()
                .map_or_else(|_| "unknown".to_string(), |a| a.to_string()),
            Self::Unix(s) => unix_label(s.peer_addr().ok()),
        }
    }

    /// Printable local address.
    #[must_use]
    pub fn local_label(&self) -> String {
        match self {
            Self::Tcp(s) => s
                .local_addr()
                .map_or_else(|_| "unknown".to_string(), |a| a.to_string()),
            Self::Unix(s) => unix_label(s.local_addr().ok()),
        }
    }

    pub(crate) fn set_nodelay(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nodelay(true),
            Self::Unix(_) => Ok(()),
        }
    }

    async fn ready(&self, interest: Interest) -> io::Result<tokio::io::Ready> {
        match self {
            Self::Tcp(s) => s.ready(interest).await,
            Self::Unix(s) => s.ready(interest).await,
        }
    }

    async fn readable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.readable().await,
            Self::Unix(s) => s.readable().await,
        }
    }

    pub(crate) async fn writable(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.writable().await,
            Self::Unix(s) => s.writable().await,
        }
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_read(buf),
            Self::Unix(s) => s.try_read(buf),
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.try_write(buf),
            Self::Unix(s) => s.try_write(buf),
        }
    }

    fn try_io<R>(&self, interest: Interest, f: impl FnOnce() -> io::Result<R>) -> io::Result<R> {
        match self {
            Self::Tcp(s) => s.try_io(interest, f),
            Self::Unix(s) => s.try_io(interest, f),
        }
    }

    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

fn unix_label(addr: Option<tokio::net::unix::SocketAddr>) -> String {
    addr.and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
        .unwrap_or_else(|| "unnamed".to_string())
}

impl AsyncRead for RawStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RawStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Self::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            Self::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Self::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A raw socket, or a TLS session on top of one.
pub enum Transport {
    Raw(RawStream),
    Secure(Box<SecureStream>),
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(s) => Pin::new(s).poll_read(cx, buf),
            Self::Secure(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Raw(s) => Pin::new(s).poll_write(cx, buf),
            Self::Secure(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(s) => Pin::new(s).poll_flush(cx),
            Self::Secure(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Raw(s) => Pin::new(s).poll_shutdown(cx),
            Self::Secure(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Result of one read from the channel.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Payload, plus any descriptors that came with it.
    Data(Bytes, Vec<OwnedFd>),
    /// The peer closed its side.
    Eof,
}

/// Receiving half of the active channel.
pub enum ChannelReader {
    Plain { stream: Arc<RawStream>, fd_pass: bool },
    Stream(ReadHalf<Transport>),
    WebSocket {
        stream: SplitStream<WebSocketStream<Transport>>,
        pending: BytesMut,
    },
}

impl ChannelReader {
    /// Read at most `max` bytes.
    pub async fn read(&mut self, max: usize) -> io::Result<ReadOutcome> {
        let mut buf = vec![0u8; max];
        match self {
            Self::Plain { stream, fd_pass } => loop {
                stream.readable().await?;
                let result = if *fd_pass {
                    stream.try_io(Interest::READABLE, || recv_with_fds(stream.raw_fd(), &mut buf))
                } else {
                    stream.try_read(&mut buf).map(|n| (n, Vec::new()))
                };
                match result {
                    Ok((0, _)) => return Ok(ReadOutcome::Eof),
                    Ok((n, fds)) => {
                        buf.truncate(n);
                        return Ok(ReadOutcome::Data(Bytes::from(buf), fds));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            },
            Self::Stream(reader) => match reader.read(&mut buf).await? {
                0 => Ok(ReadOutcome::Eof),
                n => {
                    buf.truncate(n);
                    Ok(ReadOutcome::Data(Bytes::from(buf), Vec::new()))
                }
            },
            Self::WebSocket { stream, pending } => {
                while pending.is_empty() {
                    match stream.next().await {
                        Some(Ok(Message::Binary(data))) => pending.extend_from_slice(&data),
                        Some(Ok(Message::Text(text))) => pending.extend_from_slice(text.as_bytes()),
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "websocket close received");
                            return Ok(ReadOutcome::Eof);
                        }
                        Some(Ok(other)) => trace!(?other, "ignoring websocket control message"),
                        Some(Err(e)) => return Err(io::Error::other(e)),
                        None => return Ok(ReadOutcome::Eof),
                    }
                }
                let n = max.min(pending.len());
                let chunk = pending.split_to(n).freeze();
                Ok(ReadOutcome::Data(chunk, Vec::new()))
            }
        }
    }

    /// Resolve when the peer hangs up. Only plain channels can tell; the
    /// others never resolve.
    pub async fn hangup(&self) {
        if let Self::Plain { stream, .. } = self {
            match stream.ready(Interest::READABLE).await {
                Ok(ready) if ready.is_read_closed() => return,
                Err(_) => return,
                Ok(_) => {}
            }
        }
        std::future::pending::<()>().await;
    }
}

/// Sending half of the active channel.
pub enum ChannelWriter {
    Plain { stream: Arc<RawStream>, fd_pass: bool },
    Stream(WriteHalf<Transport>),
    WebSocket(SplitSink<WebSocketStream<Transport>, Message>),
}

impl ChannelWriter {
    /// One write attempt. Plain channels may take part of `buf`, or nothing
    /// (`Ok(0)`) when the socket is full; `fds` go out only if something
    /// was sent. The other channels send everything.
    pub async fn write(&mut self, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        match self {
            Self::Plain { stream, fd_pass } => {
                let result = if *fd_pass && !fds.is_empty() {
                    stream.try_io(Interest::WRITABLE, || send_with_fds(stream.raw_fd(), buf, fds))
                } else {
                    stream.try_write(buf)
                };
                match result {
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
                    other => other,
                }
            }
            Self::Stream(writer) => {
                writer.write_all(buf).await?;
                writer.flush().await?;
                Ok(buf.len())
            }
            Self::WebSocket(sink) => {
                sink.send(Message::binary(buf.to_vec()))
                    .await
                    .map_err(io::Error::other)?;
                Ok(buf.len())
            }
        }
    }

    /// Write all of `buf`, waiting for room as needed.
    pub async fn write_all(&mut self, buf: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let mut data = buf;
        let mut fds = fds;
        while !data.is_empty() {
            let n = self.write(data, fds).await?;
            if n == 0 {
                self.writable().await?;
                continue;
            }
            data.advance(n);
            fds = &[];
        }
        Ok(())
    }

    /// Resolve when a plain channel has room. Other channels always do.
    pub async fn writable(&self) -> io::Result<()> {
        match self {
            Self::Plain { stream, .. } => stream.writable().await,
            _ => Ok(()),
        }
    }

    /// The socket behind a plain channel, for waiting without the writer
    /// lock.
    pub fn plain_stream(&self) -> Option<Arc<RawStream>> {
        match self {
            Self::Plain { stream, .. } => Some(Arc::clone(stream)),
            _ => None,
        }
    }
}

#[cfg(target_os = "linux")]
fn recv_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn recv_flags() -> MsgFlags {
    MsgFlags::empty()
}

/// `recvmsg` with room for [`MAX_FDS`] descriptors.
fn recv_with_fds(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!([RawFd; MAX_FDS]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg), recv_flags())?;

    let mut received = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for raw in fds {
                // SAFETY: the kernel just installed `raw` in this process and
                // nothing else refers to it.
                #[allow(unsafe_code)]
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                received.push(owned);
            }
        }
    }
    if !received.is_empty() {
        debug!(count = received.len(), "received descriptors");
    }
    Ok((msg.bytes, received))
}

fn send_with_fds(fd: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(buf)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    let sent = sendmsg::<()>(fd, &iov, &cmsgs, MsgFlags::empty(), None)?;
    debug!(count = fds.len(), bytes = sent, "sent descriptors");
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Seek, Write};

    fn pair() -> (Arc<RawStream>, Arc<RawStream>) {
        let (a, b) = UnixStream::pair().unwrap();
        (Arc::new(RawStream::Unix(a)), Arc::new(RawStream::Unix(b)))
    }

    #[tokio::test]
    async fn test_plain_round_trip() {
        let (a, b) = pair();
        let mut writer = ChannelWriter::Plain {
            stream: a,
            fd_pass: false,
        };
        let mut reader = ChannelReader::Plain {
            stream: b,
            fd_pass: false,
        };
        writer.write_all(b"ping", &[]).await.unwrap();
        match reader.read(16).await.unwrap() {
            ReadOutcome::Data(data, fds) => {
                assert_eq!(&data[..], b"ping");
                assert!(fds.is_empty());
            }
            ReadOutcome::Eof => panic!("unexpected eof"),
        }
    }

    #[tokio::test]
    async fn test_read_respects_max() {
        let (a, b) = pair();
        let mut writer = ChannelWriter::Plain {
            stream: a,
            fd_pass: false,
        };
        let mut reader = ChannelReader::Plain {
            stream: b,
            fd_pass: false,
        };
        writer.write_all(b"abcdef", &[]).await.unwrap();
        let ReadOutcome::Data(first, _) = reader.read(4).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(&first[..], b"abcd");
    }

    #[tokio::test]
    async fn test_descriptor_passing() {
        let (a, b) = pair();
        let mut writer = ChannelWriter::Plain {
            stream: a,
            fd_pass: true,
        };
        let mut reader = ChannelReader::Plain {
            stream: b,
            fd_pass: true,
        };

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"shared").unwrap();
        writer.write_all(b"x", &[file.as_raw_fd()]).await.unwrap();

        let ReadOutcome::Data(data, mut fds) = reader.read(16).await.unwrap() else {
            panic!("expected data");
        };
        assert_eq!(&data[..], b"x");
        assert_eq!(fds.len(), 1);

        let mut received = File::from(fds.remove(0));
        received.rewind().unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "shared");
    }

    #[tokio::test]
    async fn test_eof_and_hangup() {
        let (a, b) = pair();
        let mut reader = ChannelReader::Plain {
            stream: b,
            fd_pass: false,
        };
        drop(a);
        tokio::time::timeout(std::time::Duration::from_secs(1), reader.hangup())
            .await
            .unwrap();
        assert!(matches!(reader.read(8).await.unwrap(), ReadOutcome::Eof));
    }
}
