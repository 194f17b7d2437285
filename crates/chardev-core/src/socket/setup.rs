//! Per-connection setup: TLS, websocket upgrade and the telnet greeting.

use std::sync::Arc;

use tracing::debug;

use super::channel::{ChannelReader, ChannelWriter, RawStream, Transport};
use crate::error::{ChardevError, Result};
use crate::telnet::{TelnetGreeting, TelnetMode};
use crate::tls::TlsGate;

/// What every new connection of a device goes through.
#[derive(Clone)]
pub struct ChannelSetup {
    pub tls: Option<TlsGate>,
    /// Name checked against the server certificate in client mode.
    pub server_name: String,
    pub websocket: bool,
    pub telnet: Option<TelnetMode>,
    pub nodelay: bool,
    pub fd_pass: bool,
}

/// A channel ready for data.
pub struct Established {
    pub reader: ChannelReader,
    pub writer: ChannelWriter,
    pub peer: String,
    pub local: String,
    /// Peer identity accepted by the authorization policy.
    pub identity: Option<String>,
}

impl ChannelSetup {
    /// Turn a freshly connected or accepted socket into a usable channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS handshake, the authorization check, the
    /// websocket upgrade or the greeting fails.
    pub async fn establish(&self, raw: RawStream) -> Result<Established> {
        if self.nodelay {
            raw.set_nodelay()?;
        }
        let peer = raw.peer_label();
        let local = raw.local_label();

        let (transport, identity) = match (&self.tls, raw) {
            (Some(gate), RawStream::Tcp(tcp)) => {
                let (secure, identity) = gate.secure(tcp, &self.server_name).await?;
                (Transport::Secure(Box::new(secure)), identity)
            }
            (Some(_), RawStream::Unix(_)) => {
                return Err(ChardevError::Unsupported("TLS over unix sockets"));
            }
            (None, raw) => (Transport::Raw(raw), None),
        };

        let (reader, mut writer) = if self.websocket {
            let ws = tokio_tungstenite::accept_async(transport)
                .await
                .map_err(|e| ChardevError::WebSocket(e.to_string()))?;
            debug!(peer = %peer, "websocket upgrade complete");
            let (sink, stream) = futures::StreamExt::split(ws);
            (
                ChannelReader::WebSocket {
                    stream,
                    pending: bytes::BytesMut::new(),
                },
                ChannelWriter::WebSocket(sink),
            )
        } else {
            match transport {
                Transport::Raw(raw) => {
                    let stream = Arc::new(raw);
                    (
                        ChannelReader::Plain {
                            stream: Arc::clone(&stream),
                            fd_pass: self.fd_pass,
                        },
                        ChannelWriter::Plain {
                            stream,
                            fd_pass: self.fd_pass,
                        },
                    )
                }
                secure @ Transport::Secure(_) => {
                    let (r, w) = tokio::io::split(secure);
                    (ChannelReader::Stream(r), ChannelWriter::Stream(w))
                }
            }
        };

        if let Some(mode) = self.telnet {
            let mut greeting = TelnetGreeting::new(mode);
            while !greeting.is_complete() {
                let n = writer.write(greeting.pending(), &[]).await?;
                if n == 0 {
                    writer.writable().await?;
                }
                greeting.advance(n);
            }
            debug!(peer = %peer, ?mode, "telnet greeting sent");
        }

        Ok(Established {
            reader,
            writer,
            peer,
            local,
            identity,
        })
    }
}
