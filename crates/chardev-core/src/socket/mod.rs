//! Socket backend.
//!
//! A socket device either listens for one peer at a time or connects out,
//! optionally retrying on a fixed interval. New connections may be wrapped in
//! TLS (with an identity check), upgraded to websocket, or greeted with
//! telnet option negotiation before the front-end sees `Opened`.
//!
//! The connection state machine runs in a dedicated task (see [`task`]);
//! [`SocketChardev`] is the handle the device talks to.

pub mod address;
pub mod channel;
pub mod listener;
pub mod setup;
mod task;

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

pub use address::SocketAddress;
pub use channel::RawStream;
pub use listener::Listener;
pub use setup::ChannelSetup;

use self::channel::ChannelWriter;
use self::task::{Command, SocketTask};
use crate::backend::{
    Backend, ChardevDriver, ChardevFeature, ConnectionPhase, ConnectionStatus, FeatureSet,
    WatchCondition,
};
use crate::config::SocketOptions;
use crate::error::{ChardevError, Result};
use crate::fdpass::{InboundFds, OutboundFds};
use crate::reconnect::ReconnectScheduler;
use crate::telnet::{TelnetCodec, TelnetMode};
use crate::tls::TlsGate;

/// Connection state published by the driver task.
#[derive(Debug, Clone, Default)]
pub(crate) struct LinkState {
    phase: ConnectionPhase,
    peer: Option<String>,
    identity: Option<String>,
    local: Vec<String>,
    /// Why a non-retrying client stopped.
    last_error: Option<String>,
    connect_attempts: u64,
    reported_failures: u64,
    /// The driver task has exited.
    closed: bool,
}

/// The sending half of the active channel.
pub(crate) struct ActiveWriter {
    channel: ChannelWriter,
    /// Which connection this is; bumped on every connect.
    generation: u64,
    /// Fired by the driver task before it takes the writer away.
    cancel: CancellationToken,
}

/// State shared between the device handle and its driver task.
pub(crate) struct Shared {
    label: String,
    opts: SocketOptions,
    setup: ChannelSetup,
    link: watch::Sender<LinkState>,
    writer: tokio::sync::Mutex<Option<ActiveWriter>>,
    inbound: Mutex<InboundFds>,
    outbound: Mutex<OutboundFds>,
    input_ready: Notify,
}

impl Shared {
    fn scheme(&self) -> &'static str {
        match (&self.opts.address, self.opts.telnet_mode()) {
            (SocketAddress::Inet { .. }, Some(TelnetMode::Telnet)) => "telnet",
            (SocketAddress::Inet { .. }, Some(TelnetMode::Tn3270)) => "tn3270",
            (SocketAddress::Inet { .. }, None) if self.opts.websocket => "websocket",
            (SocketAddress::Inet { .. }, None) => "tcp",
            _ => "unix",
        }
    }

    fn server_suffix(&self) -> &'static str {
        if self.opts.server {
            ",server=on"
        } else {
            ""
        }
    }

    fn disconnected_filename(&self) -> String {
        format!("disconnected:{}{}", self.opts.address, self.server_suffix())
    }

    fn connected_filename(&self, local: &str, peer: &str, listening: bool) -> String {
        let suffix = if listening { ",server=on" } else { "" };
        format!("{}:{local}{suffix}<-{peer}", self.scheme())
    }
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

/// The socket transport driver.
pub struct SocketChardev {
    shared: Arc<Shared>,
    features: FeatureSet,
    running: Mutex<Option<Running>>,
}

impl SocketChardev {
    #[must_use]
    pub fn new(label: &str, opts: SocketOptions, tls: Option<TlsGate>) -> Self {
        let fd_pass = opts.address.supports_fd_passing();
        let mut features = FeatureSet::empty().with(ChardevFeature::Reconnectable);
        if fd_pass {
            features = features.with(ChardevFeature::FdPass);
        }
        let setup = ChannelSetup {
            tls,
            server_name: opts.address.server_name().to_string(),
            websocket: opts.websocket,
            telnet: opts.telnet_mode(),
            nodelay: opts.nodelay,
            fd_pass,
        };
        let (link, _) = watch::channel(LinkState::default());
        Self {
            shared: Arc::new(Shared {
                label: label.to_string(),
                opts,
                setup,
                link,
                writer: tokio::sync::Mutex::new(None),
                inbound: Mutex::new(InboundFds::new()),
                outbound: Mutex::new(OutboundFds::new()),
                input_ready: Notify::new(),
            }),
            features,
            running: Mutex::new(None),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        let running = self.running.lock();
        let Some(running) = running.as_ref() else {
            return Err(ChardevError::Shutdown);
        };
        running
            .commands
            .send(command)
            .map_err(|_| ChardevError::Shutdown)
    }

    fn connect_error(&self, err: impl std::fmt::Display) -> ChardevError {
        ChardevError::Connect {
            label: self.shared.label.clone(),
            message: err.to_string(),
        }
    }

    async fn wait_hangup(&self) {
        let mut link = self.shared.link.subscribe();
        let _ = link
            .wait_for(|s| s.phase != ConnectionPhase::Connected || s.closed)
            .await;
    }
}

#[async_trait]
impl ChardevDriver for SocketChardev {
    fn kind(&self) -> &'static str {
        "socket"
    }

    fn features(&self) -> FeatureSet {
        self.features
    }

    #[instrument(skip_all, fields(chardev = %self.shared.label, address = %self.shared.opts.address))]
    async fn open(&self, backend: Arc<Backend>) -> Result<bool> {
        let opts = &self.shared.opts;
        let (commands, rx) = mpsc::unbounded_channel();
        let reconnect = ReconnectScheduler::new(
            opts.reconnect,
            backend.has_feature(ChardevFeature::Reconnectable),
            opts.server,
        );
        let mut task = SocketTask::new(Arc::clone(&self.shared), Arc::clone(&backend), rx, reconnect);

        self.shared.link.send_replace(LinkState::default());
        backend.set_filename(self.shared.disconnected_filename());

        if opts.server {
            let listener = Listener::bind(&opts.address)
                .await
                .map_err(|e| self.connect_error(format!("failed to listen: {e}")))?;
            task.set_listener(listener);
        } else if opts.reconnect.is_none() {
            let raw = task::connect(&opts.address).await.map_err(|e| {
                backend.metrics().record_connect_failure(&self.shared.label);
                self.connect_error(e)
            })?;
            let est = self.shared.setup.establish(raw).await.inspect_err(|_| {
                backend.metrics().record_connect_failure(&self.shared.label);
            })?;
            task.connected(est).await;
        } else {
            task.start_connect();
        }

        let handle = backend.context().spawn(task.run());
        *self.running.lock() = Some(Running {
            commands,
            task: handle,
        });

        if opts.server && opts.wait {
            info!("waiting for connection");
            self.wait_connected(None).await?;
        }
        Ok(false)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut writer = self.shared.writer.lock().await;
        let Some(active) = writer.as_mut() else {
            trace!(chardev = %self.shared.label, len = buf.len(), "not connected, discarding output");
            return Ok(buf.len());
        };
        let cancel = active.cancel.clone();
        let generation = active.generation;

        let staged = self.shared.outbound.lock().take();
        let fds: Vec<RawFd> = staged.iter().map(AsRawFd::as_raw_fd).collect();
        let channel = &mut active.channel;
        let attempt = async {
            match self.shared.setup.telnet {
                Some(TelnetMode::Telnet) => {
                    let mut escaped = BytesMut::with_capacity(buf.len());
                    TelnetCodec::new(TelnetMode::Telnet).escape_into(buf, &mut escaped);
                    channel.write_all(&escaped, &fds).await.map(|()| buf.len())
                }
                _ => channel.write(buf, &fds).await,
            }
        };
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(chardev = %self.shared.label, "channel closed during write");
                return Err(ChardevError::NotConnected(self.shared.label.clone()));
            }
            result = attempt => result,
        };

        match result {
            Ok(0) => {
                self.shared.outbound.lock().restore(staged);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                warn!(chardev = %self.shared.label, error = %e, "write failed, closing connection");
                *writer = None;
                drop(writer);
                if self.send(Command::WriteFailed(generation)).is_err() {
                    debug!(chardev = %self.shared.label, "driver task already stopped");
                }
                Err(e.into())
            }
        }
    }

    async fn add_watch(&self, cond: WatchCondition) -> Result<()> {
        match cond {
            WatchCondition::Out => {
                let (stream, cancel) = {
                    let writer = self.shared.writer.lock().await;
                    match writer.as_ref() {
                        Some(active) => (active.channel.plain_stream(), active.cancel.clone()),
                        None => return Err(ChardevError::NotConnected(self.shared.label.clone())),
                    }
                };
                if let Some(stream) = stream {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            return Err(ChardevError::NotConnected(self.shared.label.clone()));
                        }
                        ready = stream.writable() => ready?,
                    }
                }
                Ok(())
            }
            WatchCondition::Hup => {
                self.wait_hangup().await;
                Ok(())
            }
        }
    }

    fn update_read_handler(&self) {
        self.shared.input_ready.notify_one();
    }

    fn get_msgfds(&self, max: usize) -> Vec<OwnedFd> {
        self.shared.inbound.lock().drain(max)
    }

    fn set_msgfds(&self, fds: Vec<OwnedFd>) -> Result<()> {
        if !self.features.contains(ChardevFeature::FdPass) {
            return Err(ChardevError::Unsupported("set_msgfds"));
        }
        self.shared.outbound.lock().stage(fds)
    }

    async fn add_client(&self, fd: OwnedFd) -> Result<()> {
        let raw = RawStream::from_owned_fd(fd, self.shared.opts.address.is_inet())?;
        let (reply, result) = oneshot::channel();
        self.send(Command::AddClient(raw, reply))?;
        result.await.map_err(|_| ChardevError::Shutdown)?
    }

    async fn wait_connected(&self, timeout: Option<Duration>) -> Result<()> {
        let mut link = self.shared.link.subscribe();
        {
            let state = link.borrow_and_update();
            if state.phase == ConnectionPhase::Connected {
                return Ok(());
            }
            if state.closed {
                return Err(ChardevError::Shutdown);
            }
        }
        let label = self.shared.label.clone();
        if timeout == Some(Duration::ZERO) {
            return Err(ChardevError::Timeout {
                label,
                timeout: Duration::ZERO,
            });
        }

        if !self.shared.opts.server {
            self.shared.link.send_modify(|s| s.last_error = None);
            self.send(Command::Connect)?;
        }

        let wait = async {
            loop {
                if link.changed().await.is_err() {
                    return Err(ChardevError::Shutdown);
                }
                let state = link.borrow_and_update();
                if state.phase == ConnectionPhase::Connected {
                    return Ok(());
                }
                if state.closed {
                    return Err(ChardevError::Shutdown);
                }
                if let Some(message) = &state.last_error {
                    return Err(ChardevError::Connect {
                        label: label.clone(),
                        message: message.clone(),
                    });
                }
            }
        };
        match timeout {
            None => wait.await,
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ChardevError::Timeout {
                    label: self.shared.label.clone(),
                    timeout: limit,
                })?,
        }
    }

    fn disconnect(&self) {
        if self.send(Command::Disconnect).is_err() {
            debug!(chardev = %self.shared.label, "disconnect on stopped device");
        }
    }

    fn accept_input(&self) {
        self.shared.input_ready.notify_one();
    }

    fn status(&self) -> Option<ConnectionStatus> {
        let state = self.shared.link.borrow();
        Some(ConnectionStatus {
            phase: state.phase,
            peer: state.peer.clone(),
            identity: state.identity.clone(),
            local: state.local.clone(),
            connect_attempts: state.connect_attempts,
            reported_failures: state.reported_failures,
        })
    }

    async fn close(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        if running.commands.send(Command::Shutdown).is_err() {
            running.task.abort();
        }
        if let Err(e) = running.task.await {
            if e.is_panic() {
                warn!(chardev = %self.shared.label, "driver task panicked");
            }
        }
    }
}

impl Drop for SocketChardev {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.task.abort();
        }
    }
}
