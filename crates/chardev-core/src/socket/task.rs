//! The per-device driver task.
//!
//! Everything that changes a socket device's connection state happens here:
//! accepts, connect completions, reads, reconnect timers and commands from
//! the device handle. One task per device, so these never race.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelReader, RawStream, ReadOutcome};
use super::listener::Listener;
use super::setup::Established;
use super::{ActiveWriter, Shared, SocketAddress};
use crate::backend::{Backend, ChardevEvent, ConnectionPhase, READ_BUF_LEN};
use crate::error::{ChardevError, Result};
use crate::reconnect::ReconnectScheduler;
use crate::telnet::{TelnetCodec, TelnetFrame};

/// How often input is re-polled while the front-end reports no room and
/// has not called `accept_input`.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Requests from the device handle.
pub(crate) enum Command {
    /// Connect now (client mode).
    Connect,
    /// Drop the active channel.
    Disconnect,
    /// A write on connection `generation` failed.
    WriteFailed(u64),
    /// Use an already connected socket as the channel.
    AddClient(RawStream, oneshot::Sender<Result<()>>),
    Shutdown,
}

/// An in-flight connect or handshake. Aborted when dropped.
struct PendingSetup(JoinHandle<Result<Established>>);

impl Drop for PendingSetup {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn wait_pending(pending: &mut Option<PendingSetup>) -> Result<Established> {
    match pending.as_mut() {
        Some(task) => match (&mut task.0).await {
            Ok(result) => result,
            Err(e) => Err(ChardevError::Io(std::io::Error::other(e))),
        },
        None => std::future::pending().await,
    }
}

async fn accept(listener: &Option<Listener>) -> std::io::Result<(RawStream, String)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

enum Input {
    Read(std::io::Result<ReadOutcome>),
    HangUp,
    Retry,
}

pub(crate) struct SocketTask {
    shared: Arc<Shared>,
    backend: Arc<Backend>,
    commands: mpsc::UnboundedReceiver<Command>,
    listener: Option<Listener>,
    reader: Option<ChannelReader>,
    telnet: Option<TelnetCodec>,
    pending: Option<PendingSetup>,
    reconnect: ReconnectScheduler,
    generation: u64,
    cancel_writes: Option<CancellationToken>,
}

impl SocketTask {
    pub(crate) fn new(
        shared: Arc<Shared>,
        backend: Arc<Backend>,
        commands: mpsc::UnboundedReceiver<Command>,
        reconnect: ReconnectScheduler,
    ) -> Self {
        Self {
            shared,
            backend,
            commands,
            listener: None,
            reader: None,
            telnet: None,
            pending: None,
            reconnect,
            generation: 0,
            cancel_writes: None,
        }
    }

    fn label(&self) -> &str {
        &self.shared.label
    }

    pub(crate) fn set_listener(&mut self, listener: Listener) {
        let local = listener.local_labels(&self.shared.opts.address);
        info!(chardev = %self.label(), addresses = ?local, "listening");
        self.shared.link.send_modify(|s| s.local = local);
        self.listener = Some(listener);
    }

    pub(crate) async fn run(mut self) {
        loop {
            let can_accept = self.reader.is_none() && self.pending.is_none();
            let reading = self.reader.is_some();

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => self.connect_now(),
                    Some(Command::Disconnect) => self.drop_channel("disconnect requested").await,
                    Some(Command::WriteFailed(generation)) if generation == self.generation => {
                        self.drop_channel("write error").await;
                    }
                    Some(Command::WriteFailed(generation)) => {
                        debug!(chardev = %self.label(), generation, "ignoring write error from an old connection");
                    }
                    Some(Command::AddClient(raw, reply)) => {
                        let _ = reply.send(self.add_client(raw));
                    }
                    Some(Command::Shutdown) | None => break,
                },
                result = wait_pending(&mut self.pending) => {
                    self.pending = None;
                    match result {
                        Ok(est) => self.connected(est).await,
                        Err(e) => self.setup_failed(&e),
                    }
                }
                () = self.reconnect.expired() => {
                    self.backend.metrics().record_reconnect_attempt(self.label());
                    let attempts = self.reconnect.attempts();
                    self.shared.link.send_modify(|s| s.connect_attempts = attempts);
                    debug!(chardev = %self.label(), attempts, "reconnecting");
                    self.start_connect();
                }
                accepted = accept(&self.listener), if can_accept => match accepted {
                    Ok((raw, peer)) => {
                        debug!(chardev = %self.label(), peer = %peer, "accepted connection");
                        self.start_setup(raw);
                    }
                    Err(e) => warn!(chardev = %self.label(), error = %e, "accept failed"),
                },
                input = next_input(
                    self.reader.as_mut(),
                    &self.backend,
                    &self.shared.input_ready,
                ), if reading => self.handle_input(input).await,
            }
        }
        self.shutdown().await;
    }

    /// Connect client mode right away, dropping any armed retry.
    fn connect_now(&mut self) {
        if self.listener.is_some() || self.reader.is_some() || self.pending.is_some() {
            return;
        }
        self.reconnect.cancel();
        self.start_connect();
    }

    pub(crate) fn start_connect(&mut self) {
        let shared = Arc::clone(&self.shared);
        let handle = self.backend.context().spawn(async move {
            let raw = connect(&shared.opts.address).await.map_err(|e| ChardevError::Connect {
                label: shared.label.clone(),
                message: e.to_string(),
            })?;
            shared.setup.establish(raw).await
        });
        self.pending = Some(PendingSetup(handle));
        self.shared
            .link
            .send_modify(|s| s.phase = ConnectionPhase::Connecting);
    }

    fn start_setup(&mut self, raw: RawStream) {
        let shared = Arc::clone(&self.shared);
        let handle = self
            .backend
            .context()
            .spawn(async move { shared.setup.establish(raw).await });
        self.pending = Some(PendingSetup(handle));
    }

    fn add_client(&mut self, raw: RawStream) -> Result<()> {
        if self.reader.is_some() || self.pending.is_some() {
            return Err(ChardevError::InUse(self.label().to_string()));
        }
        self.reconnect.cancel();
        info!(chardev = %self.label(), peer = %raw.peer_label(), "adopting client socket");
        self.start_setup(raw);
        Ok(())
    }

    pub(crate) async fn connected(&mut self, est: Established) {
        let Established {
            reader,
            writer,
            peer,
            local,
            identity,
        } = est;

        self.reconnect.connected();
        self.reader = Some(reader);
        self.telnet = self.shared.setup.telnet.map(TelnetCodec::new);
        self.generation += 1;
        let cancel = CancellationToken::new();
        self.cancel_writes = Some(cancel.clone());
        *self.shared.writer.lock().await = Some(ActiveWriter {
            channel: writer,
            generation: self.generation,
            cancel,
        });

        let listening = self.listener.is_some();
        self.backend
            .set_filename(self.shared.connected_filename(&local, &peer, listening));
        self.shared.link.send_modify(|s| {
            s.phase = ConnectionPhase::Connected;
            s.peer = Some(peer.clone());
            s.identity = identity.clone();
            s.last_error = None;
        });
        self.backend.metrics().record_connect(self.label());
        info!(chardev = %self.label(), peer = %peer, "connected");
        self.backend.deliver_event(ChardevEvent::Opened);
    }

    fn setup_failed(&mut self, err: &ChardevError) {
        self.backend.metrics().record_connect_failure(self.label());
        if self.listener.is_some() {
            warn!(chardev = %self.label(), error = %err, "dropping peer");
            return;
        }
        self.shared
            .link
            .send_modify(|s| s.phase = ConnectionPhase::Disconnected);
        if self.reconnect.is_enabled() {
            self.reconnect.connect_failed(&self.shared.label, err);
            self.reconnect.arm();
            let reported = self.reconnect.reported_failures();
            self.shared
                .link
                .send_modify(|s| s.reported_failures = reported);
        } else {
            error!(chardev = %self.label(), error = %err, "unable to connect character device");
            let message = err.to_string();
            self.shared.link.send_modify(|s| s.last_error = Some(message));
        }
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Retry => {}
            Input::HangUp => self.drop_channel("peer hung up").await,
            Input::Read(Ok(ReadOutcome::Eof)) => self.drop_channel("peer closed").await,
            Input::Read(Err(e)) => {
                warn!(chardev = %self.label(), error = %e, "read failed");
                self.drop_channel("read error").await;
            }
            Input::Read(Ok(ReadOutcome::Data(data, fds))) => {
                if !fds.is_empty() {
                    self.shared.inbound.lock().append(fds);
                }
                match self.telnet.as_mut() {
                    None => self.backend.deliver_to_front_end(&data),
                    Some(codec) => {
                        let mut src = BytesMut::from(&data[..]);
                        loop {
                            match codec.decode(&mut src) {
                                Ok(Some(TelnetFrame::Data(payload))) => {
                                    self.backend.deliver_to_front_end(&payload);
                                }
                                Ok(Some(TelnetFrame::Break)) => {
                                    self.backend.deliver_event(ChardevEvent::Break);
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(chardev = %self.shared.label, error = %e, "telnet decode failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Tear down the active channel and fall back to disconnected.
    async fn drop_channel(&mut self, reason: &str) {
        if self.reader.is_none() {
            return;
        }
        self.reader = None;
        self.telnet = None;
        self.release_writer().await;
        self.shared.inbound.lock().clear();

        self.backend.set_filename(self.shared.disconnected_filename());
        self.shared.link.send_modify(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.peer = None;
            s.identity = None;
        });
        self.backend.metrics().record_disconnect(self.label());
        info!(chardev = %self.label(), reason, "disconnected");
        self.backend.deliver_event(ChardevEvent::Closed);

        if self.listener.is_none() && self.reconnect.arm() {
            debug!(chardev = %self.label(), interval = ?self.reconnect.interval(), "reconnect armed");
        }
    }

    /// Take the writer away. A write blocked on a peer that stopped reading
    /// holds the writer lock, so it is cancelled first.
    async fn release_writer(&mut self) {
        if let Some(cancel) = self.cancel_writes.take() {
            cancel.cancel();
        }
        *self.shared.writer.lock().await = None;
    }

    async fn shutdown(&mut self) {
        self.pending = None;
        self.reconnect.cancel();
        if self.reader.take().is_some() {
            self.backend.metrics().record_disconnect(self.label());
        }
        self.telnet = None;
        self.listener = None;
        self.release_writer().await;
        self.shared.inbound.lock().clear();
        self.shared.outbound.lock().take();
        self.shared.link.send_modify(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.peer = None;
            s.identity = None;
            s.closed = true;
        });
        debug!(chardev = %self.label(), "driver task stopped");
    }
}

/// Wait for the next thing to do on the read side.
async fn next_input(
    reader: Option<&mut ChannelReader>,
    backend: &Backend,
    input_ready: &tokio::sync::Notify,
) -> Input {
    let Some(reader) = reader else {
        return std::future::pending().await;
    };
    let room = backend.front_end_can_write().min(READ_BUF_LEN);
    if room > 0 {
        return Input::Read(reader.read(room).await);
    }
    tokio::select! {
        () = input_ready.notified() => Input::Retry,
        () = tokio::time::sleep(READ_POLL_INTERVAL) => Input::Retry,
        () = reader.hangup() => Input::HangUp,
    }
}

pub(super) async fn connect(address: &SocketAddress) -> std::io::Result<RawStream> {
    if address.is_inet() {
        address.connect_tcp().await.map(RawStream::Tcp)
    } else {
        address.connect_unix().await.map(RawStream::Unix)
    }
}
