//! Backend dispatch contract.
//!
//! Every transport implements [`ChardevDriver`]. A [`Chardev`] pairs one
//! driver with the shared [`Backend`] state (identity, feature bits, the
//! attached front-end) and serializes writes. Front-ends talk to it through a
//! [`CharBackend`] handle.
//!
//! Data flows from the transport to the front-end only after the transport
//! asks [`Backend::front_end_can_write`] how much the front-end can take;
//! events go out through [`Backend::deliver_event`].

pub mod chardev;
pub mod frontend;
pub mod null;
pub mod ringbuf;

use std::fmt;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tracing::trace;

pub use chardev::Chardev;
pub use frontend::{CharBackend, FrontEnd};
pub use null::NullDriver;
pub use ringbuf::RingBufDriver;

use crate::error::{ChardevError, Result};
use crate::metrics::ChardevMetrics;

/// Largest chunk a transport delivers to the front-end in one call.
pub const READ_BUF_LEN: usize = 4096;

/// Events delivered from a backend to its front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChardevEvent {
    /// The peer sent a serial break (telnet `IAC BREAK`).
    Break,
    /// The backend is ready for I/O.
    Opened,
    /// A multiplexer focused this front-end.
    MuxIn,
    /// A multiplexer moved focus away from this front-end.
    MuxOut,
    /// The read side of the backend closed.
    ///
    /// Only input is known to be gone. A transport with separate read and
    /// write channels may still accept writes after this event, so callers
    /// track writability through write results, not through `Closed`.
    Closed,
}

/// Capabilities a backend may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChardevFeature {
    /// Connection state can change at runtime and be waited on.
    Reconnectable = 1 << 0,
    /// Descriptors can travel alongside data.
    FdPass = 1 << 1,
    /// Traffic is recorded for replay; the device cannot be swapped.
    Replay = 1 << 2,
    /// The runtime context can be changed after creation.
    ContextMutable = 1 << 3,
}

/// A set of [`ChardevFeature`] bits.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet(u8);

impl FeatureSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn with(self, feature: ChardevFeature) -> Self {
        Self(self.0 | feature as u8)
    }

    #[must_use]
    pub const fn contains(self, feature: ChardevFeature) -> bool {
        self.0 & feature as u8 != 0
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let all = [
            ChardevFeature::Reconnectable,
            ChardevFeature::FdPass,
            ChardevFeature::Replay,
            ChardevFeature::ContextMutable,
        ];
        f.debug_set()
            .entries(all.into_iter().filter(|feat| self.contains(*feat)))
            .finish()
    }
}

/// Conditions a writer can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchCondition {
    /// The transport can accept more output.
    Out,
    /// The peer hung up.
    Hup,
}

/// Device control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChardevIoctl {
    SerialSetParams {
        speed: u32,
        parity: char,
        data_bits: u8,
        stop_bits: u8,
    },
    SerialSetBreak(bool),
    SerialGetTiocm,
    SerialSetTiocm(u32),
}

/// Successful ioctl results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Tiocm(u32),
}

/// Connection phase of a reconnectable transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionPhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a reconnectable transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    /// Peer of the active channel.
    pub peer: Option<String>,
    /// Authorized TLS identity of the peer.
    pub identity: Option<String>,
    /// Listening addresses, in listen mode.
    pub local: Vec<String>,
    /// Connects started by the reconnect timer.
    pub connect_attempts: u64,
    /// Failure streaks that were reported.
    pub reported_failures: u64,
}

/// The operation table every transport implements.
///
/// Only [`kind`](Self::kind), [`open`](Self::open) and
/// [`write`](Self::write) are required. The remaining operations default to
/// a no-op or to [`ChardevError::Unsupported`].
#[async_trait]
pub trait ChardevDriver: Send + Sync {
    /// Backend name, as used in option strings.
    fn kind(&self) -> &'static str;

    fn features(&self) -> FeatureSet {
        FeatureSet::empty()
    }

    /// Start the transport. Returns whether the backend is open right away,
    /// in which case the caller emits [`ChardevEvent::Opened`].
    async fn open(&self, backend: Arc<Backend>) -> Result<bool>;

    /// Send bytes, returning how many went out. Zero means the transport
    /// would block and is not an error.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Read buffered input without going through the front-end.
    fn sync_read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(ChardevError::Unsupported("sync_read"))
    }

    /// Resolve once `cond` holds.
    async fn add_watch(&self, _cond: WatchCondition) -> Result<()> {
        Ok(())
    }

    /// The front-end's read handlers or context changed.
    fn update_read_handler(&self) {}

    fn ioctl(&self, _cmd: ChardevIoctl) -> Result<IoctlReply> {
        Err(ChardevError::Unsupported("ioctl"))
    }

    /// Take up to `max` received descriptors.
    fn get_msgfds(&self, _max: usize) -> Vec<OwnedFd> {
        Vec::new()
    }

    /// Stage descriptors for the next write.
    fn set_msgfds(&self, _fds: Vec<OwnedFd>) -> Result<()> {
        Err(ChardevError::Unsupported("set_msgfds"))
    }

    /// Adopt an already connected socket.
    async fn add_client(&self, _fd: OwnedFd) -> Result<()> {
        Err(ChardevError::Unsupported("add_client"))
    }

    /// Wait for a connected peer. `None` waits forever, a zero duration
    /// only polls.
    async fn wait_connected(&self, _timeout: Option<Duration>) -> Result<()> {
        Ok(())
    }

    /// Drop the active connection.
    fn disconnect(&self) {}

    /// The front-end has room again.
    fn accept_input(&self) {}

    fn set_echo(&self, _echo: bool) {}

    fn set_fe_open(&self, _open: bool) {}

    /// Hook run for every event delivered through [`Chardev::deliver_event`].
    fn be_event(&self, _event: ChardevEvent) {}

    /// Called once all front-ends are wired.
    fn machine_done(&self) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> Option<ConnectionStatus> {
        None
    }

    /// Release the transport. Nothing scheduled by the driver runs after
    /// this returns.
    async fn close(&self) {}
}

/// State shared between a device, its driver, and its front-end.
pub struct Backend {
    label: String,
    filename: RwLock<String>,
    features: AtomicU8,
    be_open: AtomicBool,
    fe_open: AtomicBool,
    attached: AtomicBool,
    front_end: RwLock<Option<Weak<dyn FrontEnd>>>,
    context: RwLock<Handle>,
    metrics: Arc<ChardevMetrics>,
}

impl Backend {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        filename: impl Into<String>,
        features: FeatureSet,
        context: Handle,
        metrics: Arc<ChardevMetrics>,
    ) -> Self {
        Self {
            label: label.into(),
            filename: RwLock::new(filename.into()),
            features: AtomicU8::new(features.bits()),
            be_open: AtomicBool::new(false),
            fe_open: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            front_end: RwLock::new(None),
            context: RwLock::new(context),
            metrics,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// URI-like description of the current transport state.
    #[must_use]
    pub fn filename(&self) -> String {
        self.filename.read().clone()
    }

    pub fn set_filename(&self, filename: impl Into<String>) {
        *self.filename.write() = filename.into();
    }

    #[must_use]
    pub fn features(&self) -> FeatureSet {
        FeatureSet::from_bits(self.features.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn has_feature(&self, feature: ChardevFeature) -> bool {
        self.features().contains(feature)
    }

    pub(crate) fn set_features(&self, features: FeatureSet) {
        self.features.store(features.bits(), Ordering::Release);
    }

    /// Whether the backend has signalled [`ChardevEvent::Opened`].
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.be_open.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.be_open.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_fe_open(&self) -> bool {
        self.fe_open.load(Ordering::Acquire)
    }

    pub(crate) fn set_fe_open(&self, open: bool) {
        self.fe_open.store(open, Ordering::Release);
    }

    /// Runtime the transport schedules its work on.
    #[must_use]
    pub fn context(&self) -> Handle {
        self.context.read().clone()
    }

    pub(crate) fn set_context(&self, context: Handle) {
        *self.context.write() = context;
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ChardevMetrics> {
        &self.metrics
    }

    pub(crate) fn try_attach(&self) -> Result<()> {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ChardevError::InUse(self.label.clone()))
    }

    pub(crate) fn detach(&self) {
        *self.front_end.write() = None;
        self.attached.store(false, Ordering::Release);
    }

    /// Whether a front-end handle is attached.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_front_end(&self, front_end: Option<Weak<dyn FrontEnd>>) {
        *self.front_end.write() = front_end;
    }

    fn front_end(&self) -> Option<Arc<dyn FrontEnd>> {
        self.front_end.read().as_ref().and_then(Weak::upgrade)
    }

    /// Bytes the front-end can take right now. Zero when nothing is attached.
    #[must_use]
    pub fn front_end_can_write(&self) -> usize {
        self.front_end().map_or(0, |fe| fe.can_receive())
    }

    /// Hand input to the front-end. Callers stay within the last
    /// [`front_end_can_write`](Self::front_end_can_write) answer.
    pub fn deliver_to_front_end(&self, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        if let Some(fe) = self.front_end() {
            self.metrics.record_bytes_received(&self.label, buf.len());
            fe.receive(buf);
        }
    }

    /// Record an event and pass it to the front-end.
    pub fn deliver_event(&self, event: ChardevEvent) {
        match event {
            ChardevEvent::Opened => self.be_open.store(true, Ordering::Release),
            ChardevEvent::Closed => self.be_open.store(false, Ordering::Release),
            _ => {}
        }
        trace!(chardev = %self.label, ?event, "backend event");
        if let Some(fe) = self.front_end() {
            fe.event(event);
        }
    }

    /// Tell the front-end the transport behind it was replaced.
    pub(crate) fn notify_changed(&self) {
        if let Some(fe) = self.front_end() {
            fe.backend_changed();
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("label", &self.label)
            .field("filename", &*self.filename.read())
            .field("features", &self.features())
            .field("be_open", &self.is_open())
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingFrontEnd;

    fn backend() -> Backend {
        Backend::new(
            "test0",
            "null",
            FeatureSet::empty().with(ChardevFeature::FdPass),
            Handle::current(),
            Arc::new(ChardevMetrics::new()),
        )
    }

    #[test]
    fn test_feature_set() {
        let set = FeatureSet::empty()
            .with(ChardevFeature::Reconnectable)
            .with(ChardevFeature::ContextMutable);
        assert!(set.contains(ChardevFeature::Reconnectable));
        assert!(set.contains(ChardevFeature::ContextMutable));
        assert!(!set.contains(ChardevFeature::FdPass));
        assert_eq!(format!("{set:?}"), "{Reconnectable, ContextMutable}");
    }

    #[tokio::test]
    async fn test_no_front_end_means_no_capacity() {
        let backend = backend();
        assert_eq!(backend.front_end_can_write(), 0);
        backend.deliver_to_front_end(b"dropped");
        backend.deliver_event(ChardevEvent::Opened);
        assert!(backend.is_open());
    }

    #[tokio::test]
    async fn test_delivery_reaches_front_end() {
        let backend = backend();
        let fe = RecordingFrontEnd::new(16);
        let dyn_fe: Arc<dyn FrontEnd> = fe.clone();
        backend.set_front_end(Some(Arc::downgrade(&dyn_fe)));

        assert_eq!(backend.front_end_can_write(), 16);
        backend.deliver_to_front_end(b"abc");
        backend.deliver_event(ChardevEvent::Opened);
        backend.deliver_event(ChardevEvent::Closed);

        assert_eq!(fe.data(), b"abc");
        assert_eq!(fe.events(), vec![ChardevEvent::Opened, ChardevEvent::Closed]);
        assert!(!backend.is_open());
    }

    #[tokio::test]
    async fn test_front_end_is_not_kept_alive() {
        let backend = backend();
        let fe: Arc<dyn FrontEnd> = RecordingFrontEnd::new(16);
        backend.set_front_end(Some(Arc::downgrade(&fe)));
        drop(fe);
        assert_eq!(backend.front_end_can_write(), 0);
    }

    #[tokio::test]
    async fn test_single_attachment() {
        let backend = backend();
        backend.try_attach().unwrap();
        assert!(matches!(backend.try_attach(), Err(ChardevError::InUse(_))));
        backend.detach();
        assert!(backend.try_attach().is_ok());
    }
}
