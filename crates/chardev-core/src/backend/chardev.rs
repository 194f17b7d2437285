//! A device: shared backend state plus a swappable transport driver.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{
    Backend, ChardevDriver, ChardevEvent, ChardevFeature, ChardevIoctl, ConnectionStatus,
    FeatureSet, IoctlReply, NullDriver, RingBufDriver, WatchCondition,
};
use crate::config::{BackendOptions, ChardevOptions};
use crate::error::{ChardevError, Result};
use crate::metrics::ChardevMetrics;
use crate::socket::SocketChardev;
use crate::tls::TlsObjects;

/// Held for the duration of one write.
struct WriteState {
    log: Option<File>,
}

/// A character device.
pub struct Chardev {
    backend: Arc<Backend>,
    driver: RwLock<Arc<dyn ChardevDriver>>,
    write_lock: Mutex<WriteState>,
    options: RwLock<ChardevOptions>,
}

/// Build the driver selected by `options`.
fn build_driver(options: &ChardevOptions, tls: &TlsObjects) -> Result<Arc<dyn ChardevDriver>> {
    Ok(match &options.backend {
        BackendOptions::Null => Arc::new(NullDriver::new()),
        BackendOptions::RingBuf(ring) => Arc::new(RingBufDriver::new(ring.size)?),
        BackendOptions::Socket(sock) => {
            sock.validate()?;
            let gate = tls.gate_for(sock)?;
            Arc::new(SocketChardev::new(&options.id, sock.clone(), gate))
        }
    })
}

async fn open_log(options: &ChardevOptions) -> Result<Option<File>> {
    let Some(path) = &options.logfile else {
        return Ok(None);
    };
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(options.logappend)
        .truncate(!options.logappend)
        .open(path)
        .await?;
    debug!(chardev = %options.id, path = %path.display(), "logging output");
    Ok(Some(file))
}

impl Chardev {
    /// Create and open a device.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid, the log file cannot be
    /// opened, or the transport fails to open.
    #[instrument(skip_all, fields(chardev = %options.id, backend = options.backend.kind()))]
    pub async fn open(
        options: ChardevOptions,
        tls: &TlsObjects,
        metrics: Arc<ChardevMetrics>,
        context: Handle,
    ) -> Result<Arc<Self>> {
        let driver = build_driver(&options, tls)?;
        let backend = Arc::new(Backend::new(
            options.id.clone(),
            options.backend.kind(),
            driver.features(),
            context,
            metrics,
        ));
        let log = open_log(&options).await?;

        let be_opened = match driver.open(Arc::clone(&backend)).await {
            Ok(opened) => opened,
            Err(e) => {
                driver.close().await;
                return Err(e);
            }
        };

        info!(filename = %backend.filename(), "character device created");
        let chr = Arc::new(Self {
            backend,
            driver: RwLock::new(driver),
            write_lock: Mutex::new(WriteState { log }),
            options: RwLock::new(options),
        });
        if be_opened {
            chr.backend.deliver_event(ChardevEvent::Opened);
        }
        Ok(chr)
    }

    fn driver(&self) -> Arc<dyn ChardevDriver> {
        Arc::clone(&self.driver.read())
    }

    #[must_use]
    pub fn label(&self) -> &str {
        self.backend.label()
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Backend name of the current driver.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.driver().kind()
    }

    #[must_use]
    pub fn options(&self) -> ChardevOptions {
        self.options.read().clone()
    }

    #[must_use]
    pub fn features(&self) -> FeatureSet {
        self.backend.features()
    }

    #[must_use]
    pub fn has_feature(&self, feature: ChardevFeature) -> bool {
        self.backend.has_feature(feature)
    }

    /// Add a feature bit after creation. Only
    /// [`ChardevFeature::ContextMutable`] may be added this way; every other
    /// bit is fixed by the transport.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for any other feature.
    pub fn set_feature(&self, feature: ChardevFeature) -> Result<()> {
        if feature != ChardevFeature::ContextMutable {
            return Err(ChardevError::Unsupported("set_feature"));
        }
        self.backend.set_features(self.backend.features().with(feature));
        Ok(())
    }

    #[cfg(test)]
    fn force_feature(&self, feature: ChardevFeature) {
        self.backend.set_features(self.backend.features().with(feature));
    }

    /// Send `buf` to the transport.
    ///
    /// With `full` set, keeps writing until every byte is out or the
    /// transport fails. Otherwise makes one attempt and returns how much was
    /// taken, which may be zero. Bytes actually sent are copied to the log
    /// file.
    ///
    /// # Errors
    ///
    /// Returns the transport error. A full write that fails part way still
    /// returns the error.
    pub async fn write(&self, buf: &[u8], full: bool) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.write_lock.lock().await;
        let driver = self.driver();

        let mut offset = 0;
        let result = loop {
            match driver.write(&buf[offset..]).await {
                Ok(0) if full => {
                    if let Err(e) = driver.add_watch(WatchCondition::Out).await {
                        break Err(e);
                    }
                }
                Ok(n) => {
                    offset += n;
                    if !full || offset == buf.len() {
                        break Ok(offset);
                    }
                }
                Err(e) => break Err(e),
            }
        };

        if offset > 0 {
            self.backend
                .metrics()
                .record_bytes_written(self.label(), offset);
            if let Some(log) = state.log.as_mut() {
                if let Err(e) = log.write_all(&buf[..offset]).await {
                    warn!(chardev = %self.label(), error = %e, "failed to write log file");
                }
            }
        }
        result
    }

    /// Read buffered input directly.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` unless the transport buffers input.
    pub fn sync_read(&self, buf: &mut [u8]) -> Result<usize> {
        self.driver().sync_read(buf)
    }

    /// Move the device to `context` when one is given. The driver picks the
    /// new context up the next time it spawns work.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::ContextImmutable`] if a context is given and
    /// the device lacks [`ChardevFeature::ContextMutable`].
    pub fn update_read_handlers(&self, context: Option<Handle>) -> Result<()> {
        if let Some(context) = context {
            if !self.has_feature(ChardevFeature::ContextMutable) {
                return Err(ChardevError::ContextImmutable(self.label().to_string()));
            }
            self.backend.set_context(context);
        }
        Ok(())
    }

    pub(crate) fn update_read_handler(&self) {
        self.driver().update_read_handler();
    }

    /// # Errors
    ///
    /// Returns `Unsupported` for transports without device controls.
    pub fn ioctl(&self, cmd: ChardevIoctl) -> Result<IoctlReply> {
        self.driver().ioctl(cmd)
    }

    #[must_use]
    pub fn get_msgfds(&self, max: usize) -> Vec<OwnedFd> {
        self.driver().get_msgfds(max)
    }

    /// # Errors
    ///
    /// Fails if the transport cannot pass descriptors or too many are given.
    pub fn set_msgfds(&self, fds: Vec<OwnedFd>) -> Result<()> {
        self.driver().set_msgfds(fds)
    }

    /// Adopt an already connected socket as the active channel.
    ///
    /// # Errors
    ///
    /// Fails if the transport does not take clients or already has one.
    pub async fn add_client(&self, fd: OwnedFd) -> Result<()> {
        self.driver().add_client(fd).await
    }

    /// # Errors
    ///
    /// Fails on timeout or when the transport gave up connecting.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> Result<()> {
        self.driver().wait_connected(timeout).await
    }

    pub fn disconnect(&self) {
        self.driver().disconnect();
    }

    pub fn accept_input(&self) {
        self.driver().accept_input();
    }

    pub fn set_echo(&self, echo: bool) {
        self.driver().set_echo(echo);
    }

    pub fn set_fe_open(&self, open: bool) {
        self.backend.set_fe_open(open);
        self.driver().set_fe_open(open);
    }

    /// Raise an event on behalf of the transport.
    pub fn deliver_event(&self, event: ChardevEvent) {
        self.driver().be_event(event);
        self.backend.deliver_event(event);
    }

    /// # Errors
    ///
    /// Propagates driver failures.
    pub fn machine_done(&self) -> Result<()> {
        self.driver().machine_done()
    }

    #[must_use]
    pub fn status(&self) -> Option<ConnectionStatus> {
        self.driver().status()
    }

    /// Rebuild the transport from `options`, keeping the label, the backend
    /// and the attached front-end.
    ///
    /// The old transport is closed first. If the new one fails to open, the
    /// device is reopened with its previous options and the error returned.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::ChangeRefused`] for replay devices or a label
    /// mismatch, or the error from opening the new transport.
    #[instrument(skip_all, fields(chardev = %self.label()))]
    pub async fn change(&self, options: ChardevOptions, tls: &TlsObjects) -> Result<()> {
        if self.has_feature(ChardevFeature::Replay) {
            return Err(ChardevError::ChangeRefused(
                self.label().to_string(),
                "record/replay is enabled",
            ));
        }
        if options.id != self.label() {
            return Err(ChardevError::ChangeRefused(
                self.label().to_string(),
                "the id cannot change",
            ));
        }
        let new_driver = build_driver(&options, tls)?;
        let new_log = open_log(&options).await?;

        // Closing first cancels a write stuck on the old channel, which
        // releases the write lock.
        self.driver().close().await;
        let mut state = self.write_lock.lock().await;
        self.backend.mark_closed();

        let previous = self.options();
        match self.install(new_driver).await {
            Ok(()) => {
                state.log = new_log;
                *self.options.write() = options;
                info!(filename = %self.backend.filename(), "character device changed");
                drop(state);
                self.backend.notify_changed();
                self.update_read_handler();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "new backend failed to open, restoring previous one");
                let restored = build_driver(&previous, tls)?;
                self.install(restored).await?;
                drop(state);
                self.update_read_handler();
                Err(e)
            }
        }
    }

    async fn install(&self, driver: Arc<dyn ChardevDriver>) -> Result<()> {
        self.backend.set_features(driver.features());
        match driver.open(Arc::clone(&self.backend)).await {
            Ok(opened) => {
                *self.driver.write() = driver;
                if opened {
                    self.backend.deliver_event(ChardevEvent::Opened);
                }
                Ok(())
            }
            Err(e) => {
                driver.close().await;
                Err(e)
            }
        }
    }

    /// Shut the transport down. Nothing scheduled by it runs afterwards.
    pub async fn close(&self) {
        self.driver().close().await;
        let _state = self.write_lock.lock().await;
        self.backend.mark_closed();
        debug!(chardev = %self.label(), "character device closed");
    }
}

impl std::fmt::Debug for Chardev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chardev")
            .field("backend", &self.backend)
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}
