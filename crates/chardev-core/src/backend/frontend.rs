//! Front-end side of a character device.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

use super::{Chardev, ChardevEvent, ChardevIoctl, IoctlReply};
use crate::error::Result;

/// Callbacks a consumer registers on a device.
///
/// All methods run on the device's runtime context and must not block.
pub trait FrontEnd: Send + Sync {
    /// How many bytes the front-end can take now. Zero pauses input.
    fn can_receive(&self) -> usize;

    fn receive(&self, buf: &[u8]);

    fn event(&self, event: ChardevEvent);

    /// The transport behind the device was replaced in place.
    fn backend_changed(&self) {}
}

/// A front-end's attachment to one device.
///
/// At most one handle exists per device. Dropping it detaches the
/// front-end.
pub struct CharBackend {
    chr: Arc<Chardev>,
    handlers: Option<Arc<dyn FrontEnd>>,
}

impl CharBackend {
    /// Attach to `chr`.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::InUse`](crate::error::ChardevError::InUse) if
    /// another front-end is attached.
    pub fn attach(chr: Arc<Chardev>) -> Result<Self> {
        chr.backend().try_attach()?;
        debug!(chardev = %chr.label(), "front-end attached");
        Ok(Self {
            chr,
            handlers: None,
        })
    }

    #[must_use]
    pub fn chardev(&self) -> &Arc<Chardev> {
        &self.chr
    }

    /// Install (or replace) the callbacks, optionally moving the device to
    /// another runtime context. An already open backend delivers
    /// [`ChardevEvent::Opened`] to the new callbacks at once.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::ContextImmutable`](crate::error::ChardevError::ContextImmutable)
    /// if a context is given and the device cannot move.
    pub fn set_handlers(
        &mut self,
        handlers: Arc<dyn FrontEnd>,
        context: Option<Handle>,
    ) -> Result<()> {
        self.chr.update_read_handlers(context)?;
        let backend = self.chr.backend();
        backend.set_front_end(Some(Arc::downgrade(&handlers)));
        self.handlers = Some(handlers);
        if backend.is_open() {
            backend.deliver_event(ChardevEvent::Opened);
        }
        self.chr.update_read_handler();
        Ok(())
    }

    /// Remove the callbacks but stay attached.
    pub fn clear_handlers(&mut self) {
        self.chr.backend().set_front_end(None);
        self.handlers = None;
        self.chr.update_read_handler();
    }

    /// Write to the device. See [`Chardev::write`].
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn write(&self, buf: &[u8], full: bool) -> Result<usize> {
        self.chr.write(buf, full).await
    }

    /// # Errors
    ///
    /// Fails on timeout or if the device stopped trying.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> Result<()> {
        self.chr.wait_connected(timeout).await
    }

    /// Take up to `max` received descriptors.
    #[must_use]
    pub fn get_msgfds(&self, max: usize) -> Vec<OwnedFd> {
        self.chr.get_msgfds(max)
    }

    /// # Errors
    ///
    /// Fails if the transport cannot pass descriptors or too many are given.
    pub fn set_msgfds(&self, fds: Vec<OwnedFd>) -> Result<()> {
        self.chr.set_msgfds(fds)
    }

    /// # Errors
    ///
    /// Returns `Unsupported` for transports without device controls.
    pub fn ioctl(&self, cmd: ChardevIoctl) -> Result<IoctlReply> {
        self.chr.ioctl(cmd)
    }

    /// Resume input after the front-end made room.
    pub fn accept_input(&self) {
        self.chr.accept_input();
    }

    pub fn set_echo(&self, echo: bool) {
        self.chr.set_echo(echo);
    }

    /// Tell the backend whether the front-end is open for I/O.
    pub fn set_open(&self, open: bool) {
        self.chr.set_fe_open(open);
    }

    pub fn disconnect(&self) {
        self.chr.disconnect();
    }
}

impl Drop for CharBackend {
    fn drop(&mut self) {
        if self.chr.backend().is_fe_open() {
            self.chr.set_fe_open(false);
        }
        self.chr.backend().detach();
        self.chr.update_read_handler();
        debug!(chardev = %self.chr.label(), "front-end detached");
    }
}
