//! Ancillary file-descriptor buffers.
//!
//! Descriptors received alongside socket data queue in [`InboundFds`] until
//! the front-end drains them. Descriptors the front-end wants to send are
//! staged in [`OutboundFds`] and go out with the next write, after which the
//! stage is cleared whether or not the write succeeded.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use tracing::{debug, warn};

use crate::error::{ChardevError, Result};

/// Most descriptors held in either direction.
pub const MAX_FDS: usize = 16;

/// Descriptors received from the peer, in arrival order.
#[derive(Debug, Default)]
pub struct InboundFds {
    fds: VecDeque<OwnedFd>,
}

impl InboundFds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue descriptors that arrived with a read.
    ///
    /// Once the buffer is full the newest descriptors are closed and
    /// dropped. Returns how many were rejected.
    pub fn append(&mut self, fds: impl IntoIterator<Item = OwnedFd>) -> usize {
        let mut rejected = 0;
        for fd in fds {
            if self.fds.len() >= MAX_FDS {
                rejected += 1;
                continue;
            }
            self.fds.push_back(fd);
        }
        if rejected > 0 {
            warn!(rejected, held = self.fds.len(), "inbound descriptor buffer full");
        }
        rejected
    }

    /// Take up to `max` descriptors, oldest first.
    pub fn drain(&mut self, max: usize) -> Vec<OwnedFd> {
        let n = max.min(self.fds.len());
        self.fds.drain(..n).collect()
    }

    /// Close every queued descriptor.
    pub fn clear(&mut self) {
        if !self.fds.is_empty() {
            debug!(count = self.fds.len(), "closing unclaimed descriptors");
        }
        self.fds.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

/// Descriptors waiting for the next write.
#[derive(Debug, Default)]
pub struct OutboundFds {
    staged: Vec<OwnedFd>,
}

impl OutboundFds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stage with `fds`. An empty vector clears it.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::FdLimit`] if more than [`MAX_FDS`] are given;
    /// the previous stage is left untouched.
    pub fn stage(&mut self, fds: Vec<OwnedFd>) -> Result<()> {
        if fds.len() > MAX_FDS {
            return Err(ChardevError::FdLimit {
                requested: fds.len(),
                max: MAX_FDS,
            });
        }
        self.staged = fds;
        Ok(())
    }

    /// Raw values of the staged descriptors, for building a control message.
    #[must_use]
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.staged.iter().map(AsRawFd::as_raw_fd).collect()
    }

    /// Remove the stage after a write attempt. Dropping the result closes
    /// the local copies.
    pub fn take(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.staged)
    }

    /// Put back descriptors from a write that sent nothing, unless new ones
    /// were staged meanwhile.
    pub fn restore(&mut self, fds: Vec<OwnedFd>) {
        if self.staged.is_empty() {
            self.staged = fds;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}
