//! Ring buffer backend (`ringbuf`, `memory`).
//!
//! Output is kept in a fixed-size buffer; once full, the oldest bytes are
//! overwritten. The contents are read back with `sync_read`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Backend, ChardevDriver, ChardevFeature, FeatureSet};
use crate::error::{ConfigError, Result};

#[derive(Debug)]
struct Ring {
    buf: Box<[u8]>,
    /// Total bytes ever written.
    prod: usize,
    /// Total bytes ever read, or skipped by overwrite.
    cons: usize,
}

impl Ring {
    fn mask(&self) -> usize {
        self.buf.len() - 1
    }

    fn count(&self) -> usize {
        self.prod.wrapping_sub(self.cons)
    }
}

#[derive(Debug)]
pub struct RingBufDriver {
    ring: Mutex<Ring>,
}

impl RingBufDriver {
    /// Create a buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error unless `size` is a non-zero power of two.
    pub fn new(size: usize) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(ConfigError::InvalidValue {
                option: "size".to_string(),
                value: size.to_string(),
                expected: "a power of two",
            }
            .into());
        }
        Ok(Self {
            ring: Mutex::new(Ring {
                buf: vec![0; size].into_boxed_slice(),
                prod: 0,
                cons: 0,
            }),
        })
    }

    /// Bytes currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ring.lock().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChardevDriver for RingBufDriver {
    fn kind(&self) -> &'static str {
        "ringbuf"
    }

    fn features(&self) -> FeatureSet {
        FeatureSet::empty().with(ChardevFeature::ContextMutable)
    }

    async fn open(&self, _backend: Arc<Backend>) -> Result<bool> {
        Ok(true)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut ring = self.ring.lock();
        let size = ring.buf.len();
        let mask = ring.mask();
        for &b in buf {
            let idx = ring.prod & mask;
            ring.buf[idx] = b;
            ring.prod = ring.prod.wrapping_add(1);
            if ring.count() > size {
                ring.cons = ring.prod.wrapping_sub(size);
            }
        }
        Ok(buf.len())
    }

    fn sync_read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut ring = self.ring.lock();
        let mask = ring.mask();
        let n = buf.len().min(ring.count());
        for slot in buf.iter_mut().take(n) {
            *slot = ring.buf[ring.cons & mask];
            ring.cons = ring.cons.wrapping_add(1);
        }
        Ok(n)
    }
}
