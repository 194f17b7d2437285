//! A recording front-end for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{ChardevEvent, FrontEnd};

/// Front-end that stores received bytes and events.
///
/// The advertised capacity is fixed until changed with
/// [`set_capacity`](Self::set_capacity).
#[derive(Debug, Default)]
pub struct RecordingFrontEnd {
    capacity: AtomicUsize,
    data: Mutex<Vec<u8>>,
    events: Mutex<Vec<ChardevEvent>>,
    changes: AtomicUsize,
    notify: Notify,
}

impl RecordingFrontEnd {
    #[must_use]
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: AtomicUsize::new(capacity),
            ..Self::default()
        })
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }

    /// Everything received so far.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Received bytes, clearing the record.
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut *self.data.lock())
    }

    #[must_use]
    pub fn events(&self) -> Vec<ChardevEvent> {
        self.events.lock().clone()
    }

    /// How many times `event` was delivered.
    #[must_use]
    pub fn count(&self, event: ChardevEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    /// Calls to [`FrontEnd::backend_changed`].
    #[must_use]
    pub fn changes(&self) -> usize {
        self.changes.load(Ordering::Acquire)
    }

    /// Wait until the received bytes equal `expected`.
    pub async fn wait_for_data(&self, expected: &[u8], timeout: Duration) -> bool {
        self.wait_until(timeout, || self.data.lock().as_slice() == expected)
            .await
    }

    /// Wait until `event` has been delivered at least `times` times.
    pub async fn wait_for_event(&self, event: ChardevEvent, times: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.count(event) >= times).await
    }

    async fn wait_until(&self, timeout: Duration, cond: impl Fn() -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if cond() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

impl FrontEnd for RecordingFrontEnd {
    fn can_receive(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    fn receive(&self, buf: &[u8]) {
        self.data.lock().extend_from_slice(buf);
        self.notify.notify_waiters();
    }

    fn event(&self, event: ChardevEvent) {
        self.events.lock().push(event);
        self.notify.notify_waiters();
    }

    fn backend_changed(&self) {
        self.changes.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}
