//! Device registry.
//!
//! Owns every open [`Chardev`] by label. Front-ends borrow devices through
//! [`find`](ChardevRegistry::find) and attach with
//! [`CharBackend::attach`](crate::backend::CharBackend::attach).

use std::os::fd::OwnedFd;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::backend::Chardev;
use crate::config::ChardevOptions;
use crate::error::{ChardevError, Result};
use crate::metrics::ChardevMetrics;
use crate::tls::TlsObjects;

/// Open devices indexed by label.
pub struct ChardevRegistry {
    devices: DashMap<String, Arc<Chardev>>,
    tls: Arc<TlsObjects>,
    metrics: Arc<ChardevMetrics>,
    context: Handle,
}

impl ChardevRegistry {
    /// Create an empty registry. New devices run on `context`.
    #[must_use]
    pub fn new(tls: TlsObjects, metrics: Arc<ChardevMetrics>, context: Handle) -> Self {
        Self {
            devices: DashMap::new(),
            tls: Arc::new(tls),
            metrics,
            context,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ChardevMetrics> {
        &self.metrics
    }

    /// Open a device and register it under its id.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::Duplicate`] if the id is taken, or whatever
    /// opening the device fails with.
    pub async fn create(&self, options: ChardevOptions) -> Result<Arc<Chardev>> {
        let label = options.id.clone();
        if self.devices.contains_key(&label) {
            return Err(ChardevError::Duplicate(label));
        }

        let chr = Chardev::open(
            options,
            &self.tls,
            Arc::clone(&self.metrics),
            self.context.clone(),
        )
        .await?;

        // Another create for the same id may have finished while we opened.
        let inserted = match self.devices.entry(label.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&chr));
                true
            }
        };
        if !inserted {
            chr.close().await;
            return Err(ChardevError::Duplicate(label));
        }
        info!(chardev = %label, kind = chr.kind(), "registered character device");
        Ok(chr)
    }

    /// Parse `backend,key=value,...` and create the device.
    ///
    /// # Errors
    ///
    /// Returns an error if the string does not parse or the device fails
    /// to open.
    pub async fn create_from_str(&self, options: &str) -> Result<Arc<Chardev>> {
        self.create(ChardevOptions::parse(options)?).await
    }

    /// Create a device from a legacy filename such as `tcp:host:port,server`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filename is not understood or the device fails
    /// to open.
    pub async fn create_compat(&self, label: &str, filename: &str) -> Result<Arc<Chardev>> {
        self.create(ChardevOptions::parse_compat(label, filename)?).await
    }

    #[must_use]
    pub fn find(&self, label: &str) -> Option<Arc<Chardev>> {
        self.devices.get(label).map(|entry| Arc::clone(entry.value()))
    }

    fn get(&self, label: &str) -> Result<Arc<Chardev>> {
        self.find(label)
            .ok_or_else(|| ChardevError::NotFound(label.to_string()))
    }

    /// Reconfigure the device named by `options.id` in place.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::NotFound`] for an unknown id, or the error
    /// from [`Chardev::change`].
    pub async fn change(&self, options: ChardevOptions) -> Result<()> {
        let chr = self.get(&options.id)?;
        chr.change(options, &self.tls).await
    }

    /// Hand an already connected socket to a device.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::NotFound`] for an unknown label, or the
    /// device's refusal.
    pub async fn add_client(&self, label: &str, fd: OwnedFd) -> Result<()> {
        self.get(label)?.add_client(fd).await
    }

    /// Close and unregister a device.
    ///
    /// # Errors
    ///
    /// Returns [`ChardevError::InUse`] while a front-end is attached.
    pub async fn remove(&self, label: &str) -> Result<()> {
        let chr = self.get(label)?;
        if chr.backend().is_attached() {
            return Err(ChardevError::InUse(label.to_string()));
        }
        self.devices.remove(label);
        chr.close().await;
        debug!(chardev = %label, "removed character device");
        Ok(())
    }

    /// Labels of all registered devices, sorted.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        labels.sort();
        labels
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Run every device's post-wiring hook.
    ///
    /// # Errors
    ///
    /// Returns the first failure; later devices are still visited.
    pub fn machine_done(&self) -> Result<()> {
        let mut first = None;
        for entry in &self.devices {
            if let Err(e) = entry.value().machine_done() {
                warn!(chardev = %entry.key(), error = %e, "machine_done hook failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Close every device, attached or not.
    pub async fn cleanup(&self) {
        let labels = self.labels();
        for label in labels {
            if let Some((_, chr)) = self.devices.remove(&label) {
                chr.close().await;
            }
        }
        info!("all character devices closed");
    }
}
