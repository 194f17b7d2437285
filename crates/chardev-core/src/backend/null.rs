//! Null backend: swallows output, never produces input.

use std::sync::Arc;

use async_trait::async_trait;

use super::{Backend, ChardevDriver, ChardevFeature, FeatureSet};
use crate::error::Result;

#[derive(Debug, Default)]
pub struct NullDriver;

impl NullDriver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChardevDriver for NullDriver {
    fn kind(&self) -> &'static str {
        "null"
    }

    fn features(&self) -> FeatureSet {
        FeatureSet::empty().with(ChardevFeature::ContextMutable)
    }

    async fn open(&self, _backend: Arc<Backend>) -> Result<bool> {
        Ok(false)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        Ok(buf.len())
    }
}
