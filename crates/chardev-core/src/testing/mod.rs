//! Test utilities for character devices.
//!
//! - [`RecordingFrontEnd`] - A front-end that records everything it receives
//!
//! # Example
//!
//! ```rust,ignore
//! use chardev_core::testing::RecordingFrontEnd;
//!
//! let fe = RecordingFrontEnd::new(4096);
//! let mut handle = CharBackend::attach(chr)?;
//! handle.set_handlers(fe.clone(), None)?;
//! assert!(fe.wait_for_data(b"hello", Duration::from_secs(1)).await);
//! ```

pub mod front_end;

pub use front_end::RecordingFrontEnd;
