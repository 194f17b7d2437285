//! Character Device Backend Core Library
//!
//! A character device is a byte-stream endpoint with a single front-end
//! consumer. This library provides the device abstraction and its backends,
//! most importantly a socket backend that listens or connects over TCP or
//! unix sockets, with optional TLS, websocket and telnet layers on top.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`backend`] - Device abstraction, driver contract and simple backends
//! - [`socket`] - Socket backend and its connection state machine
//! - [`telnet`] - Telnet/tn3270 negotiation codec
//! - [`tls`] - TLS credentials and peer authorization
//! - [`fdpass`] - Ancillary file-descriptor buffers
//! - [`reconnect`] - Retry timer with de-duplicated error reporting
//! - [`registry`] - Devices indexed by label
//! - [`config`] - Option strings and YAML configuration
//! - [`error`] - Domain-specific error types
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use chardev_core::{ChardevRegistry, CharBackend, TlsObjects, ChardevMetrics};
//!
//! let registry = ChardevRegistry::new(TlsObjects::new(), metrics, Handle::current());
//! let chr = registry
//!     .create_from_str("socket,id=mon0,host=127.0.0.1,port=4444,server=on,telnet=on")
//!     .await?;
//! let mut fe = CharBackend::attach(chr)?;
//! fe.set_handlers(my_front_end, None)?;
//! fe.write(b"hello\r\n", true).await?;
//! ```

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;
pub mod fdpass;
pub mod metrics;
pub mod reconnect;
pub mod registry;
pub mod socket;
pub mod telnet;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use backend::{
    Backend, CharBackend, Chardev, ChardevDriver, ChardevEvent, ChardevFeature, ConnectionPhase,
    ConnectionStatus, FrontEnd,
};
pub use config::{BackendOptions, BridgeConfig, ChardevOptions, SocketOptions};
pub use error::{ChardevError, ConfigError, Result, TlsError};
pub use metrics::ChardevMetrics;
pub use registry::ChardevRegistry;
pub use socket::{SocketAddress, SocketChardev};
pub use tls::TlsObjects;
