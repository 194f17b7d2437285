//! Domain error types for character-device backends.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.
//! Construction-time problems surface as [`ConfigError`]; everything that can
//! go wrong on a live device is a [`ChardevError`].

use std::time::Duration;

use thiserror::Error;

use crate::tls::authz::AuthzError;

/// Errors related to option parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required option was not supplied.
    #[error("missing required option '{0}'")]
    MissingOption(&'static str),

    /// The option string names a backend that does not exist.
    #[error("unknown chardev backend '{0}'")]
    UnknownBackend(String),

    /// The option is not recognised by the selected backend.
    #[error("invalid parameter '{option}' for chardev backend '{backend}'")]
    UnknownOption { backend: String, option: String },

    /// The option value could not be parsed.
    #[error("invalid value '{value}' for option '{option}' (expected {expected})")]
    InvalidValue {
        option: String,
        value: String,
        expected: &'static str,
    },

    /// Two options cannot be combined.
    #[error("'{first}' option is incompatible with '{second}'")]
    Conflict {
        first: &'static str,
        second: &'static str,
    },

    /// An option only makes sense together with another one.
    #[error("'{option}' option requires '{requires}'")]
    Requires {
        option: &'static str,
        requires: &'static str,
    },

    /// Two devices share one id.
    #[error("duplicate chardev id '{0}'")]
    DuplicateId(String),

    /// Invalid address format.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// `tls-creds` refers to credentials that were never defined.
    #[error("TLS credentials '{0}' not found")]
    UnknownTlsCreds(String),

    /// `tls-authz` refers to a policy that was never defined.
    #[error("authorization policy '{0}' not found")]
    UnknownAuthz(String),

    /// The credentials are for the wrong side of the handshake.
    #[error("TLS credentials '{id}' must have a {expected} endpoint")]
    TlsEndpointMismatch { id: String, expected: &'static str },

    /// Invalid principal mapping rules in an authorization policy.
    #[error("invalid authorization rules: {0}")]
    InvalidRules(String),

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

/// Errors from loading TLS material or running a handshake.
#[derive(Error, Debug)]
pub enum TlsError {
    /// The TLS configuration could not be assembled.
    #[error("TLS configuration error: {0}")]
    Config(String),

    /// A certificate file could not be read.
    #[error("failed to load certificate '{path}': {message}")]
    CertificateLoad { path: String, message: String },

    /// A private key file could not be read.
    #[error("failed to load private key '{path}': {message}")]
    PrivateKeyLoad { path: String, message: String },

    /// The certificate file contained no usable certificates.
    #[error("no certificates found in '{0}'")]
    NoCertificates(String),

    /// The key file contained no usable private key.
    #[error("no private key found in '{0}'")]
    NoPrivateKeys(String),

    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),
}

/// Errors raised by a character device at runtime.
#[derive(Error, Debug)]
pub enum ChardevError {
    /// Invalid or incomplete configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Underlying transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport could not be connected.
    #[error("unable to connect character device {label}: {message}")]
    Connect { label: String, message: String },

    /// TLS setup or handshake failure.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// The peer's identity was rejected.
    #[error(transparent)]
    Authorization(#[from] AuthzError),

    /// The websocket upgrade handshake failed.
    #[error("websocket handshake failed: {0}")]
    WebSocket(String),

    /// Operation needs an established connection.
    #[error("character device {0} is not connected")]
    NotConnected(String),

    /// `wait_until_connected` ran out of time.
    #[error("timed out after {timeout:?} waiting for character device {label}")]
    Timeout { label: String, timeout: Duration },

    /// The backend does not implement this operation.
    #[error("operation '{0}' is not supported by this backend")]
    Unsupported(&'static str),

    /// A front-end is already attached, or a client is already connected.
    #[error("character device {0} is busy")]
    InUse(String),

    /// No device with this label exists.
    #[error("character device '{0}' not found")]
    NotFound(String),

    /// A device with this label already exists.
    #[error("character device '{0}' already exists")]
    Duplicate(String),

    /// The device's runtime context cannot be changed.
    #[error("character device {0} cannot change its runtime context")]
    ContextImmutable(String),

    /// Too many descriptors staged for one message.
    #[error("too many file descriptors: {requested} (max {max})")]
    FdLimit { requested: usize, max: usize },

    /// Hot-swapping this device is not allowed.
    #[error("character device {0} cannot be changed in place: {1}")]
    ChangeRefused(String, &'static str),

    /// Device is being torn down.
    #[error("character device shutting down")]
    Shutdown,
}

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, ChardevError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for TLS operations.
pub type TlsResult<T> = std::result::Result<T, TlsError>;
