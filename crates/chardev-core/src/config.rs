//! Configuration for character devices.
//!
//! A device is described by an option string such as
//! `socket,id=mon0,host=127.0.0.1,port=4444,server=on,telnet=on`. The first
//! element names the backend, the rest are `key=value` pairs (a bare key means
//! `key=on`, and `,,` escapes a literal comma). Every key must be recognised by
//! the selected backend.
//!
//! The bridge binary reads a YAML file listing such strings together with the
//! TLS credentials and authorization policies they refer to. That file is
//! validated before use.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::socket::SocketAddress;
use crate::telnet::TelnetMode;
use crate::tls::authz::PrincipalMapper;

/// Ring buffer size used when `size` is not given.
pub const DEFAULT_RINGBUF_SIZE: usize = 65536;

/// Parsed options for one character device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChardevOptions {
    /// Unique device label.
    pub id: String,
    /// Backend-specific options.
    pub backend: BackendOptions,
    /// File that receives a copy of every byte written to the device.
    pub logfile: Option<PathBuf>,
    /// Append to `logfile` instead of truncating it.
    pub logappend: bool,
}

/// Options for each supported backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendOptions {
    /// Discards writes, never produces input.
    Null,
    /// In-memory ring buffer (`ringbuf` and `memory`).
    RingBuf(RingBufOptions),
    /// Stream socket.
    Socket(SocketOptions),
}

impl BackendOptions {
    /// Backend name as written in option strings.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::RingBuf(_) => "ringbuf",
            Self::Socket(_) => "socket",
        }
    }
}

/// Ring buffer options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufOptions {
    /// Capacity in bytes, a power of two.
    pub size: usize,
}

/// Socket backend options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub address: SocketAddress,
    /// Listen for a peer instead of connecting out.
    pub server: bool,
    /// Block device creation until the first peer connects (server only).
    pub wait: bool,
    pub telnet: bool,
    pub tn3270: bool,
    pub websocket: bool,
    pub nodelay: bool,
    /// Retry interval after a failed or lost outbound connection.
    pub reconnect: Option<Duration>,
    pub tls_creds: Option<String>,
    pub tls_authz: Option<String>,
}

impl SocketOptions {
    /// Options for a plain socket at `address` with every flag off.
    #[must_use]
    pub fn new(address: SocketAddress) -> Self {
        Self {
            address,
            server: false,
            wait: false,
            telnet: false,
            tn3270: false,
            websocket: false,
            nodelay: false,
            reconnect: None,
            tls_creds: None,
            tls_authz: None,
        }
    }

    /// Telnet handling selected by the `telnet`/`tn3270` flags.
    #[must_use]
    pub fn telnet_mode(&self) -> Option<TelnetMode> {
        if self.tn3270 {
            Some(TelnetMode::Tn3270)
        } else if self.telnet {
            Some(TelnetMode::Telnet)
        } else {
            None
        }
    }

    /// Check option combinations.
    ///
    /// # Errors
    ///
    /// Returns an error for incompatible or incomplete combinations.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.reconnect.is_some() && self.server {
            return Err(ConfigError::Conflict {
                first: "reconnect",
                second: "server",
            });
        }
        if self.wait && !self.server {
            return Err(ConfigError::Requires {
                option: "wait",
                requires: "server",
            });
        }
        if self.websocket {
            if !self.server {
                return Err(ConfigError::Requires {
                    option: "websocket",
                    requires: "server",
                });
            }
            if self.telnet || self.tn3270 {
                return Err(ConfigError::Conflict {
                    first: "websocket",
                    second: "telnet",
                });
            }
        }
        if self.tls_creds.is_some() && !self.address.is_inet() {
            return Err(ConfigError::Conflict {
                first: "tls-creds",
                second: "path",
            });
        }
        if self.tls_authz.is_some() && self.tls_creds.is_none() {
            return Err(ConfigError::Requires {
                option: "tls-authz",
                requires: "tls-creds",
            });
        }
        Ok(())
    }
}

impl ChardevOptions {
    /// Parse an option string.
    ///
    /// # Examples
    ///
    /// ```
    /// use chardev_core::config::{BackendOptions, ChardevOptions};
    ///
    /// let opts = ChardevOptions::parse("socket,id=mon0,path=/tmp/mon.sock,server=on").unwrap();
    /// assert_eq!(opts.id, "mon0");
    /// assert!(matches!(opts.backend, BackendOptions::Socket(ref s) if s.server));
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is unknown, a required option is
    /// missing, a value does not parse, an option is not recognised, or the
    /// combination is invalid.
    pub fn parse(input: &str) -> ConfigResult<Self> {
        let mut list = OptionList::parse(input)?;
        let id = list
            .take("id")
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::MissingOption("id"))?;
        let logfile = list.take("logfile").map(PathBuf::from);
        let logappend = list.take_bool("logappend")?.unwrap_or(false);

        let backend = match list.backend.as_str() {
            "null" => BackendOptions::Null,
            "ringbuf" | "memory" => BackendOptions::RingBuf(parse_ringbuf(&mut list)?),
            "socket" => BackendOptions::Socket(parse_socket(&mut list)?),
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };
        list.finish()?;

        Ok(Self {
            id,
            backend,
            logfile,
            logappend,
        })
    }

    /// Translate a legacy filename (`tcp:host:port,server=on`,
    /// `telnet:...`, `tn3270:...`, `websocket:...`, `unix:path`, `null`,
    /// `ringbuf`, `memory`) into options for device `label`.
    ///
    /// # Errors
    ///
    /// Returns an error if the filename prefix is unknown or the resulting
    /// options are invalid.
    pub fn parse_compat(label: &str, filename: &str) -> ConfigResult<Self> {
        let (prefix, rest) = filename.split_once(':').unwrap_or((filename, ""));
        match prefix {
            "null" | "ringbuf" | "memory" if rest.is_empty() => {
                Self::parse(&format!("{prefix},id={label}"))
            }
            "tcp" => parse_inet_compat(label, rest, ""),
            "telnet" => parse_inet_compat(label, rest, ",telnet=on"),
            "tn3270" => parse_inet_compat(label, rest, ",tn3270=on"),
            "websocket" => parse_inet_compat(label, rest, ",websocket=on,server=on"),
            "unix" => {
                let (path, opts) = split_compat_opts(rest);
                Self::parse(&format!(
                    "socket,id={label},path={}{opts}",
                    path.replace(',', ",,")
                ))
            }
            _ => Err(ConfigError::UnknownBackend(filename.to_string())),
        }
    }
}

fn parse_ringbuf(list: &mut OptionList) -> ConfigResult<RingBufOptions> {
    let size = match list.take_u64("size")? {
        Some(size) => usize::try_from(size).map_err(|_| ConfigError::InvalidValue {
            option: "size".to_string(),
            value: size.to_string(),
            expected: "a power of two",
        })?,
        None => DEFAULT_RINGBUF_SIZE,
    };
    if !size.is_power_of_two() {
        return Err(ConfigError::InvalidValue {
            option: "size".to_string(),
            value: size.to_string(),
            expected: "a power of two",
        });
    }
    Ok(RingBufOptions { size })
}

fn parse_socket(list: &mut OptionList) -> ConfigResult<SocketOptions> {
    let host = list.take("host");
    let port = list.take("port");
    let path = list.take("path");
    let is_abstract = list.take_bool("abstract")?.unwrap_or(false);

    let address = match (host, path) {
        (Some(_), Some(_)) => {
            return Err(ConfigError::Conflict {
                first: "host",
                second: "path",
            })
        }
        (None, None) => return Err(ConfigError::MissingOption("host or path")),
        (Some(host), None) => {
            if is_abstract {
                return Err(ConfigError::Requires {
                    option: "abstract",
                    requires: "path",
                });
            }
            let port = port.ok_or(ConfigError::MissingOption("port"))?;
            let port = port.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                option: "port".to_string(),
                value: port.clone(),
                expected: "a port number",
            })?;
            let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            SocketAddress::Inet { host, port }
        }
        (None, Some(path)) => {
            if port.is_some() {
                return Err(ConfigError::Conflict {
                    first: "port",
                    second: "path",
                });
            }
            if is_abstract {
                SocketAddress::Abstract { name: path }
            } else {
                SocketAddress::Unix {
                    path: PathBuf::from(path),
                }
            }
        }
    };

    let reconnect = match list.take_u64("reconnect")? {
        Some(0) | None => None,
        Some(secs) => Some(Duration::from_secs(secs)),
    };

    let opts = SocketOptions {
        address,
        server: list.take_bool("server")?.unwrap_or(false),
        wait: list.take_bool("wait")?.unwrap_or(false),
        telnet: list.take_bool("telnet")?.unwrap_or(false),
        tn3270: list.take_bool("tn3270")?.unwrap_or(false),
        websocket: list.take_bool("websocket")?.unwrap_or(false),
        nodelay: list.take_bool("nodelay")?.unwrap_or(false),
        reconnect,
        tls_creds: list.take("tls-creds"),
        tls_authz: list.take("tls-authz"),
    };
    opts.validate()?;
    Ok(opts)
}

fn split_compat_opts(rest: &str) -> (&str, String) {
    match rest.split_once(',') {
        Some((addr, opts)) => (addr, format!(",{opts}")),
        None => (rest, String::new()),
    }
}

fn parse_inet_compat(label: &str, rest: &str, extra: &str) -> ConfigResult<ChardevOptions> {
    let (addr, opts) = split_compat_opts(rest);
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))?;
    let mut parsed = ChardevOptions::parse(&format!(
        "socket,id={label},host={host},port={port}{extra}{opts}"
    ))?;

    // `tcp::4444,server=on` means every interface; a bare client means loopback.
    if let BackendOptions::Socket(socket) = &mut parsed.backend {
        if let SocketAddress::Inet { host, .. } = &mut socket.address {
            if host.is_empty() {
                *host = if socket.server { "0.0.0.0" } else { "localhost" }.to_string();
            }
        }
    }
    Ok(parsed)
}

/// Backend name plus the `key=value` pairs not yet consumed.
struct OptionList {
    backend: String,
    entries: Vec<(String, String)>,
}

impl OptionList {
    fn parse(input: &str) -> ConfigResult<Self> {
        let mut parts = split_escaped(input).into_iter();
        let first = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingOption("backend"))?;
        let backend = match first.split_once('=') {
            Some(("backend", value)) => value.to_string(),
            Some(_) => return Err(ConfigError::MissingOption("backend")),
            None => first,
        };

        let entries = parts
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (part, "on".to_string()),
            })
            .collect();

        Ok(Self { backend, entries })
    }

    /// Remove `key`, returning its last value.
    fn take(&mut self, key: &str) -> Option<String> {
        let mut value = None;
        self.entries.retain(|(k, v)| {
            if k == key {
                value = Some(v.clone());
                false
            } else {
                true
            }
        });
        value
    }

    fn take_bool(&mut self, key: &str) -> ConfigResult<Option<bool>> {
        self.take(key).map(|v| parse_bool(key, &v)).transpose()
    }

    fn take_u64(&mut self, key: &str) -> ConfigResult<Option<u64>> {
        self.take(key)
            .map(|v| {
                v.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                    option: key.to_string(),
                    value: v.clone(),
                    expected: "a non-negative integer",
                })
            })
            .transpose()
    }

    fn finish(self) -> ConfigResult<()> {
        match self.entries.into_iter().next() {
            Some((option, _)) => Err(ConfigError::UnknownOption {
                backend: self.backend,
                option,
            }),
            None => Ok(()),
        }
    }
}

fn parse_bool(option: &str, value: &str) -> ConfigResult<bool> {
    match value {
        "on" | "yes" | "true" => Ok(true),
        "off" | "no" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            option: option.to_string(),
            value: value.to_string(),
            expected: "on or off",
        }),
    }
}

/// Split on commas, treating `,,` as a literal comma.
fn split_escaped(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ',' {
            if chars.peek() == Some(&',') {
                chars.next();
                current.push(',');
            } else {
                parts.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

/// Root configuration for the bridge binary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Device option strings, created in order.
    #[serde(default)]
    pub chardevs: Vec<String>,

    /// TLS credential sets by id.
    #[serde(default)]
    pub tls_creds: BTreeMap<String, TlsCredsConfig>,

    /// Authorization policies by id.
    #[serde(default)]
    pub authz: BTreeMap<String, AuthzConfig>,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which side of the handshake a credential set is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsEndpoint {
    Server,
    Client,
}

impl TlsEndpoint {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Client => "client",
        }
    }
}

/// X.509 credential set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsCredsConfig {
    pub endpoint: TlsEndpoint,

    /// Certificate chain (PEM). Required for servers, optional client cert
    /// for clients.
    pub cert_path: Option<PathBuf>,

    /// Private key (PEM) matching `cert_path`.
    pub key_path: Option<PathBuf>,

    /// CA used to verify the peer. Clients fall back to the webpki roots.
    pub ca_cert_path: Option<PathBuf>,

    /// Servers only: require a client certificate signed by `ca_cert_path`.
    #[serde(default)]
    pub verify_peer: bool,
}

/// Authorization policy matched against the peer certificate's subject.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthzConfig {
    /// Identities allowed to connect, after rule mapping.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Principal mapping rules (`RULE:pattern/replacement/[LU]`, `DEFAULT`).
    #[serde(default)]
    pub rules: Option<String>,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Replace `${VAR}` with the value of environment variable `VAR`, or nothing
/// if it is unset.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

impl BridgeConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse every device string, expanding `${VAR}` references first.
    ///
    /// # Errors
    ///
    /// Returns the first parse error.
    pub fn device_options(&self) -> ConfigResult<Vec<ChardevOptions>> {
        self.chardevs
            .iter()
            .map(|s| ChardevOptions::parse(&expand_env_vars(s)))
            .collect()
    }

    /// Validate device strings and their references to credentials and
    /// policies.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut ids = HashSet::new();
        for opts in self.device_options()? {
            if !ids.insert(opts.id.clone()) {
                return Err(ConfigError::DuplicateId(opts.id));
            }
            let BackendOptions::Socket(socket) = &opts.backend else {
                continue;
            };
            if let Some(creds_id) = &socket.tls_creds {
                let creds = self
                    .tls_creds
                    .get(creds_id)
                    .ok_or_else(|| ConfigError::UnknownTlsCreds(creds_id.clone()))?;
                let expected = if socket.server {
                    TlsEndpoint::Server
                } else {
                    TlsEndpoint::Client
                };
                if creds.endpoint != expected {
                    return Err(ConfigError::TlsEndpointMismatch {
                        id: creds_id.clone(),
                        expected: expected.as_str(),
                    });
                }
            }
            if let Some(authz_id) = &socket.tls_authz {
                if !self.authz.contains_key(authz_id) {
                    return Err(ConfigError::UnknownAuthz(authz_id.clone()));
                }
            }
        }

        for creds in self.tls_creds.values() {
            creds.validate()?;
        }
        for policy in self.authz.values() {
            if let Some(rules) = &policy.rules {
                PrincipalMapper::from_rules(rules)
                    .map_err(|e| ConfigError::InvalidRules(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl TlsCredsConfig {
    /// Check that the files a credential set needs are named.
    ///
    /// # Errors
    ///
    /// Returns an error if a server lacks its certificate or key, if only
    /// one of certificate and key is given, or if peer verification is
    /// requested without a CA.
    pub fn validate(&self) -> ConfigResult<()> {
        match (&self.cert_path, &self.key_path) {
            (Some(_), None) => return Err(ConfigError::MissingOption("key_path")),
            (None, Some(_)) => return Err(ConfigError::MissingOption("cert_path")),
            (None, None) if self.endpoint == TlsEndpoint::Server => {
                return Err(ConfigError::MissingOption("cert_path"))
            }
            _ => {}
        }
        if self.verify_peer && self.endpoint == TlsEndpoint::Server && self.ca_cert_path.is_none()
        {
            return Err(ConfigError::Requires {
                option: "verify_peer",
                requires: "ca_cert_path",
            });
        }
        Ok(())
    }
}
