//! Engine configuration.
//!
//! All keys are looked up with namespacing: `{name}.{key}` first, then the
//! bare `{key}`, then the hard-coded default. This lets a datagram binding and
//! a stream binding share one configuration source.

use crate::error::Error;
use ::config::{Config, ConfigError, Source};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
const DEFAULT_LISTENER_PORT: u16 = 25002;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_POLL_CAPACITY: usize = 256;

/// Keys the engine and the built-in protocols understand.
pub(crate) const KNOWN_KEYS: &[&str] = &[
    "transport_type",
    "buffersize",
    "retryinterval",
    "port",
    "listener_address",
    "poll_interval",
    "poll_capacity",
    "itemsharedconnections",
    "bindingsharedconnections",
    "directionssharedconnections",
    "addressmask",
    "protocol",
    // AsciiProtocol
    "timeout",
    "blocking",
    "preamble",
    "postamble",
    "updatewithresponse",
];

// ============================================================================
// Namespaced lookup
// ============================================================================

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        match getter(config, &format!("{name}.{key}")) {
            Err(ConfigError::NotFound(_)) => getter(config, key),
            other => other,
        }
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

/// Turns a missing key into `None` and keeps every other failure.
pub(crate) fn optional<T>(result: Result<T, ConfigError>) -> Result<Option<T>, Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

// Rejects keys nobody reads. Only scalar keys are checked at the root so
// that other namespaces can live in the same file.
fn check_known_keys(config: &Config, name: &str) -> Result<(), Error> {
    let table = if name.is_empty() {
        config.collect()?
    } else {
        match config.get_table(name) {
            Ok(table) => table,
            Err(ConfigError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    };

    for (key, value) in table {
        if KNOWN_KEYS.contains(&key.as_str()) {
            continue;
        }
        if name.is_empty() && value.into_table().is_ok() {
            continue;
        }
        return Err(Error::UnknownConfigKey(key));
    }
    Ok(())
}

// ============================================================================
// Sharing policy
// ============================================================================

/// Which channels may share one socket.
///
/// Binding-wide sharing implies item-wide sharing, direction sharing needs
/// both, and address masks cannot be combined with direction sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharingPolicy {
    /// Channels of the same item and direction share a socket per remote.
    pub item: bool,
    /// Channels of any item with the same direction share a socket per remote.
    pub binding: bool,
    /// Inbound and outbound channels share a socket per remote.
    pub directions: bool,
    /// Inbound remotes may use `*` for host and/or port.
    pub address_mask: bool,
}

impl Default for SharingPolicy {
    fn default() -> Self {
        Self {
            item: true,
            binding: true,
            directions: false,
            address_mask: true,
        }
    }
}

impl SharingPolicy {
    /// Checks the precedence constraints between the flags.
    pub fn validate(&self) -> Result<(), Error> {
        if self.binding && !self.item {
            return Err(Error::IncompatibleSharing(
                "bindingsharedconnections requires itemsharedconnections",
            ));
        }
        if self.directions && !(self.item && self.binding) {
            return Err(Error::IncompatibleSharing(
                "directionssharedconnections requires itemsharedconnections and bindingsharedconnections",
            ));
        }
        if self.directions && self.address_mask {
            return Err(Error::IncompatibleSharing(
                "directionssharedconnections cannot be combined with addressmask",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Kind of real socket the engine opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Datagram sockets (UDP).
    Udp,
    /// Stream sockets (TCP).
    Tcp,
}

impl TransportKind {
    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "udp" => Ok(Self::Udp),
            "tcp" => Ok(Self::Tcp),
            _ => Err(Error::InvalidTransportType {
                got: value.to_string(),
                valid: vec!["udp".to_string(), "tcp".to_string()],
            }),
        }
    }
}

/// Validated engine settings.
///
/// # Configuration Keys
///
/// - `transport_type`: "udp" (default) or "tcp"
/// - `buffersize`: read scratch buffer size in bytes (default 1024)
/// - `retryinterval`: seconds before a failed socket is recreated (default 5)
/// - `port`: Listener Socket port (default 25002, 0 picks a free port)
/// - `listener_address`: Listener Socket address (default 0.0.0.0)
/// - `poll_interval`: milliseconds between poll cycles (default 10)
/// - `poll_capacity`: readiness events per poll (default 256)
/// - `itemsharedconnections`, `bindingsharedconnections`,
///   `directionssharedconnections`, `addressmask`: see [`SharingPolicy`]
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub transport: TransportKind,
    pub buffer_size: usize,
    pub retry_interval: Duration,
    pub listener_address: IpAddr,
    pub port: u16,
    pub poll_interval: Duration,
    pub poll_capacity: usize,
    pub sharing: SharingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Udp,
            buffer_size: DEFAULT_BUFFER_SIZE,
            retry_interval: Duration::from_secs(DEFAULT_RETRY_INTERVAL_SECS),
            listener_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_LISTENER_PORT,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            poll_capacity: DEFAULT_POLL_CAPACITY,
            sharing: SharingPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Reads the engine settings from the root of `config`.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::new_named(config, "")
    }

    /// Reads the engine settings, preferring keys under `name`.
    pub fn new_named(config: &Config, name: &str) -> Result<Self, Error> {
        check_known_keys(config, name)?;

        let defaults = Self::default();

        let transport = match optional(get_namespaced_string(config, name, "transport_type"))? {
            Some(value) => TransportKind::parse(&value)?,
            None => defaults.transport,
        };

        let buffer_size = optional(get_namespaced_usize(config, name, "buffersize"))?
            .unwrap_or(defaults.buffer_size);
        if buffer_size == 0 {
            return Err(Error::InvalidConfigValue {
                key: "buffersize".to_string(),
                value: "0".to_string(),
            });
        }

        let retry_interval = optional(get_namespaced_u64(config, name, "retryinterval"))?
            .map(Duration::from_secs)
            .unwrap_or(defaults.retry_interval);

        let port = match optional(get_namespaced_u64(config, name, "port"))? {
            Some(value) => u16::try_from(value).map_err(|_| Error::InvalidConfigValue {
                key: "port".to_string(),
                value: value.to_string(),
            })?,
            None => defaults.port,
        };

        let listener_address =
            match optional(get_namespaced_string(config, name, "listener_address"))? {
                Some(value) => value.parse().map_err(|_| Error::InvalidConfigValue {
                    key: "listener_address".to_string(),
                    value,
                })?,
                None => defaults.listener_address,
            };

        let poll_interval = optional(get_namespaced_u64(config, name, "poll_interval"))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let poll_capacity = optional(get_namespaced_usize(config, name, "poll_capacity"))?
            .unwrap_or(defaults.poll_capacity)
            .max(1);

        let sharing = SharingPolicy {
            item: optional(get_namespaced_bool(config, name, "itemsharedconnections"))?
                .unwrap_or(defaults.sharing.item),
            binding: optional(get_namespaced_bool(config, name, "bindingsharedconnections"))?
                .unwrap_or(defaults.sharing.binding),
            directions: optional(get_namespaced_bool(
                config,
                name,
                "directionssharedconnections",
            ))?
            .unwrap_or(defaults.sharing.directions),
            address_mask: optional(get_namespaced_bool(config, name, "addressmask"))?
                .unwrap_or(defaults.sharing.address_mask),
        };
        sharing.validate()?;

        Ok(Self {
            transport,
            buffer_size,
            retry_interval,
            listener_address,
            port,
            poll_interval,
            poll_capacity,
            sharing,
        })
    }
}
