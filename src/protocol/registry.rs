use super::{AsciiProtocol, ChannelProtocol, EventPublisher};
use crate::config::get_namespaced_string;
use crate::error::Error;
use ::config::{Config, ConfigError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Type alias for protocol factory functions.
///
/// A `ProtocolFactory` builds a protocol from the configuration, the engine
/// name used for key namespacing, and the publisher state updates go to.
///
/// # Function Signature
///
/// ```text
/// fn(&Config, &str, Arc<dyn EventPublisher>) -> Result<Arc<dyn ChannelProtocol>, Error>
/// ```
pub type ProtocolFactory =
    fn(&Config, &str, Arc<dyn EventPublisher>) -> Result<Arc<dyn ChannelProtocol>, Error>;

/// Protocol registry for building protocols by name.
///
/// Hosts register every protocol they ship at startup and then pick one by
/// the `protocol` configuration key.
///
/// # Usage
///
/// ```no_run
/// use netbind::prelude::*;
/// use std::sync::Arc;
///
/// struct Log;
/// impl EventPublisher for Log {
///     fn post_update(&self, item: &str, state: &str) {
///         println!("{item} -> {state}");
///     }
/// }
///
/// let config = config::Config::default();
/// let registry = ProtocolRegistry::with_builtin();
/// let protocol = registry.create("ascii", &config, "", Arc::new(Log)).unwrap();
/// let engine = Engine::new(&config, protocol).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    factories: HashMap<String, ProtocolFactory>,
}

impl ProtocolRegistry {
    /// Creates a new empty protocol registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry with the protocols that ship with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(AsciiProtocol::NAME, AsciiProtocol::create);
        registry
    }

    /// Registers a factory under `name`, replacing any previous one.
    pub fn register(&mut self, name: &str, factory: ProtocolFactory) -> &mut Self {
        debug!(name, "Registering protocol factory");
        self.factories.insert(name.to_string(), factory);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the protocol registered under `name`.
    pub fn create(
        &self,
        name: &str,
        config: &Config,
        engine_name: &str,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Arc<dyn ChannelProtocol>, Error> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::UnknownProtocol(name.to_string()))?;
        factory(config, engine_name, publisher)
    }

    /// Builds the protocol named by the `protocol` key, `ascii` if unset.
    pub fn create_configured(
        &self,
        config: &Config,
        engine_name: &str,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Arc<dyn ChannelProtocol>, Error> {
        let name = match get_namespaced_string(config, engine_name, "protocol") {
            Ok(name) => name,
            Err(ConfigError::NotFound(_)) => AsciiProtocol::NAME.to_string(),
            Err(err) => return Err(err.into()),
        };
        self.create(&name, config, engine_name, publisher)
    }
}
