use thiserror::Error;

/// The error type for netbind operations.
///
/// Socket faults that happen while the engine is running are not reported
/// through this type. They are handled by scheduling a reconnect and only
/// show up in the logs. Errors returned to the caller are configuration
/// problems, invalid channel definitions, or failures to set up the
/// multiplexer itself.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // I/O and Networking Errors
    // ============================================================================

    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote address could not be parsed or resolved.
    #[error("Invalid remote address '{0}'")]
    InvalidAddress(String),

    /// The engine has not been activated, or was deactivated.
    #[error("Engine is not active")]
    NotActive,

    // ============================================================================
    // Channel Errors
    // ============================================================================

    /// Outbound channels must name a concrete remote end.
    #[error("Outbound channel for item '{item}' cannot use address mask {mask}")]
    MaskedOutboundChannel { item: String, mask: String },

    /// Address masks are switched off by the `addressmask` key.
    #[error("Inbound channel for item '{item}' uses address mask {mask}, but addressmask is disabled")]
    AddressMaskDisabled { item: String, mask: String },

    /// The channel is not (or no longer) known to the registry.
    #[error("Channel {id} not found")]
    ChannelNotFound {
        /// The channel id that was not found.
        id: usize,
    },

    /// A blocking write is already waiting for a response on this channel.
    ///
    /// Only one in-flight blocking call per channel can be represented.
    #[error("Channel {id} already has a blocking write in progress")]
    BlockingInProgress {
        /// The channel id with the outstanding call.
        id: usize,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================

    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A configuration key is not recognized.
    #[error("Unknown configuration key '{0}'")]
    UnknownConfigKey(String),

    /// A configuration key holds a value of the wrong shape.
    #[error("Invalid value '{value}' for configuration key '{key}'")]
    InvalidConfigValue { key: String, value: String },

    /// The sharing flags contradict each other.
    #[error("Incompatible sharing policy: {0}")]
    IncompatibleSharing(&'static str),

    /// Invalid value for `transport_type` configuration key.
    ///
    /// Must be one of: "udp" or "tcp".
    #[error("Invalid transport type '{got}', expected one of: {}", .valid.join(", "))]
    InvalidTransportType { got: String, valid: Vec<String> },

    // ============================================================================
    // Protocol Errors
    // ============================================================================

    /// No protocol factory is registered under this name.
    #[error("Unknown protocol '{0}'")]
    UnknownProtocol(String),
}
