//! netbind - A multiplexed network-channel engine for device bindings
//!
//! netbind services many logical channels, each binding an item command to a
//! remote endpoint, over a small number of non-blocking sockets. It handles
//! socket sharing between channels, address-mask routing of inbound datagrams,
//! queued writes with emulated request/response, and automatic reconnects.
//! What goes over the wire is left to a [`ChannelProtocol`].

// Internal-only modules
pub(crate) mod channel;
pub(crate) mod config;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod protocol;

// These are the intended public API
pub use crate::channel::{
    Channel, ChannelId, Direction, HostPattern, PortPattern, Remote, SocketId, Subject,
    ANY_COMMAND,
};
pub use crate::config::{EngineConfig, SharingPolicy, TransportKind};
pub use crate::engine::{CommandOutcome, Engine};
pub use crate::error::Error;
pub use crate::protocol::{
    AsciiProtocol, ChannelProtocol, EventPublisher, ProtocolFactory, ProtocolRegistry,
};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::channel::{Channel, Direction, Remote, Subject, ANY_COMMAND};
    pub use crate::config::{EngineConfig, SharingPolicy, TransportKind};
    pub use crate::engine::{CommandOutcome, Engine};
    pub use crate::error::Error;
    pub use crate::protocol::{
        AsciiProtocol, ChannelProtocol, EventPublisher, ProtocolFactory, ProtocolRegistry,
    };
}
