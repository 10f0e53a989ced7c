//! Protocol hooks between the engine and a device binding.
//!
//! The engine only moves opaque byte buffers. A [`ChannelProtocol`] decides
//! what a command looks like on the wire and what an inbound buffer means.

mod ascii;
mod registry;

pub use ascii::AsciiProtocol;
pub use registry::{ProtocolFactory, ProtocolRegistry};

use crate::channel::Channel;
use crate::engine::Engine;
use std::sync::Arc;

/// Callbacks a binding implements to speak its wire protocol over channels.
///
/// The engine calls these with none of its locks held, so implementations may
/// call [`Engine::write_buffer`] and any other engine method. Callbacks run on
/// the ticker thread except [`ChannelProtocol::receive_channeled_command`],
/// which runs on the thread that called [`Engine::receive_command`]. A
/// blocking write from the ticker thread cannot see its reply and times out.
pub trait ChannelProtocol: Send + Sync {
    /// The socket serving `channel` became active.
    fn configure_channel(&self, engine: &Engine, channel: &Arc<Channel>) {
        let _ = (engine, channel);
    }

    /// A buffer arrived for `channel`.
    fn parse_buffer(&self, engine: &Engine, channel: &Arc<Channel>, buffer: &[u8]);

    /// Turns `command` into writes on `channel`.
    ///
    /// Returns true if the host should also publish the command as the new
    /// item state.
    fn receive_channeled_command(&self, engine: &Engine, channel: &Arc<Channel>, command: &str) -> bool;
}

/// Where protocols publish item state changes.
pub trait EventPublisher: Send + Sync {
    fn post_update(&self, item: &str, state: &str);
}
