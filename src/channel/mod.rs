//! Channels: logical bindings between an item command and a remote end.
//!
//! A [`Channel`] never owns a socket. The registry keeps the link from a
//! channel to the socket currently serving it, so that a reconnect can swap
//! the socket under every channel at once.

mod registry;
mod remote;

pub(crate) use registry::ChannelRegistry;
pub use registry::SocketId;
pub(crate) use remote::MatchTier;
pub use remote::{HostPattern, PortPattern, Remote};

use crate::error::Error;
use std::fmt;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Identifies a channel inside one engine.
pub type ChannelId = usize;

/// Command value that matches every command sent to an item.
pub const ANY_COMMAND: &str = "*";

/// Direction of a channel, seen from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Data arrives from the remote end.
    In,
    /// Data is sent to the remote end.
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

/// The (item, command, direction) triple a channel serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    pub item: String,
    pub command: String,
    pub direction: Direction,
}

impl Subject {
    pub fn new(item: impl Into<String>, command: impl Into<String>, direction: Direction) -> Self {
        Self {
            item: item.into(),
            command: command.into(),
            direction,
        }
    }

    /// Returns true if a command sent to the item should go through this subject.
    pub fn accepts(&self, command: &str) -> bool {
        self.command == ANY_COMMAND || self.command == command
    }
}

// Blocking call bookkeeping. `Queued` means the write has not left the
// queue yet, `Awaiting` that it was sent and the next read on the socket is
// the reply.
#[derive(Debug, Default)]
enum ResponseSlot {
    #[default]
    Idle,
    Queued { generation: u64, sender: Sender<Vec<u8>> },
    Awaiting { generation: u64, sender: Sender<Vec<u8>> },
}

#[derive(Debug, Default)]
struct ChannelState {
    response: ResponseSlot,
    generation: u64,
    reconnecting: bool,
    last_remote: Option<SocketAddr>,
}

/// Handle held by the caller of a blocking write while it waits.
#[derive(Debug)]
pub(crate) struct BlockingCall {
    pub(crate) generation: u64,
    pub(crate) receiver: Receiver<Vec<u8>>,
}

/// One logical binding of a [`Subject`] to a [`Remote`].
///
/// The mutable per-channel state sits behind its own lock so a caller
/// blocked on a response can be released without touching the registry.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    subject: Subject,
    remote: Remote,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, subject: Subject, remote: Remote) -> Self {
        Self {
            id,
            subject,
            remote,
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn item(&self) -> &str {
        &self.subject.item
    }

    pub fn command(&self) -> &str {
        &self.subject.command
    }

    pub fn direction(&self) -> Direction {
        self.subject.direction
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// True while a caller waits for a response on this channel.
    pub fn is_blocking(&self) -> bool {
        !matches!(self.state().response, ResponseSlot::Idle)
    }

    /// True while a reconnect is scheduled or running for the channel's socket.
    pub fn is_reconnecting(&self) -> bool {
        self.state().reconnecting
    }

    /// The sender of the most recent datagram routed to a masked channel.
    pub fn last_remote(&self) -> Option<SocketAddr> {
        self.state().last_remote
    }

    // A poisoned lock only means a callback panicked mid-update. The state
    // is a handful of flags that stay consistent, so keep going.
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================================================
    // Blocking emulation
    // ============================================================================

    pub(crate) fn begin_blocking(&self) -> Result<BlockingCall, Error> {
        let mut state = self.state();
        if !matches!(state.response, ResponseSlot::Idle) {
            return Err(Error::BlockingInProgress { id: self.id });
        }
        state.generation += 1;
        let generation = state.generation;
        let (sender, receiver) = channel();
        state.response = ResponseSlot::Queued { generation, sender };
        Ok(BlockingCall {
            generation,
            receiver,
        })
    }

    // Called once the blocking write of call `generation` has left the socket.
    // A write whose caller already gave up must not arm a newer call.
    pub(crate) fn mark_awaiting(&self, generation: u64) {
        let mut state = self.state();
        state.response = match std::mem::take(&mut state.response) {
            ResponseSlot::Queued {
                generation: current,
                sender,
            } if current == generation => ResponseSlot::Awaiting { generation, sender },
            other => other,
        };
    }

    pub(crate) fn is_awaiting(&self) -> bool {
        matches!(self.state().response, ResponseSlot::Awaiting { .. })
    }

    /// Hands `buffer` to the waiting caller. Returns false if nobody waits.
    pub(crate) fn fulfil(&self, buffer: &[u8]) -> bool {
        let mut state = self.state();
        match std::mem::take(&mut state.response) {
            ResponseSlot::Awaiting { sender, .. } => {
                if sender.send(buffer.to_vec()).is_err() {
                    debug!(id = self.id, "Blocking caller left before the response arrived");
                }
                true
            }
            other => {
                state.response = other;
                false
            }
        }
    }

    /// Clears the slot if it still belongs to the call `generation`.
    pub(crate) fn end_blocking(&self, generation: u64) {
        let mut state = self.state();
        let current = match &state.response {
            ResponseSlot::Idle => return,
            ResponseSlot::Queued { generation, .. } | ResponseSlot::Awaiting { generation, .. } => {
                *generation
            }
        };
        if current == generation {
            state.response = ResponseSlot::Idle;
        }
    }

    // Drops the response sender so the waiting caller returns empty-handed.
    pub(crate) fn cancel_blocking(&self) {
        let mut state = self.state();
        if !matches!(state.response, ResponseSlot::Idle) {
            warn!(id = self.id, "Abandoning blocking call");
            state.response = ResponseSlot::Idle;
        }
    }

    pub(crate) fn set_reconnecting(&self, reconnecting: bool) {
        self.state().reconnecting = reconnecting;
    }

    pub(crate) fn set_last_remote(&self, sender: SocketAddr) {
        self.state().last_remote = Some(sender);
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}/{} {} {}]",
            self.id, self.subject.item, self.subject.command, self.subject.direction, self.remote
        )
    }
}
