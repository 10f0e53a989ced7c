//! The multiplexer: mio poll, sockets and the channel registry under one lock.

use super::reconnect::ReconnectSupervisor;
use super::socket::{Socket, SocketIo, SocketRole, SocketState};
use super::write_queue::WriteQueue;
use crate::channel::{Channel, ChannelId, ChannelRegistry, Direction, SocketId};
use crate::config::EngineConfig;
use crate::error::Error;
use mio::{Interest, Poll};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

// Socket ids double as mio tokens.
const SOCKET_ID_RANGE_START: usize = 1000;

/// Everything guarded by the engine's main lock.
#[derive(Debug)]
pub(crate) struct Multiplexer {
    pub(crate) poll: Option<Poll>,
    pub(crate) sockets: HashMap<SocketId, Socket>,
    pub(crate) registry: ChannelRegistry,
    pub(crate) supervisor: ReconnectSupervisor,
    pub(crate) listener_id: Option<SocketId>,
    pub(crate) next_id: SocketId,
    pub(crate) config: EngineConfig,
    pub(crate) scratch: Vec<u8>,
    /// Channels whose socket became active since the last dispatch.
    pub(crate) pending_configure: Vec<Arc<Channel>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Multiplexer {
    pub(crate) fn new(config: EngineConfig) -> Self {
        Self {
            poll: None,
            sockets: HashMap::new(),
            registry: ChannelRegistry::new(),
            supervisor: ReconnectSupervisor::new(),
            listener_id: None,
            next_id: SOCKET_ID_RANGE_START,
            scratch: Vec::new(),
            config,
            pending_configure: Vec::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.poll.is_some()
    }

    fn poll(&self) -> Result<&Poll, Error> {
        self.poll.as_ref().ok_or(Error::NotActive)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Multiplexer {
    /// Creates the poll instance and the listener socket.
    #[instrument(skip(self))]
    pub(crate) fn open(&mut self) -> Result<(), Error> {
        if self.is_open() {
            return Ok(());
        }
        self.poll = Some(Poll::new()?);
        if let Err(err) = self.open_listener() {
            self.poll = None;
            return Err(err);
        }
        for channel in self.registry.all() {
            if channel.direction() == Direction::In && self.registry.socket_of(channel.id()).is_none() {
                self.attach_inbound(&channel)?;
            }
        }
        Ok(())
    }

    /// Closes every socket and forgets all socket links. Channels survive.
    #[instrument(skip(self))]
    pub(crate) fn close(&mut self) {
        let Some(poll) = self.poll.take() else {
            return;
        };
        for (id, mut socket) in self.sockets.drain() {
            if let Err(err) = socket.deregister(&poll) {
                debug!(id, ?err, "Failed to deregister socket");
            }
            info!(id, local_addr = %socket.local_addr, peer_addr = ?socket.peer_addr, "Closed socket");
        }
        self.listener_id = None;
        self.supervisor.clear();
        self.pending_configure.clear();
        for channel in self.registry.all() {
            channel.cancel_blocking();
        }
        self.registry.unassign_all();
    }

    fn open_listener(&mut self) -> Result<SocketId, Error> {
        let addr = SocketAddr::new(self.config.listener_address, self.config.port);
        let mut socket = Socket::listen(self.config.transport, addr)?;
        let id = self.next_id;
        socket.register(self.poll()?, id)?;
        info!(id, local_addr = %socket.local_addr, transport = ?self.config.transport, "Listening");
        self.sockets.insert(id, socket);
        self.advance_socket_id();
        self.listener_id = Some(id);
        Ok(id)
    }

    /// Binds a listener for the current configuration and moves the inbound
    /// channels onto it. The old listener stays up if binding fails.
    #[instrument(skip(self))]
    pub(crate) fn rebind_listener(&mut self) -> Result<(), Error> {
        let old = self.listener_id;
        let new = self.open_listener()?;
        if let Some(old) = old {
            self.close_socket(old);
            self.registry.replace_socket(old, new);
        }
        Ok(())
    }

    /// Drops every non-listener socket after a transport change.
    pub(crate) fn close_outbound(&mut self) {
        let ids: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, s)| s.role != SocketRole::Listener)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.supervisor.cancel(id);
            self.registry.unassign_socket(id);
            self.close_socket(id);
        }
    }
}

// ============================================================================
// Socket Assignment
// ============================================================================

impl Multiplexer {
    /// Returns the socket serving `channel`, opening one if needed.
    ///
    /// Sockets are shared according to the sharing policy. Inbound channels
    /// without a shared socket use the listener.
    pub(crate) fn ensure_socket(&mut self, channel: &Arc<Channel>) -> Result<SocketId, Error> {
        if !self.is_open() {
            return Err(Error::NotActive);
        }
        match self.registry.get(channel.id()) {
            Some(known) if Arc::ptr_eq(known, channel) => {}
            _ => return Err(Error::ChannelNotFound { id: channel.id() }),
        }
        if let Some(id) = self.registry.socket_of(channel.id()) {
            return Ok(id);
        }
        match channel.direction() {
            Direction::In => self.attach_inbound(channel),
            Direction::Out => self.attach_outbound(channel),
        }
    }

    pub(crate) fn attach_inbound(&mut self, channel: &Arc<Channel>) -> Result<SocketId, Error> {
        let policy = self.config.sharing;
        let id = match self.registry.shared_socket_for(channel, &policy, self.listener_id) {
            Some(id) => id,
            None => self.listener_id.ok_or(Error::NotActive)?,
        };
        self.join_socket(channel, id);
        debug!(%channel, id, "Attached inbound channel");
        Ok(id)
    }

    fn attach_outbound(&mut self, channel: &Arc<Channel>) -> Result<SocketId, Error> {
        let policy = self.config.sharing;
        if let Some(id) = self.registry.shared_socket_for(channel, &policy, self.listener_id) {
            self.join_socket(channel, id);
            debug!(%channel, id, "Sharing socket");
            return Ok(id);
        }

        let remote = channel.remote().address().ok_or_else(|| Error::MaskedOutboundChannel {
            item: channel.item().to_string(),
            mask: channel.remote().to_string(),
        })?;
        let mut socket = Socket::connect(self.config.transport, remote)?;
        let id = self.next_id;
        socket.register(self.poll()?, id)?;
        info!(id, local_addr = %socket.local_addr, peer_addr = %remote, "Opened socket");
        self.sockets.insert(id, socket);
        self.advance_socket_id();

        self.join_socket(channel, id);
        Ok(id)
    }

    // Links `channel` and its siblings to `id`. Newcomers on a socket that is
    // already up are configured now; the others when it comes up.
    fn join_socket(&mut self, channel: &Channel, id: SocketId) {
        let before: HashSet<ChannelId> = self
            .registry
            .find_by_socket(id)
            .iter()
            .map(|c| c.id())
            .collect();
        let policy = self.config.sharing;
        self.registry.assign_socket(channel.id(), id, &policy, self.listener_id);

        let active = Some(id) != self.listener_id
            && self
                .sockets
                .get(&id)
                .is_some_and(|s| s.state == SocketState::Active);
        if active {
            let joined = self
                .registry
                .find_by_socket(id)
                .into_iter()
                .filter(|c| !before.contains(&c.id()));
            self.pending_configure.extend(joined);
        }
    }

    pub(crate) fn close_socket(&mut self, id: SocketId) {
        let Some(mut socket) = self.sockets.remove(&id) else {
            warn!(id, "Socket not found when closing socket");
            return;
        };
        if let Some(poll) = self.poll.as_ref() {
            if let Err(err) = socket.deregister(poll) {
                debug!(id, ?err, "Failed to deregister socket");
            }
        }
        info!(id, local_addr = %socket.local_addr, peer_addr = ?socket.peer_addr, "Closed socket");
    }

    /// Closes outbound sockets no channel refers to any more.
    pub(crate) fn close_orphans(&mut self) -> usize {
        let referenced: HashSet<SocketId> = self.registry.sockets();
        let orphans: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(id, s)| s.role == SocketRole::Outbound && !referenced.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        for &id in &orphans {
            self.supervisor.cancel(id);
            self.close_socket(id);
        }
        orphans.len()
    }

    pub(crate) fn advance_socket_id(&mut self) {
        self.next_id = next_free_id(self.next_id, &self.sockets);
    }
}

/// The first id after `current` that no socket uses.
pub(crate) fn next_free_id(current: SocketId, sockets: &HashMap<SocketId, Socket>) -> SocketId {
    let mut id = current;
    loop {
        id = id.checked_add(1).unwrap_or(SOCKET_ID_RANGE_START);
        if !sockets.contains_key(&id) {
            return id;
        }
    }
}

// ============================================================================
// Write Targets
// ============================================================================

impl Multiplexer {
    /// Where a write for `channel` goes: the socket and, for the datagram
    /// listener, the destination address.
    ///
    /// Inbound channels reply to their concrete remote or, for masks, to the
    /// last sender. Over streams that is the accepted connection of that peer.
    pub(crate) fn write_target(&self, channel: &Channel) -> Option<(SocketId, Option<SocketAddr>)> {
        let id = self.registry.socket_of(channel.id())?;
        if Some(id) != self.listener_id {
            return Some((id, None));
        }

        let destination = channel.remote().address().or_else(|| channel.last_remote())?;
        match self.sockets.get(&id)?.io {
            SocketIo::Datagram(_) => Some((id, Some(destination))),
            SocketIo::Acceptor(_) => self
                .sockets
                .iter()
                .find(|(_, s)| s.role == SocketRole::Accepted && s.peer_addr == Some(destination))
                .map(|(accepted, _)| (*accepted, None)),
            SocketIo::Stream(_) => None,
        }
    }

    /// True while a blocking write sent on `id` still waits for its reply.
    pub(crate) fn is_awaiting(&self, id: SocketId) -> bool {
        let owner = match self.sockets.get(&id) {
            Some(socket) if socket.role == SocketRole::Accepted => match self.listener_id {
                Some(listener) => listener,
                None => return false,
            },
            _ => id,
        };
        self.registry.awaiting_on_socket(owner).is_some()
    }

    /// Enables writability on `id` if it is live.
    pub(crate) fn arm_writable(&mut self, id: SocketId) {
        let Some(poll) = self.poll.as_ref() else {
            return;
        };
        let Some(socket) = self.sockets.get_mut(&id) else {
            return;
        };
        if !socket.is_live() {
            return;
        }
        let interest = socket.interest | Interest::WRITABLE;
        if let Err(err) = socket.set_interest(poll, id, interest) {
            warn!(id, ?err, "Failed to enable writability");
        }
    }

    /// Arms every socket that has queued writes and is not held back by a
    /// blocking call. Writes that can no longer reach anyone are dropped.
    pub(crate) fn arm_pending(&mut self, queue: &mut WriteQueue) {
        let mut targets = HashSet::new();
        queue.retain(|element| match self.write_target(&element.channel) {
            Some((id, _)) => {
                targets.insert(id);
                true
            }
            None => {
                warn!(channel = %element.channel, len = element.buffer.len(), "Dropping write without destination");
                false
            }
        });
        for id in targets {
            if !self.is_awaiting(id) {
                self.arm_writable(id);
            }
        }
    }

    pub(crate) fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener_id
            .and_then(|id| self.sockets.get(&id))
            .map(|s| s.local_addr)
    }
}
