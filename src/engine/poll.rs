//! One pass of the selector: read, route and write without ever blocking.

use super::mux::{next_free_id, Multiplexer};
use super::socket::{Socket, SocketIo, SocketRole, SocketState};
use super::write_queue::WriteQueue;
use crate::channel::{Channel, SocketId};
use crate::error::Error;
use mio::{Events, Interest};
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, trace, warn};

/// An inbound buffer to hand to the protocol once the lock is released.
pub(crate) type Delivery = (Arc<Channel>, Vec<u8>);

// Outcome of draining one readable socket
enum ReadOutcome {
    Drained,
    Closed,
    Failed,
}

// ============================================================================
// Event Operations
// ============================================================================

impl Multiplexer {
    /// Polls with a zero timeout and services every ready socket.
    #[instrument(skip(self, queue))]
    pub(crate) fn poll_once(&mut self, queue: &mut WriteQueue) -> Result<Vec<Delivery>, Error> {
        let capacity = self.config.poll_capacity;
        let poll = self.poll.as_mut().ok_or(Error::NotActive)?;
        let mut events = Events::with_capacity(capacity);
        match poll.poll(&mut events, Some(Duration::ZERO)) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        // An error-only event (an ICMP refusal on a connected datagram
        // socket, say) counts as both, so the next read or write surfaces it.
        let ready: Vec<(SocketId, bool, bool)> = events
            .iter()
            .map(|event| {
                let failed = event.is_error();
                (
                    event.token().0,
                    event.is_readable() || failed,
                    event.is_writable() || failed,
                )
            })
            .collect();

        let mut deliveries = Vec::new();
        for (id, readable, writable) in ready {
            let (is_acceptor, connecting) = match self.sockets.get(&id) {
                Some(socket) if socket.is_live() => (
                    matches!(socket.io, SocketIo::Acceptor(_)),
                    socket.state == SocketState::Connecting,
                ),
                _ => {
                    trace!(id, "Event for inactive socket");
                    continue;
                }
            };

            if is_acceptor {
                self.accept_connections(id);
                continue;
            }

            if connecting {
                if !writable || !self.finish_connect(id) {
                    continue;
                }
            }

            if readable {
                match self.read_socket(id, &mut deliveries) {
                    ReadOutcome::Drained => {}
                    ReadOutcome::Closed | ReadOutcome::Failed => continue,
                }
            }

            if writable || connecting {
                self.write_socket(id, queue);
            }
        }

        self.arm_pending(queue);

        if !deliveries.is_empty() {
            debug!(count = deliveries.len(), "Routed inbound buffers");
        }
        Ok(deliveries)
    }
}

// ============================================================================
// Internal Socket I/O
// ============================================================================

impl Multiplexer {
    fn accept_connections(&mut self, id: SocketId) {
        let mut accepted = Vec::new();
        {
            let Some(socket) = self.sockets.get_mut(&id) else {
                return;
            };
            let local_addr = socket.local_addr;
            let SocketIo::Acceptor(listener) = &mut socket.io else {
                return;
            };
            loop {
                match listener.accept() {
                    Ok((stream, peer_addr)) => accepted.push((stream, peer_addr)),
                    Err(err) => match err.kind() {
                        ErrorKind::WouldBlock => break,
                        ErrorKind::Interrupted => continue,
                        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                            warn!(?err, %local_addr, "Transient accept error");
                            continue;
                        }
                        _ => {
                            error!(?err, %local_addr, "Error accepting connection");
                            break;
                        }
                    },
                }
            }
        }

        let Some(poll) = self.poll.as_ref() else {
            return;
        };
        for (stream, peer_addr) in accepted {
            let accepted_id = self.next_id;
            let socket = Socket::accepted(stream, peer_addr).and_then(|mut socket| {
                socket.register(poll, accepted_id)?;
                Ok(socket)
            });
            match socket {
                Ok(socket) => {
                    info!(id = accepted_id, local_addr = %socket.local_addr, %peer_addr, "Accepting connection");
                    self.sockets.insert(accepted_id, socket);
                    self.next_id = next_free_id(self.next_id, &self.sockets);
                }
                Err(err) => warn!(%peer_addr, ?err, "Failed to set up accepted connection"),
            }
        }
    }

    // Completes an outbound stream connect. Returns false if it failed.
    fn finish_connect(&mut self, id: SocketId) -> bool {
        let Some(socket) = self.sockets.get_mut(&id) else {
            return false;
        };
        let SocketIo::Stream(stream) = &socket.io else {
            return false;
        };
        let local_addr = socket.local_addr;
        let peer_addr = socket.peer_addr;

        match stream.take_error() {
            Ok(None) => {
                info!(id, %local_addr, ?peer_addr, "Connection established");
                socket.state = SocketState::Active;
                if let Some(poll) = self.poll.as_ref() {
                    let interest = Interest::READABLE | Interest::WRITABLE;
                    if let Err(err) = socket.set_interest(poll, id, interest) {
                        warn!(id, ?err, "Failed to update interest");
                    }
                }
                self.pending_configure.extend(self.registry.find_by_socket(id));
                true
            }
            Ok(Some(err)) | Err(err) => {
                if err.kind() == ErrorKind::ConnectionRefused {
                    info!(id, %local_addr, ?peer_addr, "Connection refused");
                } else {
                    error!(id, %local_addr, ?peer_addr, ?err, "Connection establishment failed");
                }
                self.report_fault(id);
                false
            }
        }
    }

    fn read_socket(&mut self, id: SocketId, deliveries: &mut Vec<Delivery>) -> ReadOutcome {
        loop {
            let buffer_size = self.config.buffer_size;
            let Some(socket) = self.sockets.get_mut(&id) else {
                return ReadOutcome::Closed;
            };
            let role = socket.role;
            let is_stream = socket.is_stream();
            let local_addr = socket.local_addr;
            let peer_addr = socket.peer_addr;

            self.scratch.resize(buffer_size, 0);
            let result: io::Result<(usize, Option<SocketAddr>)> = match &mut socket.io {
                SocketIo::Datagram(udp) if role == SocketRole::Listener => udp
                    .recv_from(&mut self.scratch)
                    .map(|(len, sender)| (len, Some(sender))),
                SocketIo::Datagram(udp) => udp.recv(&mut self.scratch).map(|len| (len, peer_addr)),
                SocketIo::Stream(stream) => stream.read(&mut self.scratch).map(|len| (len, peer_addr)),
                SocketIo::Acceptor(_) => return ReadOutcome::Drained,
            };

            match result {
                Ok((0, _)) if is_stream => {
                    info!(id, %local_addr, ?peer_addr, "Connection closed");
                    self.report_fault(id);
                    return ReadOutcome::Closed;
                }
                Ok((0, _)) => {
                    trace!(id, %local_addr, "Ignoring empty datagram");
                }
                Ok((len, sender)) => {
                    trace!(id, len, %local_addr, ?sender, "Read data from socket");
                    let buffer = self.scratch[..len].to_vec();
                    self.route(id, role, sender, buffer, deliveries);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return ReadOutcome::Drained,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    match err.kind() {
                        ErrorKind::BrokenPipe => warn!(id, %local_addr, ?peer_addr, "Broken pipe"),
                        ErrorKind::ConnectionReset => {
                            warn!(id, %local_addr, ?peer_addr, "Connection reset")
                        }
                        ErrorKind::ConnectionRefused => {
                            warn!(id, %local_addr, ?peer_addr, "Connection refused")
                        }
                        _ => error!(id, %local_addr, ?peer_addr, ?err, "Error reading from socket"),
                    }
                    if role == SocketRole::Listener {
                        return ReadOutcome::Drained;
                    }
                    self.report_fault(id);
                    return ReadOutcome::Failed;
                }
            }
        }
    }

    fn write_socket(&mut self, id: SocketId, queue: &mut WriteQueue) {
        loop {
            if self.is_awaiting(id) {
                trace!(id, "Holding writes until the blocking reply arrives");
                break;
            }

            let mut destination = None;
            let Some(index) = queue.position(|element| match self.write_target(&element.channel) {
                Some((target, to)) if target == id => {
                    destination = to;
                    true
                }
                _ => false,
            }) else {
                break;
            };
            let Some(element) = queue.get_mut(index) else {
                break;
            };
            let Some(socket) = self.sockets.get_mut(&id) else {
                return;
            };
            let local_addr = socket.local_addr;

            let result = match (&mut socket.io, destination) {
                (SocketIo::Datagram(udp), Some(to)) => udp.send_to(element.remaining(), to),
                (SocketIo::Datagram(udp), None) => udp.send(element.remaining()),
                (SocketIo::Stream(stream), _) => stream.write(element.remaining()),
                (SocketIo::Acceptor(_), _) => return,
            };

            match result {
                Ok(0) if !element.remaining().is_empty() => {
                    warn!(id, remaining = element.remaining().len(), %local_addr, "Write to socket returned 0");
                    return;
                }
                Ok(len) => {
                    element.offset += len;
                    trace!(id, len, remaining = element.remaining().len(), %local_addr, "Wrote to socket");
                    // A datagram goes out whole or not at all.
                    if element.remaining().is_empty() || !socket.is_stream() {
                        if let Some(element) = queue.remove(index) {
                            debug!(id, channel = %element.channel, len = element.buffer.len(), "Sent buffer");
                            if let Some(generation) = element.blocking {
                                element.channel.mark_awaiting(generation);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    match err.kind() {
                        ErrorKind::BrokenPipe => warn!(id, %local_addr, "Broken pipe"),
                        ErrorKind::ConnectionReset => warn!(id, %local_addr, "Connection reset"),
                        _ => error!(id, %local_addr, ?err, "Error writing to socket"),
                    }
                    self.report_fault(id);
                    return;
                }
            }
        }

        // Nothing left we may write, so stop asking for writability
        if let (Some(poll), Some(socket)) = (self.poll.as_ref(), self.sockets.get_mut(&id)) {
            if socket.is_live() {
                if let Err(err) = socket.set_interest(poll, id, Interest::READABLE) {
                    warn!(id, ?err, "Failed to update interest");
                }
            }
        }
    }

    // Hands a buffer to the blocked caller or queues it for the protocol.
    fn route(
        &mut self,
        id: SocketId,
        role: SocketRole,
        sender: Option<SocketAddr>,
        buffer: Vec<u8>,
        deliveries: &mut Vec<Delivery>,
    ) {
        let channels = match role {
            SocketRole::Listener | SocketRole::Accepted => {
                let (Some(listener), Some(sender)) = (self.listener_id, sender) else {
                    return;
                };
                self.registry.find_inbound(listener, sender)
            }
            SocketRole::Outbound => self.registry.find_by_socket(id),
        };

        if let Some(channel) = channels.iter().find(|c| c.is_awaiting()) {
            if channel.fulfil(&buffer) {
                debug!(id, %channel, len = buffer.len(), "Delivered blocking reply");
                return;
            }
        }

        if channels.is_empty() {
            warn!(id, ?sender, len = buffer.len(), "No channel for inbound data, dropping");
            return;
        }

        for channel in channels {
            if let (true, Some(sender)) = (channel.remote().is_mask(), sender) {
                channel.set_last_remote(sender);
            }
            deliveries.push((channel, buffer.clone()));
        }
    }
}
