//! Delayed re-creation of failed sockets.

use super::mux::Multiplexer;
use super::socket::{Socket, SocketRole, SocketState};
use crate::channel::{Channel, SocketId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug)]
struct ScheduledReconnect {
    socket: SocketId,
    due: Instant,
    delay: Duration,
}

/// Tracks which sockets wait for a reconnect and when it is due.
#[derive(Debug, Default)]
pub(crate) struct ReconnectSupervisor {
    scheduled: Vec<ScheduledReconnect>,
}

impl ReconnectSupervisor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules a reconnect of `socket` after `delay`.
    ///
    /// Returns false if one is already scheduled for the socket.
    pub(crate) fn schedule(&mut self, socket: SocketId, delay: Duration) -> bool {
        if self.scheduled.iter().any(|s| s.socket == socket) {
            return false;
        }
        self.scheduled.push(ScheduledReconnect {
            socket,
            due: Instant::now() + delay,
            delay,
        });
        true
    }

    /// Removes and returns the reconnects due at `now`, oldest first.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(SocketId, Duration)> {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.scheduled.drain(..).partition(|s| s.due <= now);
        self.scheduled = pending;
        due.into_iter().map(|s| (s.socket, s.delay)).collect()
    }

    pub(crate) fn cancel(&mut self, socket: SocketId) {
        self.scheduled.retain(|s| s.socket != socket);
    }

    pub(crate) fn clear(&mut self) {
        self.scheduled.clear();
    }

    pub(crate) fn pending(&self) -> usize {
        self.scheduled.len()
    }
}

// ============================================================================
// Fault handling
// ============================================================================

impl Multiplexer {
    /// Marks `id` failed and schedules its reconnect.
    ///
    /// Accepted streams are closed instead, the listener is left alone, and a
    /// socket already waiting for a reconnect is not scheduled twice. Returns
    /// true if a reconnect was scheduled.
    #[instrument(skip(self))]
    pub(crate) fn report_fault(&mut self, id: SocketId) -> bool {
        let Some(socket) = self.sockets.get(&id) else {
            debug!(id, "Fault on unknown socket");
            return false;
        };
        let (role, state, local_addr, peer_addr) =
            (socket.role, socket.state, socket.local_addr, socket.peer_addr);

        match role {
            SocketRole::Listener => {
                error!(id, %local_addr, "Listener socket failed");
                return false;
            }
            SocketRole::Accepted => {
                self.close_socket(id);
                return false;
            }
            SocketRole::Outbound => {}
        }

        if !matches!(state, SocketState::Active | SocketState::Connecting) {
            debug!(id, ?state, "Reconnect already pending");
            return false;
        }

        let delay = self.config.retry_interval;
        if let Some(socket) = self.sockets.get_mut(&id) {
            socket.state = SocketState::ReconnectScheduled;
        }
        self.supervisor.schedule(id, delay);
        self.registry.set_reconnecting(id, true);
        warn!(id, %local_addr, ?peer_addr, ?delay, "Scheduling reconnect");
        true
    }

    /// Runs every reconnect that is due. Returns the channels whose socket
    /// came back up, for `configure_channel`.
    pub(crate) fn run_due_reconnects(&mut self, now: Instant) -> Vec<Arc<Channel>> {
        let mut configured = Vec::new();
        for (id, delay) in self.supervisor.take_due(now) {
            if let Some(channels) = self.reconnect(id, delay) {
                configured.extend(channels);
            }
        }
        configured
    }

    #[instrument(skip(self, delay))]
    fn reconnect(&mut self, id: SocketId, delay: Duration) -> Option<Vec<Arc<Channel>>> {
        let transport = self.config.transport;
        let poll = self.poll.as_ref()?;

        let Some(old) = self.sockets.get_mut(&id) else {
            debug!(id, "Socket closed before its reconnect was due");
            return None;
        };
        let Some(remote) = old.peer_addr else {
            return None;
        };
        old.state = SocketState::ReconnectInProgress;

        let new_id = self.next_id;
        let fresh = Socket::connect(transport, remote).and_then(|mut fresh| {
            fresh.register(poll, new_id)?;
            Ok(fresh)
        });
        let fresh = match fresh {
            Ok(fresh) => fresh,
            Err(err) => {
                warn!(id, %remote, ?err, ?delay, "Reconnect failed, retrying");
                old.state = SocketState::ReconnectScheduled;
                self.supervisor.schedule(id, delay);
                return None;
            }
        };

        if let Some(mut old) = self.sockets.remove(&id) {
            if let Err(err) = old.deregister(poll) {
                debug!(id, ?err, "Failed to deregister old socket");
            }
        }

        let local_addr = fresh.local_addr;
        let ready = fresh.state == SocketState::Active;
        self.sockets.insert(new_id, fresh);
        self.advance_socket_id();

        let moved = self.registry.replace_socket(id, new_id);
        self.registry.set_reconnecting(new_id, false);
        let channels = self.registry.find_by_socket(new_id);
        for channel in &channels {
            channel.cancel_blocking();
        }
        info!(old = id, id = new_id, %local_addr, %remote, channels = moved, "Reconnected socket");

        ready.then_some(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedules_once_per_socket() {
        let mut supervisor = ReconnectSupervisor::new();
        assert!(supervisor.schedule(1000, Duration::from_secs(5)));
        assert!(!supervisor.schedule(1000, Duration::from_secs(5)));
        assert!(supervisor.schedule(1001, Duration::from_secs(5)));
        assert_eq!(supervisor.pending(), 2);
    }

    #[test]
    fn only_due_entries_are_taken() {
        let mut supervisor = ReconnectSupervisor::new();
        supervisor.schedule(1000, Duration::ZERO);
        supervisor.schedule(1001, Duration::from_secs(60));

        let due = supervisor.take_due(Instant::now());
        assert_eq!(due, vec![(1000, Duration::ZERO)]);
        assert_eq!(supervisor.pending(), 1);

        supervisor.cancel(1001);
        assert_eq!(supervisor.pending(), 0);
    }
}
