//! The channel engine.
//!
//! An [`Engine`] owns one mio poll instance, the sockets registered with it,
//! the channel registry and the write queue. Hosts bind channels, feed it
//! commands and let the ticker thread started by [`Engine::activate`] drive
//! the poll cycle. All socket I/O happens inside the poll cycle; callers of
//! [`Engine::write_buffer`] only enqueue.
//!
//! # Locking
//!
//! The multiplexer (poll, sockets, registry, reconnect supervisor) sits
//! behind one lock, the write queue behind a second, and every channel keeps
//! its blocking state behind its own. They are always taken in that order.
//! Protocol callbacks run with none of the engine locks held, so they may call
//! back into the engine.

mod driver;
mod mux;
mod poll;
mod reconnect;
mod socket;
mod write_queue;

use crate::channel::{Channel, Direction, Remote, SocketId, Subject};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::protocol::ChannelProtocol;
use ::config::Config;
use driver::Driver;
use mux::Multiplexer;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};
use write_queue::WriteQueue;

/// Result of dispatching a command to the channels of an item.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Number of channels the command was handed to.
    pub served: usize,
    /// True if any protocol asked for the command to be published as state.
    pub update_state: bool,
}

/// Multiplexed network-channel engine.
pub struct Engine {
    name: String,
    mux: Mutex<Multiplexer>,
    write_queue: Mutex<WriteQueue>,
    protocol: Arc<dyn ChannelProtocol>,
    driver: Mutex<Option<Driver>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl Engine {
    /// Creates an engine from the root of `config`.
    pub fn new(config: &Config, protocol: Arc<dyn ChannelProtocol>) -> Result<Self, Error> {
        Self::new_named(config, "", protocol)
    }

    /// Creates an engine whose keys are looked up under `name` first.
    pub fn new_named(
        config: &Config,
        name: &str,
        protocol: Arc<dyn ChannelProtocol>,
    ) -> Result<Self, Error> {
        let config = EngineConfig::new_named(config, name)?;
        Self::with_config(name, config, protocol)
    }

    /// Creates an engine from already parsed settings.
    pub fn with_config(
        name: &str,
        config: EngineConfig,
        protocol: Arc<dyn ChannelProtocol>,
    ) -> Result<Self, Error> {
        config.sharing.validate()?;
        Ok(Self {
            name: name.to_string(),
            mux: Mutex::new(Multiplexer::new(config)),
            write_queue: Mutex::new(WriteQueue::new()),
            protocol,
            driver: Mutex::new(None),
        })
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Engine {
    /// Opens the multiplexer and the listener socket without starting the
    /// ticker. The host then drives [`Engine::poll_cycle`] itself.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn open(&self) -> Result<(), Error> {
        self.lock_mux().open()?;
        self.dispatch_configured();
        Ok(())
    }

    /// Opens the engine and starts the ticker thread.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn activate(self: &Arc<Self>) -> Result<(), Error> {
        self.open()?;
        let mut driver = self.lock_driver();
        if driver.is_none() {
            let interval = self.lock_mux().config.poll_interval;
            *driver = Some(Driver::spawn(Arc::downgrade(self), &self.name, interval)?);
            info!(?interval, "Engine activated");
        }
        Ok(())
    }

    /// Stops the ticker and closes every socket.
    ///
    /// Channels are kept and get sockets again after the next activation.
    /// Queued writes are discarded and blocked callers return `None`.
    #[instrument(skip(self), fields(name = %self.name))]
    pub fn deactivate(&self) {
        let driver = self.lock_driver().take();
        if let Some(driver) = driver {
            driver.stop();
        }
        self.lock_mux().close();
        self.lock_queue().clear();
        info!("Engine deactivated");
    }

    /// True between [`Engine::open`] (or [`Engine::activate`]) and
    /// [`Engine::deactivate`].
    pub fn is_active(&self) -> bool {
        self.lock_mux().is_open()
    }

    /// Validates `config` and applies it.
    ///
    /// A changed port, listener address or transport rebinds the listener
    /// and moves its channels. On error the previous configuration stays live.
    #[instrument(skip(self, config), fields(name = %self.name))]
    pub fn update_config(&self, config: &Config) -> Result<(), Error> {
        let new = EngineConfig::new_named(config, &self.name)?;
        let mut mux = self.lock_mux();

        if !new.sharing.address_mask && mux.registry.all().iter().any(|c| c.remote().is_mask()) {
            return Err(Error::IncompatibleSharing(
                "addressmask cannot be disabled while masked channels exist",
            ));
        }

        let old = std::mem::replace(&mut mux.config, new.clone());
        if mux.is_open() {
            let transport_changed = old.transport != new.transport;
            if transport_changed
                || old.port != new.port
                || old.listener_address != new.listener_address
            {
                if let Err(err) = mux.rebind_listener() {
                    warn!(?err, "Failed to rebind listener, keeping previous configuration");
                    mux.config = old;
                    return Err(err);
                }
                if transport_changed {
                    mux.close_outbound();
                }
            }
        }
        info!(transport = ?new.transport, port = new.port, "Configuration updated");
        Ok(())
    }
}

// ============================================================================
// Channel Management
// ============================================================================

impl Engine {
    /// Adds a channel binding, or returns the existing one.
    ///
    /// Inbound channels of an active engine are attached to a shared socket
    /// or the listener right away. Outbound channels get a socket on first use.
    #[instrument(skip(self))]
    pub fn bind(&self, subject: Subject, remote: Remote) -> Result<Arc<Channel>, Error> {
        let mut mux = self.lock_mux();
        let allow_masks = mux.config.sharing.address_mask;
        let (channel, created) = mux.registry.upsert(subject, remote, allow_masks)?;
        if created && channel.direction() == Direction::In && mux.is_open() {
            mux.attach_inbound(&channel)?;
        }
        Ok(channel)
    }

    /// Replaces the whole set of channel bindings.
    ///
    /// Existing channels for bindings in `bindings` are kept. Channels not in
    /// it are removed along with their queued writes, and sockets no channel
    /// refers to any more are closed. Nothing changes if a binding is invalid.
    #[instrument(skip(self, bindings), fields(count = bindings.len()))]
    pub fn reconfigure(&self, bindings: Vec<(Subject, Remote)>) -> Result<(), Error> {
        let mut mux = self.lock_mux();
        let allow_masks = mux.config.sharing.address_mask;
        for (subject, remote) in &bindings {
            crate::channel::ChannelRegistry::validate(subject, remote, allow_masks)?;
        }

        let mut keep = HashSet::new();
        for (subject, remote) in bindings {
            let (channel, created) = mux.registry.upsert(subject, remote, allow_masks)?;
            if created && channel.direction() == Direction::In && mux.is_open() {
                mux.attach_inbound(&channel)?;
            }
            keep.insert(channel.id());
        }

        let removed = mux.registry.retain(|channel| keep.contains(&channel.id()));
        let closed = mux.close_orphans();

        let mut queue = self.lock_queue();
        let mut dropped = 0;
        for channel in &removed {
            dropped += queue.remove_channel(channel.id());
            channel.cancel_blocking();
        }
        info!(
            kept = keep.len(),
            removed = removed.len(),
            closed,
            dropped,
            "Reconfigured channels"
        );
        Ok(())
    }

    /// Hands `command` to every outbound channel of `item` that accepts it.
    ///
    /// Each channel gets a socket first, then the protocol turns the command
    /// into writes. An item without channels is logged and served by nobody.
    #[instrument(skip(self))]
    pub fn receive_command(&self, item: &str, command: &str) -> Result<CommandOutcome, Error> {
        let channels: Vec<Arc<Channel>> = {
            let mux = self.lock_mux();
            if !mux.is_open() {
                return Err(Error::NotActive);
            }
            mux.registry
                .find_by_item(item)
                .into_iter()
                .filter(|c| c.direction() == Direction::Out && c.subject().accepts(command))
                .collect()
        };

        let mut outcome = CommandOutcome::default();
        if channels.is_empty() {
            warn!(item, command, "No channel serves the command");
            return Ok(outcome);
        }

        for channel in channels {
            if let Err(err) = self.lock_mux().ensure_socket(&channel) {
                warn!(%channel, ?err, "Unable to get a socket for channel");
                continue;
            }
            self.dispatch_configured();
            outcome.served += 1;
            if self.protocol.receive_channeled_command(self, &channel, command) {
                outcome.update_state = true;
            }
        }
        Ok(outcome)
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl Engine {
    /// Queues `buffer` for `channel`.
    ///
    /// Non-blocking writes return `Ok(None)` at once. Blocking writes wait up
    /// to `timeout` for the next buffer read on the channel's socket after the
    /// write went out, and return it. A timeout returns `Ok(None)` and leaves
    /// the write queued. Only one blocking write per channel can be in flight,
    /// and no other write is accepted on the channel while it is.
    #[instrument(skip(self, channel, buffer), fields(channel = %channel, len = buffer.len()))]
    pub fn write_buffer(
        &self,
        channel: &Arc<Channel>,
        buffer: Vec<u8>,
        blocking: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, Error> {
        let call = if blocking {
            Some(channel.begin_blocking()?)
        } else if channel.is_blocking() {
            return Err(Error::BlockingInProgress { id: channel.id() });
        } else {
            None
        };
        let generation = call.as_ref().map(|call| call.generation);

        let queued = self.enqueue(channel, buffer, generation);
        if !matches!(queued, Ok(true)) {
            if let Some(generation) = generation {
                channel.end_blocking(generation);
            }
            return queued.map(|_| None);
        }

        let Some(call) = call else {
            return Ok(None);
        };

        let response = match call.receiver.recv_timeout(timeout) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => {
                debug!(?timeout, "Blocking write timed out");
                call.receiver.try_recv().ok()
            }
            Err(RecvTimeoutError::Disconnected) => None,
        };
        channel.end_blocking(call.generation);

        if response.is_none() {
            // Writes held back by this call may go now
            let mut mux = self.lock_mux();
            let mut queue = self.lock_queue();
            mux.arm_pending(&mut queue);
        }
        Ok(response)
    }

    /// Runs one poll cycle and hands the inbound buffers to the protocol.
    ///
    /// Returns the number of buffers delivered.
    pub fn poll_cycle(&self) -> Result<usize, Error> {
        let deliveries = {
            let mut mux = self.lock_mux();
            let mut queue = self.lock_queue();
            mux.poll_once(&mut queue)?
        };
        self.dispatch_configured();

        let count = deliveries.len();
        for (channel, buffer) in deliveries {
            trace!(%channel, len = buffer.len(), "Parsing buffer");
            self.protocol.parse_buffer(self, &channel, &buffer);
        }
        Ok(count)
    }

    /// Recreates every failed socket whose retry delay has passed.
    pub fn run_due_reconnects(&self) {
        {
            let mut mux = self.lock_mux();
            let configured = mux.run_due_reconnects(Instant::now());
            mux.pending_configure.extend(configured);
            let mut queue = self.lock_queue();
            mux.arm_pending(&mut queue);
        }
        self.dispatch_configured();
    }

    /// Marks a socket failed and schedules its reconnect.
    ///
    /// Returns false if the socket is unknown, already waiting for a
    /// reconnect, or is the listener.
    pub fn report_fault(&self, socket: SocketId) -> bool {
        self.lock_mux().report_fault(socket)
    }

    // One ticker iteration
    pub(crate) fn tick(&self) {
        match self.poll_cycle() {
            Ok(_) | Err(Error::NotActive) => {}
            Err(err) => error!(?err, "Poll cycle failed"),
        }
        self.run_due_reconnects();
    }
}

// ============================================================================
// Introspection
// ============================================================================

impl Engine {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The settings currently in effect.
    pub fn config(&self) -> EngineConfig {
        self.lock_mux().config.clone()
    }

    pub fn protocol(&self) -> &Arc<dyn ChannelProtocol> {
        &self.protocol
    }

    /// All channels, in creation order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.lock_mux().registry.all()
    }

    /// Channels of `item` with `command` and `direction`.
    pub fn find_channels(&self, subject: &Subject) -> Vec<Arc<Channel>> {
        self.lock_mux().registry.find_by_subject(subject)
    }

    /// Channels bound to `remote`, optionally of one direction only.
    pub fn find_channels_by_remote(&self, direction: Option<Direction>, remote: &Remote) -> Vec<Arc<Channel>> {
        self.lock_mux().registry.find_by_remote(direction, remote)
    }

    /// The socket currently serving `channel`.
    pub fn socket_of(&self, channel: &Channel) -> Option<SocketId> {
        self.lock_mux().registry.socket_of(channel.id())
    }

    /// Local address of the listener socket while the engine is active.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.lock_mux().listener_addr()
    }

    /// Local address of any socket, for diagnostics.
    pub fn local_addr_of(&self, socket: SocketId) -> Option<SocketAddr> {
        self.lock_mux().sockets.get(&socket).map(|s| s.local_addr)
    }

    pub fn pending_reconnects(&self) -> usize {
        self.lock_mux().supervisor.pending()
    }

    pub fn queued_writes(&self) -> usize {
        self.lock_queue().len()
    }
}

// ============================================================================
// Internal Helpers
// ============================================================================

impl Engine {
    // Returns Ok(false) if the write has nowhere to go and was dropped.
    fn enqueue(
        &self,
        channel: &Arc<Channel>,
        buffer: Vec<u8>,
        generation: Option<u64>,
    ) -> Result<bool, Error> {
        let mut mux = self.lock_mux();
        mux.ensure_socket(channel)?;
        let Some((target, _)) = mux.write_target(channel) else {
            warn!(%channel, len = buffer.len(), "No destination for write, dropping");
            return Ok(false);
        };

        let mut queue = self.lock_queue();
        debug!(%channel, target, len = buffer.len(), blocking = generation.is_some(), "Queueing write");
        queue.push(channel.clone(), buffer, generation);
        if !mux.is_awaiting(target) {
            mux.arm_writable(target);
        }
        Ok(true)
    }

    fn dispatch_configured(&self) {
        let channels = std::mem::take(&mut self.lock_mux().pending_configure);
        for channel in channels {
            debug!(%channel, "Configuring channel");
            self.protocol.configure_channel(self, &channel);
        }
    }

    fn lock_mux(&self) -> MutexGuard<'_, Multiplexer> {
        self.mux.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> MutexGuard<'_, WriteQueue> {
        self.write_queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<Driver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("active", &self.is_active())
            .field("queued_writes", &self.queued_writes())
            .finish_non_exhaustive()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let driver = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.stop();
        }
    }
}
