use super::{Channel, ChannelId, Direction, MatchTier, Remote, Subject};
use crate::config::SharingPolicy;
use crate::error::Error;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Identifies a real socket inside one engine. Doubles as the mio token.
pub type SocketId = usize;

/// How far a socket may be shared between channels with the same remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShareScope {
    /// Same item, same direction.
    Item,
    /// Any item, same direction.
    Binding,
    /// Any item, any direction.
    Directions,
}

impl ShareScope {
    // Narrowest first, in the order sharing is tried.
    pub(crate) fn enabled(policy: &SharingPolicy) -> Vec<ShareScope> {
        let mut scopes = Vec::new();
        if policy.item {
            scopes.push(ShareScope::Item);
        }
        if policy.binding {
            scopes.push(ShareScope::Binding);
        }
        if policy.directions {
            scopes.push(ShareScope::Directions);
        }
        scopes
    }

    fn covers(&self, a: &Subject, b: &Subject) -> bool {
        match self {
            ShareScope::Item => a.item == b.item && a.direction == b.direction,
            ShareScope::Binding => a.direction == b.direction,
            ShareScope::Directions => true,
        }
    }
}

#[derive(Debug)]
struct Entry {
    channel: Arc<Channel>,
    socket: Option<SocketId>,
}

/// In-memory index over all channels of an engine.
///
/// The registry is the only place that links channels to sockets. It lives
/// under the same lock as the multiplexer, so lookups here and socket
/// registration never disagree.
#[derive(Debug, Default)]
pub(crate) struct ChannelRegistry {
    entries: Vec<Entry>,
    next_id: ChannelId,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Checks that a channel could be created, without creating it.
    pub(crate) fn validate(subject: &Subject, remote: &Remote, allow_masks: bool) -> Result<(), Error> {
        if remote.is_mask() {
            if subject.direction == Direction::Out {
                return Err(Error::MaskedOutboundChannel {
                    item: subject.item.clone(),
                    mask: remote.to_string(),
                });
            }
            if !allow_masks {
                return Err(Error::AddressMaskDisabled {
                    item: subject.item.clone(),
                    mask: remote.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Returns the channel for `(subject, remote)`, creating it if needed.
    ///
    /// The boolean is true if the channel was created by this call.
    pub(crate) fn upsert(
        &mut self,
        subject: Subject,
        remote: Remote,
        allow_masks: bool,
    ) -> Result<(Arc<Channel>, bool), Error> {
        Self::validate(&subject, &remote, allow_masks)?;

        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.channel.subject == subject && e.channel.remote == remote)
        {
            return Ok((entry.channel.clone(), false));
        }

        let channel = Arc::new(Channel::new(self.next_id, subject, remote));
        self.next_id += 1;
        debug!(%channel, "Adding channel");
        self.entries.push(Entry {
            channel: channel.clone(),
            socket: None,
        });
        Ok((channel, true))
    }

    pub(crate) fn get(&self, id: ChannelId) -> Option<&Arc<Channel>> {
        self.entry(id).map(|e| &e.channel)
    }

    pub(crate) fn socket_of(&self, id: ChannelId) -> Option<SocketId> {
        self.entry(id).and_then(|e| e.socket)
    }

    pub(crate) fn all(&self) -> Vec<Arc<Channel>> {
        self.entries.iter().map(|e| e.channel.clone()).collect()
    }

    // ============================================================================
    // Lookups
    // ============================================================================

    pub(crate) fn find_by_item(&self, item: &str) -> Vec<Arc<Channel>> {
        self.select(|e| e.channel.subject.item == item)
    }

    pub(crate) fn find_by_subject(&self, subject: &Subject) -> Vec<Arc<Channel>> {
        self.select(|e| &e.channel.subject == subject)
    }

    pub(crate) fn find_by_remote(&self, direction: Option<Direction>, remote: &Remote) -> Vec<Arc<Channel>> {
        self.select(|e| {
            &e.channel.remote == remote && direction.map_or(true, |d| e.channel.subject.direction == d)
        })
    }

    pub(crate) fn find_by_socket(&self, socket: SocketId) -> Vec<Arc<Channel>> {
        self.select(|e| e.socket == Some(socket))
    }

    /// The first channel sharing `remote` within `scope` that already has a socket.
    pub(crate) fn find_first_served(
        &self,
        scope: ShareScope,
        subject: &Subject,
        remote: &Remote,
        exclude: Option<SocketId>,
    ) -> Option<(Arc<Channel>, SocketId)> {
        self.entries.iter().find_map(|e| match e.socket {
            Some(socket)
                if Some(socket) != exclude
                    && &e.channel.remote == remote
                    && scope.covers(subject, &e.channel.subject) =>
            {
                Some((e.channel.clone(), socket))
            }
            _ => None,
        })
    }

    /// A socket the sharing policy allows `channel` to reuse.
    ///
    /// Outbound channels never share the listener: data read there is only
    /// routed to inbound channels.
    pub(crate) fn shared_socket_for(
        &self,
        channel: &Channel,
        policy: &SharingPolicy,
        listener: Option<SocketId>,
    ) -> Option<SocketId> {
        let exclude = match channel.subject.direction {
            Direction::Out => listener,
            Direction::In => None,
        };
        ShareScope::enabled(policy).into_iter().find_map(|scope| {
            self.find_first_served(scope, &channel.subject, &channel.remote, exclude)
                .map(|(_, socket)| socket)
        })
    }

    /// Inbound channels on the listener that should receive data from `sender`.
    ///
    /// Exact remotes win over `*:port`, which wins over `host:*`, which wins
    /// over `*:*`. All channels in the best matching tier are returned.
    pub(crate) fn find_inbound(&self, listener: SocketId, sender: SocketAddr) -> Vec<Arc<Channel>> {
        let mut best: Option<MatchTier> = None;
        let mut matched = Vec::new();

        for entry in &self.entries {
            if entry.channel.subject.direction != Direction::In || entry.socket != Some(listener) {
                continue;
            }
            let Some(tier) = entry.channel.remote.match_tier(sender) else {
                continue;
            };
            match best {
                Some(current) if tier > current => continue,
                Some(current) if tier == current => {}
                _ => {
                    best = Some(tier);
                    matched.clear();
                }
            }
            matched.push(entry.channel.clone());
        }

        matched
    }

    /// The channel on `socket` whose blocking write was sent and waits for a reply.
    pub(crate) fn awaiting_on_socket(&self, socket: SocketId) -> Option<Arc<Channel>> {
        self.entries
            .iter()
            .find(|e| e.socket == Some(socket) && e.channel.is_awaiting())
            .map(|e| e.channel.clone())
    }

    /// Every socket referenced by at least one channel.
    pub(crate) fn sockets(&self) -> HashSet<SocketId> {
        self.entries.iter().filter_map(|e| e.socket).collect()
    }

    // ============================================================================
    // Socket assignment
    // ============================================================================

    /// Links `channel` to `socket` and shares it with siblings the policy allows.
    ///
    /// Siblings are channels for the same remote, within an enabled sharing
    /// scope, that have no socket yet. The listener is never handed to
    /// outbound siblings.
    pub(crate) fn assign_socket(
        &mut self,
        channel: ChannelId,
        socket: SocketId,
        policy: &SharingPolicy,
        listener: Option<SocketId>,
    ) {
        let Some(index) = self.entries.iter().position(|e| e.channel.id == channel) else {
            return;
        };
        self.entries[index].socket = Some(socket);

        let subject = self.entries[index].channel.subject.clone();
        let remote = self.entries[index].channel.remote;
        let scopes = ShareScope::enabled(policy);
        let is_listener = Some(socket) == listener;

        for entry in self.entries.iter_mut() {
            if entry.socket.is_none()
                && !(is_listener && entry.channel.subject.direction == Direction::Out)
                && entry.channel.remote == remote
                && scopes.iter().any(|scope| scope.covers(&subject, &entry.channel.subject))
            {
                debug!(channel = %entry.channel, socket, "Sharing socket");
                entry.socket = Some(socket);
            }
        }
    }

    /// Rewrites every channel on `old` to use `new`. Returns how many moved.
    pub(crate) fn replace_socket(&mut self, old: SocketId, new: SocketId) -> usize {
        let mut count = 0;
        for entry in self.entries.iter_mut().filter(|e| e.socket == Some(old)) {
            entry.socket = Some(new);
            count += 1;
        }
        count
    }

    pub(crate) fn set_reconnecting(&self, socket: SocketId, reconnecting: bool) {
        for entry in self.entries.iter().filter(|e| e.socket == Some(socket)) {
            entry.channel.set_reconnecting(reconnecting);
        }
    }

    /// Unlinks every channel on `socket`; they get a socket again on next use.
    pub(crate) fn unassign_socket(&mut self, socket: SocketId) {
        for entry in self.entries.iter_mut().filter(|e| e.socket == Some(socket)) {
            entry.socket = None;
            entry.channel.set_reconnecting(false);
        }
    }

    /// Forgets every socket link, keeping the channels.
    pub(crate) fn unassign_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.socket = None;
            entry.channel.set_reconnecting(false);
        }
    }

    /// Removes channels for which `keep` is false and returns them.
    pub(crate) fn retain<F>(&mut self, keep: F) -> Vec<Arc<Channel>>
    where
        F: Fn(&Channel) -> bool,
    {
        let (kept, removed): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|e| keep(&e.channel));
        self.entries = kept;
        removed.into_iter().map(|e| e.channel).collect()
    }

    // ============================================================================
    // Internal Helpers
    // ============================================================================

    fn entry(&self, id: ChannelId) -> Option<&Entry> {
        self.entries.iter().find(|e| e.channel.id == id)
    }

    fn select<F>(&self, predicate: F) -> Vec<Arc<Channel>>
    where
        F: Fn(&Entry) -> bool,
    {
        self.entries
            .iter()
            .filter(|e| predicate(e))
            .map(|e| e.channel.clone())
            .collect()
    }
}
