//! Real sockets behind the channels.
//!
//! A [`Socket`] wraps one mio source together with the bookkeeping the poll
//! cycle needs: its role, its reconnect state and its current interest set.

use crate::config::TransportKind;
use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Interest, Poll, Token};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug)]
pub(crate) enum SocketIo {
    Datagram(UdpSocket),
    Stream(TcpStream),
    Acceptor(TcpListener),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketRole {
    /// The well-known socket serving inbound channels.
    Listener,
    /// Connected to the remote of one or more outbound channels.
    Outbound,
    /// A stream accepted by the listener.
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketState {
    Active,
    /// Stream connect in flight, completes on first writability.
    Connecting,
    ReconnectScheduled,
    ReconnectInProgress,
}

#[derive(Debug)]
pub(crate) struct Socket {
    pub(crate) io: SocketIo,
    pub(crate) role: SocketRole,
    pub(crate) state: SocketState,
    pub(crate) interest: Interest,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: Option<SocketAddr>,
}

impl Socket {
    /// Binds the listener socket for `kind` on `addr`.
    pub(crate) fn listen(kind: TransportKind, addr: SocketAddr) -> io::Result<Self> {
        let io = match kind {
            TransportKind::Udp => SocketIo::Datagram(UdpSocket::bind(addr)?),
            TransportKind::Tcp => SocketIo::Acceptor(TcpListener::bind(addr)?),
        };
        let local_addr = io.local_addr()?;
        Ok(Self {
            io,
            role: SocketRole::Listener,
            state: SocketState::Active,
            interest: Interest::READABLE,
            local_addr,
            peer_addr: None,
        })
    }

    /// Opens a fresh outbound socket to `remote`.
    ///
    /// Datagram sockets are bound to an ephemeral port and connected right
    /// away. Stream sockets start out [`SocketState::Connecting`].
    pub(crate) fn connect(kind: TransportKind, remote: SocketAddr) -> io::Result<Self> {
        let (io, state, interest) = match kind {
            TransportKind::Udp => {
                let socket = UdpSocket::bind(unspecified_like(remote))?;
                socket.connect(remote)?;
                (
                    SocketIo::Datagram(socket),
                    SocketState::Active,
                    Interest::READABLE,
                )
            }
            TransportKind::Tcp => {
                let stream = TcpStream::connect(remote)?;
                stream.set_nodelay(true)?;
                (
                    SocketIo::Stream(stream),
                    SocketState::Connecting,
                    Interest::WRITABLE,
                )
            }
        };
        let local_addr = io.local_addr()?;
        Ok(Self {
            io,
            role: SocketRole::Outbound,
            state,
            interest,
            local_addr,
            peer_addr: Some(remote),
        })
    }

    pub(crate) fn accepted(stream: TcpStream, peer_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let io = SocketIo::Stream(stream);
        let local_addr = io.local_addr()?;
        Ok(Self {
            io,
            role: SocketRole::Accepted,
            state: SocketState::Active,
            interest: Interest::READABLE,
            local_addr,
            peer_addr: Some(peer_addr),
        })
    }

    /// True unless the socket failed and waits for a reconnect.
    pub(crate) fn is_live(&self) -> bool {
        matches!(self.state, SocketState::Active | SocketState::Connecting)
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self.io, SocketIo::Stream(_))
    }

    pub(crate) fn register(&mut self, poll: &Poll, id: usize) -> io::Result<()> {
        let interest = self.interest;
        poll.registry().register(self.source(), Token(id), interest)
    }

    pub(crate) fn deregister(&mut self, poll: &Poll) -> io::Result<()> {
        poll.registry().deregister(self.source())
    }

    /// Switches the interest set, touching the registration only on change.
    pub(crate) fn set_interest(&mut self, poll: &Poll, id: usize, interest: Interest) -> io::Result<()> {
        if self.interest == interest {
            return Ok(());
        }
        self.interest = interest;
        poll.registry().reregister(self.source(), Token(id), interest)
    }

    fn source(&mut self) -> &mut dyn Source {
        match &mut self.io {
            SocketIo::Datagram(socket) => socket,
            SocketIo::Stream(stream) => stream,
            SocketIo::Acceptor(listener) => listener,
        }
    }
}

impl SocketIo {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SocketIo::Datagram(socket) => socket.local_addr(),
            SocketIo::Stream(stream) => stream.local_addr(),
            SocketIo::Acceptor(listener) => listener.local_addr(),
        }
    }
}

// Ephemeral local address of the same family as `remote`.
fn unspecified_like(remote: SocketAddr) -> SocketAddr {
    let ip = match remote.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
