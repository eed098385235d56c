//! Listener acquisition: bind fresh, or adopt what the parent handed down.
//!
//! A first-generation process binds every listener itself. A successor must
//! find every listener it asks for in the inherited slot table and never
//! falls back to binding.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Type};
use tracing::{debug, info, warn};

use crate::codec::{is_socket, Inheritance, SlotTable};
use crate::error::{HandoverError, Result};
use crate::registry::{ListenerKey, Protocol, Registry, Socket};

/// Backlog for listeners bound through socket2, matching std's.
const LISTEN_BACKLOG: i32 = 128;

/// Opens or adopts listeners and records them in a [`Registry`].
#[derive(Debug)]
pub struct Acquirer {
    registry: Arc<Registry>,
    inheritance: Inheritance,
    finished: AtomicBool,
}

impl Acquirer {
    pub fn new(registry: Arc<Registry>, inheritance: Inheritance) -> Self {
        Self {
            registry,
            inheritance,
            finished: AtomicBool::new(false),
        }
    }

    /// Acquirer for this process, reading the handover environment.
    pub fn from_env(registry: Arc<Registry>) -> Result<Self> {
        Ok(Self::new(registry, Inheritance::from_env()?))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn inheritance(&self) -> &Inheritance {
        &self.inheritance
    }

    /// Acquire a TCP listener for `address`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire_tcp(&self, address: &str) -> Result<tokio::net::TcpListener> {
        let key = build_key(Protocol::Tcp, address)?;
        match self.acquire_key(&key)? {
            Socket::Tcp(listener) => tokio::net::TcpListener::from_std(listener)
                .map_err(|e| self.conversion_error(&key, e)),
            Socket::Udp(_) => Err(HandoverError::adoption(&key, "registered socket is not TCP")),
        }
    }

    /// Acquire a UDP socket for `address`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn acquire_udp(&self, address: &str) -> Result<tokio::net::UdpSocket> {
        let key = build_key(Protocol::Udp, address)?;
        match self.acquire_key(&key)? {
            Socket::Udp(socket) => tokio::net::UdpSocket::from_std(socket)
                .map_err(|e| self.conversion_error(&key, e)),
            Socket::Tcp(_) => Err(HandoverError::adoption(&key, "registered socket is not UDP")),
        }
    }

    /// Acquire the non-blocking std socket for `(protocol, address)`.
    pub fn acquire(&self, protocol: Protocol, address: &str) -> Result<Socket> {
        let key = build_key(protocol, address)?;
        self.acquire_key(&key)
    }

    /// Acquire by key. Repeated calls for one key return handles onto the
    /// same OS socket and keep its ordinal.
    pub fn acquire_key(&self, key: &ListenerKey) -> Result<Socket> {
        let registration = self.registry.get_or_register(key, || match &self.inheritance {
            Inheritance::Fresh => bind(key).map(|socket| (socket, None)),
            Inheritance::Inherited(table) => {
                adopt(table, key).map(|(socket, offset)| (socket, Some(offset)))
            }
        })?;

        if !registration.reused {
            info!(
                key = %key,
                ordinal = registration.ordinal,
                addr = ?registration.handle.local_addr().ok(),
                inherited = self.inheritance.is_inherited(),
                "Acquired listener"
            );
        }

        Ok(registration.handle)
    }

    /// End the acquisition phase.
    ///
    /// Seals the registry. In a successor, closes every inherited descriptor
    /// no key claimed and fails with [`HandoverError::UnclaimedInherited`].
    /// Calling it again is a no-op.
    pub fn finish(&self) -> Result<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.registry.seal();

        let Some(table) = self.inheritance.slot_table() else {
            return Ok(());
        };

        let mut unclaimed = Vec::new();
        for (_, key, fd) in table.slots() {
            if self.registry.contains(key) {
                continue;
            }
            if is_socket(fd) {
                // SAFETY: the descriptor was inherited for this key and no
                // listener took ownership of it.
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
            }
            warn!(key = %key, fd, "Closed inherited listener that was never acquired");
            unclaimed.push(key.to_string());
        }

        if unclaimed.is_empty() {
            Ok(())
        } else {
            Err(HandoverError::UnclaimedInherited(unclaimed))
        }
    }

    fn conversion_error(&self, key: &ListenerKey, source: io::Error) -> HandoverError {
        match self.inheritance {
            Inheritance::Fresh => HandoverError::Bind {
                key: key.to_string(),
                source,
            },
            Inheritance::Inherited(_) => HandoverError::adoption(key, source.to_string()),
        }
    }
}

fn build_key(protocol: Protocol, address: &str) -> Result<ListenerKey> {
    ListenerKey::new(protocol, address).map_err(|e| HandoverError::Bind {
        key: format!("{protocol}@{address}"),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

/// Port of a `:port` shorthand address, or `None` for a full address.
fn shorthand_port(address: &str) -> Option<&str> {
    address.strip_prefix(':')
}

fn bind(key: &ListenerKey) -> Result<Socket> {
    let bind_error = |source| HandoverError::Bind {
        key: key.to_string(),
        source,
    };

    let socket = match shorthand_port(key.address()) {
        Some(port) => {
            let port: u16 = port
                .parse()
                .map_err(|e| bind_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
            bind_all_interfaces(key.protocol(), port).map_err(bind_error)?
        }
        None => match key.protocol() {
            Protocol::Tcp => Socket::Tcp(TcpListener::bind(key.address()).map_err(bind_error)?),
            Protocol::Udp => Socket::Udp(UdpSocket::bind(key.address()).map_err(bind_error)?),
        },
    };
    socket.set_nonblocking(true).map_err(bind_error)?;
    Ok(socket)
}

/// Bind `[::]:port` accepting IPv4 too, or `0.0.0.0:port` on hosts without
/// IPv6.
fn bind_all_interfaces(protocol: Protocol, port: u16) -> io::Result<Socket> {
    match bind_dual_stack(protocol, port) {
        Err(e) if ipv6_unavailable(&e) => {
            debug!(port, error = %e, "IPv6 unavailable, binding IPv4 only");
            let address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            Ok(match protocol {
                Protocol::Tcp => Socket::Tcp(TcpListener::bind(address)?),
                Protocol::Udp => Socket::Udp(UdpSocket::bind(address)?),
            })
        }
        result => result,
    }
}

fn bind_dual_stack(protocol: Protocol, port: u16) -> io::Result<Socket> {
    let (kind, ip_protocol) = match protocol {
        Protocol::Tcp => (Type::STREAM, socket2::Protocol::TCP),
        Protocol::Udp => (Type::DGRAM, socket2::Protocol::UDP),
    };
    let socket = socket2::Socket::new(Domain::IPV6, kind, Some(ip_protocol))?;
    socket.set_only_v6(false)?;
    if protocol == Protocol::Tcp {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)).into())?;

    Ok(match protocol {
        Protocol::Tcp => {
            socket.listen(LISTEN_BACKLOG)?;
            Socket::Tcp(socket.into())
        }
        Protocol::Udp => Socket::Udp(socket.into()),
    })
}

fn ipv6_unavailable(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EAFNOSUPPORT | libc::EADDRNOTAVAIL | libc::EPROTONOSUPPORT)
    )
}

fn adopt(table: &SlotTable, key: &ListenerKey) -> Result<(Socket, usize)> {
    let offset = table
        .offset_of(key)
        .ok_or_else(|| HandoverError::adoption(key, "not present in the inherited listener table"))?;
    let fd = table.descriptor_at(offset);

    if !is_socket(fd) {
        return Err(HandoverError::adoption(
            key,
            format!("descriptor {fd} is not an open socket"),
        ));
    }

    let socket_type = getsockopt_int(fd, libc::SO_TYPE)
        .map_err(|e| HandoverError::adoption(key, format!("SO_TYPE on descriptor {fd}: {e}")))?;
    if socket_type != key.protocol().socket_type() {
        return Err(HandoverError::adoption(
            key,
            format!(
                "descriptor {fd} has socket type {socket_type}, expected a {} socket",
                key.protocol()
            ),
        ));
    }

    if key.protocol() == Protocol::Tcp {
        let listening = getsockopt_int(fd, libc::SO_ACCEPTCONN).map_err(|e| {
            HandoverError::adoption(key, format!("SO_ACCEPTCONN on descriptor {fd}: {e}"))
        })?;
        if listening == 0 {
            return Err(HandoverError::adoption(
                key,
                format!("descriptor {fd} is not a listening socket"),
            ));
        }
    }

    set_cloexec(fd).map_err(|e| HandoverError::adoption(key, format!("FD_CLOEXEC on {fd}: {e}")))?;

    // SAFETY: `fd` is an open socket of the expected type that was inherited
    // for this key. The registry ensures each key is adopted at most once, so
    // ownership is taken exactly once.
    let socket = unsafe {
        match key.protocol() {
            Protocol::Tcp => Socket::Tcp(TcpListener::from_raw_fd(fd)),
            Protocol::Udp => Socket::Udp(UdpSocket::from_raw_fd(fd)),
        }
    };
    socket
        .set_nonblocking(true)
        .map_err(|e| HandoverError::adoption(key, e.to_string()))?;

    Ok((socket, offset))
}

fn getsockopt_int(fd: RawFd, option: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `len` are valid for writes of a c_int.
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
