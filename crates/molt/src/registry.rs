//! Listener registry: the ordered set of listening sockets owned by this
//! process generation.
//!
//! Ordinals are assigned when a key is first registered and never change.
//! The ordinal is the position of the listener in the descriptor list handed
//! to the next generation, so the registry keeps entries in a `BTreeMap`
//! keyed by ordinal and never derives order from the `HashMap` index.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{HandoverError, Result};

/// Transport protocol of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    /// The `SO_TYPE` a socket of this protocol reports.
    pub(crate) fn socket_type(&self) -> libc::c_int {
        match self {
            Protocol::Tcp => libc::SOCK_STREAM,
            Protocol::Udp => libc::SOCK_DGRAM,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = InvalidKey;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(InvalidKey(format!("unknown protocol {other:?}"))),
        }
    }
}

/// A listener key could not be built or parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid listener key: {0}")]
pub struct InvalidKey(String);

/// Unique identity of a listener: protocol plus the address string the
/// application asked for. Formats as `protocol@address`.
///
/// The address is kept verbatim. `:port` binds every interface: `[::]:port`
/// accepting IPv4 as well, or `0.0.0.0:port` on hosts without IPv6.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerKey {
    protocol: Protocol,
    address: String,
}

impl ListenerKey {
    /// Build a key. The address must be non-empty and free of `,` and `@`,
    /// which delimit keys in the handover environment.
    pub fn new(protocol: Protocol, address: impl Into<String>) -> std::result::Result<Self, InvalidKey> {
        let address = address.into();
        if address.is_empty() {
            return Err(InvalidKey("empty address".to_string()));
        }
        if address.contains(',') || address.contains('@') {
            return Err(InvalidKey(format!(
                "address {address:?} contains a reserved character (',' or '@')"
            )));
        }
        Ok(Self { protocol, address })
    }

    pub fn tcp(address: impl Into<String>) -> std::result::Result<Self, InvalidKey> {
        Self::new(Protocol::Tcp, address)
    }

    pub fn udp(address: impl Into<String>) -> std::result::Result<Self, InvalidKey> {
        Self::new(Protocol::Udp, address)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.protocol, self.address)
    }
}

impl FromStr for ListenerKey {
    type Err = InvalidKey;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (protocol, address) = s
            .split_once('@')
            .ok_or_else(|| InvalidKey(format!("{s:?} is not of the form protocol@address")))?;
        ListenerKey::new(protocol.parse()?, address)
    }
}

/// An OS listening socket held by the registry.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl Socket {
    pub fn protocol(&self) -> Protocol {
        match self {
            Socket::Tcp(_) => Protocol::Tcp,
            Socket::Udp(_) => Protocol::Udp,
        }
    }

    /// Duplicate the descriptor. Both handles refer to the same OS socket.
    pub fn try_clone(&self) -> io::Result<Socket> {
        match self {
            Socket::Tcp(l) => l.try_clone().map(Socket::Tcp),
            Socket::Udp(s) => s.try_clone().map(Socket::Udp),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Socket::Tcp(l) => l.local_addr(),
            Socket::Udp(s) => s.local_addr(),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Socket::Tcp(l) => l.set_nonblocking(nonblocking),
            Socket::Udp(s) => s.set_nonblocking(nonblocking),
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Socket::Tcp(l) => l.as_fd(),
            Socket::Udp(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

/// Outcome of [`Registry::get_or_register`].
#[derive(Debug)]
pub struct Registration {
    /// Ordinal slot of the key in this generation.
    pub ordinal: usize,
    /// A fresh handle onto the registered socket.
    pub handle: Socket,
    /// `true` if the key was already registered and no socket was opened.
    pub reused: bool,
}

#[derive(Debug)]
struct Entry {
    key: ListenerKey,
    socket: Socket,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<usize, Entry>,
    ordinals: HashMap<ListenerKey, usize>,
    next_ordinal: usize,
    sealed: bool,
}

/// The set of listeners owned by one process generation.
///
/// Shared between the acquirer, the respawner and the coordinator via `Arc`.
/// Written only during startup; sealed before any signal is processed.
#[derive(Debug, Default)]
pub struct Registry {
    inner: Mutex<Inner>,
    handed_over: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a handle onto the socket registered for `key`, opening and
    /// registering one with `open` if the key is new.
    ///
    /// `open` returns the socket and, for inherited listeners, the ordinal the
    /// handover table assigned to it. Without a hint the next free ordinal is
    /// used. The lock is held across `open`, so two callers racing on the same
    /// key cannot both open a socket.
    pub fn get_or_register<F>(&self, key: &ListenerKey, open: F) -> Result<Registration>
    where
        F: FnOnce() -> Result<(Socket, Option<usize>)>,
    {
        let mut inner = self.lock();

        if let Some(&ordinal) = inner.ordinals.get(key) {
            let entry = &inner.entries[&ordinal];
            let handle = entry.socket.try_clone().map_err(|source| HandoverError::NotDuplicable {
                key: key.to_string(),
                source,
            })?;
            return Ok(Registration {
                ordinal,
                handle,
                reused: true,
            });
        }

        if inner.sealed {
            return Err(HandoverError::Sealed);
        }

        let (socket, hint) = open()?;
        let ordinal = match hint {
            Some(ordinal) => {
                if let Some(existing) = inner.entries.get(&ordinal) {
                    return Err(HandoverError::adoption(
                        key,
                        format!("ordinal {ordinal} is already held by {}", existing.key),
                    ));
                }
                inner.next_ordinal = inner.next_ordinal.max(ordinal + 1);
                ordinal
            }
            None => {
                let ordinal = inner.next_ordinal;
                inner.next_ordinal += 1;
                ordinal
            }
        };

        let handle = socket.try_clone().map_err(|source| HandoverError::NotDuplicable {
            key: key.to_string(),
            source,
        })?;

        inner.ordinals.insert(key.clone(), ordinal);
        inner.entries.insert(
            ordinal,
            Entry {
                key: key.clone(),
                socket,
            },
        );

        Ok(Registration {
            ordinal,
            handle,
            reused: false,
        })
    }

    pub fn ordinal_of(&self, key: &ListenerKey) -> Option<usize> {
        self.lock().ordinals.get(key).copied()
    }

    pub fn contains(&self, key: &ListenerKey) -> bool {
        self.lock().ordinals.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered keys in ordinal order.
    pub fn keys(&self) -> Vec<ListenerKey> {
        self.lock().entries.values().map(|e| e.key.clone()).collect()
    }

    /// Stop accepting new keys. Lookups of existing keys keep working.
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Walk every entry in ordinal order while holding the lock, so the walk
    /// is a consistent snapshot.
    pub fn visit_in_order<T, F>(&self, mut f: F) -> Result<Vec<T>>
    where
        F: FnMut(usize, &ListenerKey, BorrowedFd<'_>) -> Result<T>,
    {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .map(|(&ordinal, entry)| f(ordinal, &entry.key, entry.socket.as_fd()))
            .collect()
    }

    /// Mark that a successor is being launched from this generation.
    ///
    /// Only the first call succeeds; a generation hands over at most once.
    pub fn begin_handover(&self) -> Result<()> {
        if self.handed_over.swap(true, Ordering::SeqCst) {
            return Err(HandoverError::ReloadInProgress);
        }
        Ok(())
    }

    pub fn handover_started(&self) -> bool {
        self.handed_over.load(Ordering::SeqCst)
    }
}
