//! Handover environment encoding.
//!
//! A successor learns about its inherited listeners from two variables:
//!
//! - `MOLT_INHERITED`: `true` when the parent passed listeners down
//! - `MOLT_LISTENERS`: comma-joined `protocol@address` keys
//!
//! The key at position `i` owns descriptor `DESCRIPTOR_BASE + i`. Descriptors
//! 0-2 are the standard streams.

use std::os::unix::io::RawFd;

use tracing::debug;

use crate::error::{HandoverError, Result};
use crate::registry::ListenerKey;

/// Set to `true` in a successor's environment.
pub const ENV_INHERITED: &str = "MOLT_INHERITED";

/// Ordered, comma-separated listener keys.
pub const ENV_LISTENERS: &str = "MOLT_LISTENERS";

/// First inherited descriptor, immediately after stdin, stdout and stderr.
pub const DESCRIPTOR_BASE: RawFd = 3;

/// Which generation this process is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inheritance {
    /// First generation: bind every listener fresh.
    Fresh,
    /// Successor: adopt listeners from the slot table.
    Inherited(SlotTable),
}

/// Maps each inherited key to the descriptor it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable {
    base: RawFd,
    keys: Vec<ListenerKey>,
}

impl SlotTable {
    pub fn new(keys: Vec<ListenerKey>) -> Self {
        Self::with_base(DESCRIPTOR_BASE, keys)
    }

    /// Slot table whose first descriptor is `base` rather than 3.
    pub fn with_base(base: RawFd, keys: Vec<ListenerKey>) -> Self {
        Self { base, keys }
    }

    pub fn base(&self) -> RawFd {
        self.base
    }

    pub fn keys(&self) -> &[ListenerKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Position of `key` in the inherited list.
    pub fn offset_of(&self, key: &ListenerKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// Descriptor carrying `key`, if it was inherited.
    pub fn descriptor_of(&self, key: &ListenerKey) -> Option<RawFd> {
        self.offset_of(key).map(|offset| self.descriptor_at(offset))
    }

    pub fn descriptor_at(&self, offset: usize) -> RawFd {
        self.base + offset as RawFd
    }

    /// Every slot as `(offset, key, descriptor)`.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &ListenerKey, RawFd)> + '_ {
        self.keys
            .iter()
            .enumerate()
            .map(|(offset, key)| (offset, key, self.descriptor_at(offset)))
    }
}

impl Inheritance {
    /// Read and validate the handover environment of this process.
    ///
    /// Every listed key must have a live socket at its descriptor. On success
    /// both variables are removed from the process environment so processes
    /// spawned later by the application do not see stale values.
    pub fn from_env() -> Result<Self> {
        let flag = std::env::var(ENV_INHERITED).ok();
        let list = std::env::var(ENV_LISTENERS).ok();
        let inheritance = Self::from_values(flag.as_deref(), list.as_deref())?;

        std::env::remove_var(ENV_INHERITED);
        std::env::remove_var(ENV_LISTENERS);

        Ok(inheritance)
    }

    /// [`decode`] the raw variable values, then [`verify`](Self::verify) the
    /// descriptors behind them.
    pub fn from_values(flag: Option<&str>, list: Option<&str>) -> Result<Self> {
        let inheritance = decode(flag, list)?;
        inheritance.verify()?;
        if let Inheritance::Inherited(table) = &inheritance {
            debug!(keys = ?table.keys(), "Decoded inherited listener table");
        }
        Ok(inheritance)
    }

    /// Check that every slot has a live socket at its descriptor.
    pub fn verify(&self) -> Result<()> {
        let Some(table) = self.slot_table() else {
            return Ok(());
        };
        for (_, key, fd) in table.slots() {
            if !is_socket(fd) {
                return Err(HandoverError::MalformedEnvironment(format!(
                    "{key} has no inherited socket at descriptor {fd}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_inherited(&self) -> bool {
        matches!(self, Inheritance::Inherited(_))
    }

    pub fn slot_table(&self) -> Option<&SlotTable> {
        match self {
            Inheritance::Fresh => None,
            Inheritance::Inherited(table) => Some(table),
        }
    }
}

/// Decode the handover variables. Pure: takes the raw values, not the process
/// environment.
pub fn decode(flag: Option<&str>, list: Option<&str>) -> Result<Inheritance> {
    if !parse_flag(flag)? {
        return Ok(Inheritance::Fresh);
    }

    let list = list.ok_or_else(|| {
        HandoverError::MalformedEnvironment(format!("{ENV_INHERITED} is set but {ENV_LISTENERS} is missing"))
    })?;

    // An empty list is how a parent with no listeners encodes itself.
    if list.is_empty() {
        return Ok(Inheritance::Inherited(SlotTable::new(Vec::new())));
    }

    let mut keys: Vec<ListenerKey> = Vec::new();
    for (position, raw) in list.split(',').enumerate() {
        if raw.is_empty() {
            return Err(HandoverError::MalformedEnvironment(format!(
                "{ENV_LISTENERS} has an empty entry at position {position}"
            )));
        }
        let key: ListenerKey = raw
            .parse()
            .map_err(|e| HandoverError::MalformedEnvironment(format!("{ENV_LISTENERS}[{position}]: {e}")))?;
        if keys.contains(&key) {
            return Err(HandoverError::MalformedEnvironment(format!(
                "{ENV_LISTENERS} lists {key} twice"
            )));
        }
        keys.push(key);
    }

    Ok(Inheritance::Inherited(SlotTable::new(keys)))
}

/// Environment assignments that hand `keys` to the next generation, in order.
pub fn encode(keys: &[ListenerKey]) -> Vec<(&'static str, String)> {
    let list = keys
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    vec![(ENV_INHERITED, "true".to_string()), (ENV_LISTENERS, list)]
}

fn parse_flag(flag: Option<&str>) -> Result<bool> {
    match flag {
        None | Some("") | Some("false") | Some("0") => Ok(false),
        Some("true") | Some("1") => Ok(true),
        Some(other) => Err(HandoverError::MalformedEnvironment(format!(
            "{ENV_INHERITED} has unrecognised value {other:?}"
        ))),
    }
}

/// `true` if `fd` is an open socket.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fstat only writes into `stat`; an invalid fd yields an error.
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
