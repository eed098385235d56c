//! Launching the successor generation.
//!
//! Three stages, each usable on its own:
//!
//! 1. [`extract_descriptors`] duplicates every registered socket, in ordinal order
//! 2. [`codec::encode`] turns the ordered keys into handover variables
//! 3. [`spawn_successor`] starts the same binary with descriptor `i` at `3 + i`
//!
//! The spawn does not wait for the child. Success means the OS accepted it.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use tracing::info;

use crate::codec::{self, DESCRIPTOR_BASE};
use crate::error::{HandoverError, Result};
use crate::registry::{ListenerKey, Registry};

/// Extracted descriptors are parked at or above this number so the child's
/// `dup2` into `3..3 + n` never overwrites a source it still needs.
const TEMP_DESCRIPTOR_FLOOR: RawFd = 100;

/// One listener on its way to the successor.
#[derive(Debug)]
pub struct Inherited {
    pub key: ListenerKey,
    /// A close-on-exec duplicate of the registered socket.
    pub fd: OwnedFd,
}

/// Duplicate every registered socket in ordinal order.
///
/// Each duplicate is close-on-exec and lives at or above
/// `max(100, 3 + n)`, outside the range the child maps them into.
pub fn extract_descriptors(registry: &Registry) -> Result<Vec<Inherited>> {
    let floor = TEMP_DESCRIPTOR_FLOOR.max(DESCRIPTOR_BASE + registry.len() as RawFd);

    registry.visit_in_order(|_, key, fd| {
        // SAFETY: `fd` is borrowed from a live registry entry.
        let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
        if raw < 0 {
            return Err(HandoverError::NotDuplicable {
                key: key.to_string(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Inherited {
            key: key.clone(),
            // SAFETY: `raw` was just returned by fcntl and is owned by nobody else.
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    })
}

/// What to launch as the successor.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Descriptor the first inherited socket lands on in the child.
    pub base: RawFd,
}

impl SpawnSpec {
    pub fn new<I, A>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            base: DESCRIPTOR_BASE,
        }
    }

    /// Re-run this process: `argv[0]` with the same arguments.
    ///
    /// Falls back to `current_exe()` only when `argv[0]` is missing. On Linux
    /// that resolves through `/proc/self/exe`, which still names the old inode
    /// after the binary on disk has been replaced.
    pub fn current() -> Result<Self> {
        let mut argv = std::env::args_os();
        let program = match argv.next().filter(|p| !p.is_empty()) {
            Some(program) => PathBuf::from(program),
            None => std::env::current_exe().map_err(HandoverError::Spawn)?,
        };
        Ok(Self::new(program, argv))
    }
}

/// Start `spec` with `descriptors` mapped to `spec.base + i` and `env`
/// merged over the current environment. Standard streams are inherited.
pub fn spawn_successor(
    spec: &SpawnSpec,
    descriptors: &[Inherited],
    env: &[(&str, String)],
) -> Result<Child> {
    let sources: Vec<RawFd> = descriptors.iter().map(|d| d.fd.as_raw_fd()).collect();
    let base = spec.base;

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(env.iter().map(|(name, value)| (*name, value.as_str())))
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: the hook runs between fork and exec and only calls dup2, which
    // is async-signal-safe. `sources` was allocated before the fork.
    unsafe {
        command.pre_exec(move || {
            for (i, &source) in sources.iter().enumerate() {
                // dup2 leaves the target without FD_CLOEXEC, so it survives exec.
                if libc::dup2(source, base + i as RawFd) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    // Command reports exec failure over a pipe that takes the lowest free
    // descriptors. Keep it out of the range the hook overwrites.
    let placeholders = reserve_targets(base, descriptors.len())?;
    let spawned = command.spawn().map_err(HandoverError::Spawn);
    drop(placeholders);
    spawned
}

/// Occupy every free descriptor in `base..base + count` with a close-on-exec
/// handle to `/dev/null`. The handles free the slots again when dropped.
fn reserve_targets(base: RawFd, count: usize) -> Result<Vec<OwnedFd>> {
    let null = OwnedFd::from(File::open("/dev/null").map_err(HandoverError::Spawn)?);
    let mut placeholders = Vec::with_capacity(count + 1);

    for target in base..base + count as RawFd {
        // SAFETY: F_GETFD only inspects the descriptor table.
        if unsafe { libc::fcntl(target, libc::F_GETFD) } >= 0 {
            continue;
        }
        // SAFETY: `null` is open; the result is a new descriptor we own.
        let raw = unsafe { libc::fcntl(null.as_raw_fd(), libc::F_DUPFD_CLOEXEC, target) };
        if raw < 0 {
            return Err(HandoverError::Spawn(io::Error::last_os_error()));
        }
        // SAFETY: `raw` was just returned by fcntl and is owned by nobody else.
        placeholders.push(unsafe { OwnedFd::from_raw_fd(raw) });
    }

    placeholders.push(null);
    Ok(placeholders)
}

/// Launches a successor generation. The seam between the signal coordinator
/// and the process machinery.
pub trait Respawn: Send + Sync {
    /// Start the successor and return its pid.
    fn respawn(&self) -> Result<u32>;
}

/// Respawns the current binary with every listener in a [`Registry`].
#[derive(Debug, Clone)]
pub struct Respawner {
    registry: Arc<Registry>,
    spec: SpawnSpec,
}

impl Respawner {
    pub fn new(registry: Arc<Registry>, spec: SpawnSpec) -> Self {
        Self { registry, spec }
    }

    pub fn for_current_process(registry: Arc<Registry>) -> Result<Self> {
        Ok(Self::new(registry, SpawnSpec::current()?))
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }
}

impl Respawn for Respawner {
    fn respawn(&self) -> Result<u32> {
        self.registry.begin_handover()?;

        let descriptors = extract_descriptors(&self.registry)?;
        let keys: Vec<ListenerKey> = descriptors.iter().map(|d| d.key.clone()).collect();
        let env = codec::encode(&keys);

        info!(
            program = %self.spec.program.display(),
            listeners = ?keys.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Spawning successor generation"
        );

        let child = spawn_successor(&self.spec, &descriptors, &env)?;
        let pid = child.id();

        // The child holds its own copies now.
        drop(descriptors);

        info!(pid, "Successor spawned");
        Ok(pid)
    }
}
