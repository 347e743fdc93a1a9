//! Sandbox drivers
//!
//! A driver turns a program and its arguments into a [`Cmd`], a process
//! invocation that has not been started yet. Drivers differ in how much
//! isolation they apply:
//! - `plain` - direct execution, used for the build step
//! - `easysandbox` - SECCOMP strict mode through the EasySandbox preload library
//! - `seccomp` - seccomp-BPF deny filter installed right before exec
//!
//! The restricted drivers prove that isolation engaged by emitting a marker
//! on stdout and stderr ahead of any program output; see [`marker`].

pub mod easysandbox;
pub mod marker;
pub mod plain;
pub mod process;
pub mod registry;
pub mod seccomp;
pub mod timeout;

pub use self::registry::DriverRegistry;
pub use self::timeout::{TimedOutput, run_with_timeout};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("no such sandbox driver: {0}")]
    UnknownDriver(String),

    #[error("sandbox driver {0} already registered")]
    DuplicateDriver(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("process has not been started")]
    NotStarted,

    #[error("process was already started")]
    AlreadyStarted,

    #[error("{0}")]
    Exited(ProcessState),

    #[error("timeout after {0:?}")]
    Timeout(Duration),

    #[error("sandbox integrity violated: {0}")]
    Integrity(&'static str),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether the error means isolation could not be confirmed
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

/// A pluggable isolation backend
pub trait Driver: Send + Sync + fmt::Debug {
    /// Create a not-yet-started invocation of `program`
    fn command(&self, program: &Path, args: &[String]) -> Box<dyn Cmd>;
}

/// One external process invocation
///
/// The lifecycle is `set_dir`/`set_output` → `start` → `wait` (or `kill`
/// followed by `wait`). After `wait` returned, `process_state` is available.
#[async_trait]
pub trait Cmd: Send {
    /// Program this command runs
    fn program(&self) -> &Path;

    /// Working directory of the process
    fn set_dir(&mut self, dir: &Path);

    /// Route stdout and stderr of the process into `sink`
    fn set_output(&mut self, sink: OutputBuffer);

    fn start(&mut self) -> Result<(), SandboxError>;

    /// Wait for the process to terminate
    ///
    /// Cancel safe: dropping the future leaves the process running and a
    /// later call picks up where the previous one stopped.
    async fn wait(&mut self) -> Result<ProcessState, SandboxError>;

    /// Forcibly terminate the process and everything it spawned
    fn kill(&mut self) -> Result<(), SandboxError>;

    fn process_state(&self) -> Option<&ProcessState>;

    /// Turn the raw captured output into trusted program output
    fn filter_output(&self, output: Vec<u8>) -> Result<Vec<u8>, SandboxError> {
        Ok(output)
    }
}

/// Snapshot of a terminated process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessState {
    exit_code: Option<i32>,
    signal: Option<i32>,
    user_time: Duration,
    system_time: Duration,
}

impl ProcessState {
    #[must_use]
    pub const fn new(
        exit_code: Option<i32>,
        signal: Option<i32>,
        user_time: Duration,
        system_time: Duration,
    ) -> Self {
        Self {
            exit_code,
            signal,
            user_time,
            system_time,
        }
    }

    /// Exited normally with status 0
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Signal that terminated the process, if any
    #[must_use]
    pub const fn signal(&self) -> Option<i32> {
        self.signal
    }

    #[must_use]
    pub const fn user_time(&self) -> Duration {
        self.user_time
    }

    #[must_use]
    pub const fn system_time(&self) -> Duration {
        self.system_time
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "exit status {code}"),
            (None, Some(sig)) => match nix::sys::signal::Signal::try_from(sig) {
                Ok(signal) => write!(f, "signal: {}", signal.as_str()),
                Err(_) => write!(f, "signal: {sig}"),
            },
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Most output kept per process; the rest is read and dropped
pub const MAX_CAPTURED_OUTPUT: usize = 8 * 1024 * 1024; // 8MB

/// Growable in-memory sink shared between a process reader and its owner
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes, silently truncating at [`MAX_CAPTURED_OUTPUT`]
    pub fn append(&self, bytes: &[u8]) {
        let mut buf = self.inner.lock();
        let room = MAX_CAPTURED_OUTPUT.saturating_sub(buf.len());
        buf.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    /// Copy of everything captured so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    /// Move the captured bytes out, leaving the buffer empty
    #[must_use]
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_state_display() {
        let exited = ProcessState::new(Some(2), None, Duration::ZERO, Duration::ZERO);
        assert_eq!(exited.to_string(), "exit status 2");
        assert!(!exited.success());

        let killed = ProcessState::new(None, Some(libc::SIGKILL), Duration::ZERO, Duration::ZERO);
        assert_eq!(killed.to_string(), "signal: SIGKILL");
        assert!(!killed.success());

        let ok = ProcessState::new(Some(0), None, Duration::ZERO, Duration::ZERO);
        assert!(ok.success());
    }

    #[test]
    fn output_buffer_truncates() {
        let buf = OutputBuffer::new();
        buf.append(&vec![b'x'; MAX_CAPTURED_OUTPUT - 1]);
        buf.append(b"yz");
        assert_eq!(buf.len(), MAX_CAPTURED_OUTPUT);
        assert_eq!(buf.snapshot().last(), Some(&b'y'));

        let taken = buf.take();
        assert_eq!(taken.len(), MAX_CAPTURED_OUTPUT);
        assert!(buf.is_empty());
    }
}
