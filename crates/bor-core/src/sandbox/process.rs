//! Host process execution shared by all drivers
//!
//! Children run in their own process group so that a kill also takes down
//! whatever they spawned (`make` forks compilers). They are reaped with
//! `wait4` to obtain CPU-time accounting.

use super::{Cmd, OutputBuffer, ProcessState, SandboxError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;

/// How long to keep reading output after the process exited. A descendant
/// that escaped the process group may hold the pipe open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// A process started directly on the host
#[derive(Debug)]
pub struct ProcessCmd {
    command: Command,
    program: PathBuf,
    sink: Option<OutputBuffer>,
    running: Option<Running>,
    state: Option<ProcessState>,
}

#[derive(Debug)]
struct Running {
    pid: Pid,
    waiter: JoinHandle<io::Result<ProcessState>>,
    reader: Option<JoinHandle<()>>,
}

impl ProcessCmd {
    pub fn new(program: &Path, args: &[String]) -> Self {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);

        Self {
            command,
            program: program.to_path_buf(),
            sink: None,
            running: None,
            state: None,
        }
    }

    /// Access the underlying command before start (environment, pre-exec hooks)
    pub fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    /// Process id while the process is running
    #[must_use]
    pub fn pid(&self) -> Option<i32> {
        self.running.as_ref().map(|r| r.pid.as_raw())
    }
}

#[async_trait]
impl Cmd for ProcessCmd {
    fn program(&self) -> &Path {
        &self.program
    }

    fn set_dir(&mut self, dir: &Path) {
        self.command.current_dir(dir);
    }

    fn set_output(&mut self, sink: OutputBuffer) {
        self.sink = Some(sink);
    }

    fn start(&mut self) -> Result<(), SandboxError> {
        if self.running.is_some() || self.state.is_some() {
            return Err(SandboxError::AlreadyStarted);
        }

        let receiver = match &self.sink {
            Some(_) => {
                let (read_end, write_end) = create_pipe()?;
                let stderr_end = write_end.try_clone()?;
                self.command
                    .stdout(Stdio::from(write_end))
                    .stderr(Stdio::from(stderr_end));
                Some(pipe::Receiver::from_owned_fd(read_end)?)
            }
            None => None,
        };

        let spawned = self.command.spawn();

        // Drop our copies of the write ends, otherwise the reader never sees EOF
        self.command.stdout(Stdio::null()).stderr(Stdio::null());

        let child = spawned.map_err(|source| SandboxError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let pid = Pid::from_raw(
            i32::try_from(child.id()).map_err(|e| SandboxError::Driver(e.to_string()))?,
        );
        // `Child` neither waits nor kills on drop; the waiter below reaps it.
        drop(child);

        tracing::debug!(program = %self.program.display(), pid = pid.as_raw(), "process started");

        let reader = receiver.zip(self.sink.clone()).map(|(rx, sink)| {
            tokio::spawn(read_output(rx, sink))
        });
        let waiter = tokio::task::spawn_blocking(move || reap(pid));

        self.running = Some(Running {
            pid,
            waiter,
            reader,
        });
        Ok(())
    }

    async fn wait(&mut self) -> Result<ProcessState, SandboxError> {
        if self.state.is_none() {
            let running = self.running.as_mut().ok_or(SandboxError::NotStarted)?;
            let joined = (&mut running.waiter).await;

            let state = match joined {
                Ok(Ok(state)) => state,
                Ok(Err(e)) => {
                    self.abandon();
                    return Err(SandboxError::Io(e));
                }
                Err(e) => {
                    self.abandon();
                    return Err(SandboxError::Io(io::Error::other(e)));
                }
            };

            tracing::debug!(
                program = %self.program.display(),
                status = %state,
                user_time = ?state.user_time(),
                system_time = ?state.system_time(),
                "process terminated"
            );
            self.state = Some(state);
        }

        if let Some(reader) = self.running.as_mut().and_then(|r| r.reader.as_mut()) {
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut *reader).await.is_err() {
                tracing::debug!(program = %self.program.display(), "output still open after exit");
                reader.abort();
            }
        }
        self.running = None;

        self.state.clone().ok_or(SandboxError::NotStarted)
    }

    fn kill(&mut self) -> Result<(), SandboxError> {
        let Some(running) = &self.running else {
            return if self.state.is_some() {
                Ok(())
            } else {
                Err(SandboxError::NotStarted)
            };
        };

        // Once reaped the pid may belong to someone else
        if self.state.is_some() || running.waiter.is_finished() {
            return Ok(());
        }

        tracing::debug!(pid = running.pid.as_raw(), "killing process group");
        for result in [
            signal::kill(running.pid, Signal::SIGKILL),
            signal::killpg(running.pid, Signal::SIGKILL),
        ] {
            match result {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => return Err(SandboxError::Io(e.into())),
            }
        }
        Ok(())
    }

    fn process_state(&self) -> Option<&ProcessState> {
        self.state.as_ref()
    }
}

impl ProcessCmd {
    fn abandon(&mut self) {
        if let Some(running) = self.running.take() {
            if let Some(reader) = running.reader {
                reader.abort();
            }
        }
    }
}

/// Create a pipe (returns read end, write end)
fn create_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)
}

async fn read_output(mut rx: pipe::Receiver, sink: OutputBuffer) {
    let mut buf = vec![0u8; 8192];
    loop {
        match rx.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.append(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::debug!(error = %e, "reading process output failed");
                break;
            }
        }
    }
}

/// Block until `pid` terminates and collect its resource usage
#[allow(unsafe_code)]
fn reap(pid: Pid) -> io::Result<ProcessState> {
    let mut status: libc::c_int = 0;
    // SAFETY: an all-zero rusage is a valid value for wait4 to overwrite
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        // SAFETY: status and usage are valid, exclusively borrowed out-parameters
        let ret = unsafe { libc::wait4(pid.as_raw(), &raw mut status, 0, &raw mut usage) };
        if ret >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let (exit_code, signal) = if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    };

    Ok(ProcessState::new(
        exit_code,
        signal,
        timeval_to_duration(usage.ru_utime),
        timeval_to_duration(usage.ru_stime),
    ))
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}
