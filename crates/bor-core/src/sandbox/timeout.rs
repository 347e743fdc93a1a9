//! Combined-output execution with a hard deadline

use super::{Cmd, OutputBuffer, SandboxError};
use std::time::Duration;

/// Captured output of a finished (or killed) process
#[derive(Debug)]
pub struct TimedOutput {
    /// Combined stdout and stderr, filtered by the driver
    pub output: Vec<u8>,
    /// `None` if the process ran to completion and succeeded
    pub error: Option<SandboxError>,
}

impl TimedOutput {
    const fn failed(output: Vec<u8>, error: SandboxError) -> Self {
        Self {
            output,
            error: Some(error),
        }
    }

    #[must_use]
    pub const fn timed_out(&self) -> bool {
        matches!(self.error, Some(SandboxError::Timeout(_)))
    }
}

/// Run `cmd` to completion, killing it once `timeout` expires
///
/// Stdout and stderr go into one in-memory buffer. On expiry the process
/// group is killed and reaped before returning, and the output captured up
/// to that point is returned together with [`SandboxError::Timeout`].
/// Otherwise a non-zero exit turns into [`SandboxError::Exited`].
///
/// Output is passed through [`Cmd::filter_output`] on every path; if the
/// driver rejects it the output is dropped and its error takes precedence.
pub async fn run_with_timeout(cmd: &mut dyn Cmd, timeout: Duration) -> TimedOutput {
    let sink = OutputBuffer::new();
    cmd.set_output(sink.clone());

    if let Err(e) = cmd.start() {
        return TimedOutput::failed(Vec::new(), e);
    }

    let error = match tokio::time::timeout(timeout, cmd.wait()).await {
        Ok(Ok(state)) if state.success() => None,
        Ok(Ok(state)) => Some(SandboxError::Exited(state)),
        Ok(Err(e)) => Some(e),
        Err(_elapsed) => {
            tracing::debug!(
                program = %cmd.program().display(),
                ?timeout,
                "deadline expired, killing process"
            );
            if let Err(e) = cmd.kill() {
                tracing::warn!(program = %cmd.program().display(), error = %e, "failed to kill process");
            }
            if let Err(e) = cmd.wait().await {
                tracing::warn!(program = %cmd.program().display(), error = %e, "failed to reap process");
            }
            Some(SandboxError::Timeout(timeout))
        }
    };

    match cmd.filter_output(sink.take()) {
        Ok(output) => TimedOutput { output, error },
        Err(rejected) => {
            tracing::warn!(
                program = %cmd.program().display(),
                error = %rejected,
                "discarding untrusted output"
            );
            TimedOutput::failed(Vec::new(), rejected)
        }
    }
}
