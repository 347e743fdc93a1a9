//! Isolation marker handling for restricted drivers
//!
//! A restricted process writes [`MARKER`] once to stdout and once to stderr
//! before any program output. Both streams share one pipe, so trusted output
//! starts with exactly two markers. Output missing either of them came from a
//! process that never entered restricted mode and is discarded.

use super::process::ProcessCmd;
use super::{Cmd, OutputBuffer, ProcessState, SandboxError};
use async_trait::async_trait;
use std::path::Path;

/// Marker announced by a process once restriction is active
pub const MARKER: &[u8] = b"<<entering SECCOMP mode>>\n";

/// Strip the two leading markers, one at a time
pub fn strip_markers(mut output: Vec<u8>) -> Result<Vec<u8>, SandboxError> {
    if !output.starts_with(MARKER) {
        return Err(SandboxError::Integrity("marker not found"));
    }
    if !output[MARKER.len()..].starts_with(MARKER) {
        return Err(SandboxError::Integrity("marker found only once"));
    }
    output.drain(..2 * MARKER.len());
    Ok(output)
}

/// A host process whose output must carry the isolation marker
#[derive(Debug)]
pub struct MarkedCmd {
    inner: ProcessCmd,
}

impl MarkedCmd {
    pub const fn new(inner: ProcessCmd) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Cmd for MarkedCmd {
    fn program(&self) -> &Path {
        self.inner.program()
    }

    fn set_dir(&mut self, dir: &Path) {
        self.inner.set_dir(dir);
    }

    fn set_output(&mut self, sink: OutputBuffer) {
        self.inner.set_output(sink);
    }

    fn start(&mut self) -> Result<(), SandboxError> {
        self.inner.start()
    }

    async fn wait(&mut self) -> Result<ProcessState, SandboxError> {
        self.inner.wait().await
    }

    fn kill(&mut self) -> Result<(), SandboxError> {
        self.inner.kill()
    }

    fn process_state(&self) -> Option<&ProcessState> {
        self.inner.process_state()
    }

    fn filter_output(&self, output: Vec<u8>) -> Result<Vec<u8>, SandboxError> {
        strip_markers(output)
    }
}
