//! EasySandbox driver
//!
//! Preloads the EasySandbox library, which switches the process into
//! SECCOMP strict mode before `main` runs. In that mode only `read`,
//! `write`, `exit` and `sigreturn` are permitted, so programs that need
//! threads, files or sockets cannot run under this driver.
//!
//! The library prints [`MARKER`](super::marker::MARKER) on stdout and stderr
//! when it engages; [`MarkedCmd`] checks and strips it.

use super::marker::MarkedCmd;
use super::process::ProcessCmd;
use super::{Cmd, Driver};
use crate::config::EasySandboxConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct EasySandboxDriver {
    library: PathBuf,
    heap_size: u64,
}

impl EasySandboxDriver {
    #[must_use]
    pub fn new(config: &EasySandboxConfig) -> Self {
        Self {
            library: config.library.clone(),
            heap_size: config.heap_size,
        }
    }
}

impl Driver for EasySandboxDriver {
    fn command(&self, program: &Path, args: &[String]) -> Box<dyn Cmd> {
        let mut inner = ProcessCmd::new(program, args);
        inner
            .command_mut()
            .env_clear()
            .env("LD_PRELOAD", &self.library)
            .env("EASYSANDBOX_HEAPSIZE", self.heap_size.to_string());
        Box::new(MarkedCmd::new(inner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{OutputBuffer, SandboxError, run_with_timeout};
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    // An empty LD_PRELOAD keeps the loader quiet, so the script alone
    // decides which markers appear.
    fn driver() -> EasySandboxDriver {
        EasySandboxDriver::new(&EasySandboxConfig {
            library: PathBuf::new(),
            heap_size: 1024,
        })
    }

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn environment_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(
            dir.path(),
            "env.sh",
            r#"printf '<<entering SECCOMP mode>>\n'
printf '<<entering SECCOMP mode>>\n' >&2
printf 'heap=%s home=%s\n' "$EASYSANDBOX_HEAPSIZE" "${HOME:-unset}""#,
        );

        let mut cmd = driver().command(&env, &[]);
        let timed = run_with_timeout(cmd.as_mut(), Duration::from_secs(5)).await;
        assert!(timed.error.is_none(), "{:?}", timed.error);
        assert_eq!(timed.output, b"heap=1024 home=unset\n");
    }

    #[tokio::test]
    async fn marker_on_one_stream_only_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let leaky = script(
            dir.path(),
            "leaky.sh",
            r"printf '<<entering SECCOMP mode>>\n'
printf 'TAP version 13\n1..1\nok 1 - escaped\n'",
        );

        let mut cmd = driver().command(&leaky, &[]);
        let timed = run_with_timeout(cmd.as_mut(), Duration::from_secs(5)).await;
        assert!(matches!(timed.error, Some(SandboxError::Integrity(_))));
        assert!(timed.output.is_empty());
    }

    #[tokio::test]
    async fn filter_is_applied_to_sink_contents() {
        let cmd = driver().command(Path::new("/bin/true"), &[]);
        let sink = OutputBuffer::new();
        sink.append(b"no marker");
        assert!(cmd.filter_output(sink.take()).unwrap_err().is_integrity());
    }
}
