//! Seccomp-BPF driver
//!
//! Installs a deny filter in the child right before `exec`. Unlike
//! EasySandbox strict mode this keeps ordinary file and memory syscalls
//! available, and only rejects the ones a unit test has no business making:
//! networking, process creation via fork, debugging other processes, mounts,
//! namespaces and kernel administration. Denied syscalls fail with `EPERM`.
//!
//! After the filter is active the child writes the isolation marker to
//! stdout and stderr, so the integrity check is the same as for
//! `easysandbox`.

use super::marker::{MARKER, MarkedCmd};
use super::process::ProcessCmd;
use super::{Cmd, Driver, SandboxError};
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use std::collections::BTreeMap;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::sync::Arc;

/// Configuration for seccomp filtering
#[derive(Debug, Clone)]
pub struct SeccompConfig {
    /// Syscalls to deny
    pub denied_syscalls: Vec<i64>,
    /// errno returned by denied syscalls
    pub errno: u32,
}

impl Default for SeccompConfig {
    fn default() -> Self {
        Self {
            denied_syscalls: default_denied_syscalls(),
            errno: libc::EPERM.unsigned_abs(),
        }
    }
}

impl SeccompConfig {
    /// Compile the filter for the architecture we run on
    pub fn compile(&self) -> Result<BpfProgram, SandboxError> {
        let rules: BTreeMap<i64, Vec<SeccompRule>> = self
            .denied_syscalls
            .iter()
            .map(|&nr| (nr, Vec::new()))
            .collect();

        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(|e| SandboxError::Driver(format!("unsupported architecture: {e}")))?;

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(self.errno),
            arch,
        )
        .map_err(|e| SandboxError::Driver(format!("invalid seccomp filter: {e}")))?;

        filter
            .try_into()
            .map_err(|e| SandboxError::Driver(format!("failed to compile seccomp filter: {e}")))
    }
}

/// Runs programs behind a compiled seccomp filter
#[derive(Debug, Clone)]
pub struct SeccompDriver {
    program: Arc<BpfProgram>,
}

impl SeccompDriver {
    pub fn new(config: &SeccompConfig) -> Result<Self, SandboxError> {
        let program = config.compile()?;
        tracing::debug!(
            syscalls = config.denied_syscalls.len(),
            instructions = program.len(),
            "seccomp filter compiled"
        );
        Ok(Self {
            program: Arc::new(program),
        })
    }
}

impl Driver for SeccompDriver {
    #[allow(unsafe_code)]
    fn command(&self, program: &Path, args: &[String]) -> Box<dyn Cmd> {
        let mut inner = ProcessCmd::new(program, args);
        let filter = Arc::clone(&self.program);

        // SAFETY: between fork and exec the hook only issues prctl, seccomp
        // and write syscalls and does not allocate on the success path.
        unsafe {
            inner.command_mut().pre_exec(move || {
                seccompiler::apply_filter(filter.as_slice())
                    .map_err(|_| io::Error::from_raw_os_error(libc::EPERM))?;
                announce(libc::STDOUT_FILENO)?;
                announce(libc::STDERR_FILENO)
            });
        }

        Box::new(MarkedCmd::new(inner))
    }
}

#[allow(unsafe_code)]
fn announce(fd: libc::c_int) -> io::Result<()> {
    // SAFETY: MARKER is a valid buffer of MARKER.len() bytes
    let written = unsafe { libc::write(fd, MARKER.as_ptr().cast(), MARKER.len()) };
    if usize::try_from(written).ok() == Some(MARKER.len()) {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Syscalls a test executable is denied
fn default_denied_syscalls() -> Vec<i64> {
    let mut denied = vec![
        // networking
        libc::SYS_socket,
        libc::SYS_socketpair,
        libc::SYS_connect,
        libc::SYS_bind,
        libc::SYS_listen,
        libc::SYS_accept,
        libc::SYS_accept4,
        // other processes
        libc::SYS_ptrace,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        libc::SYS_kill,
        libc::SYS_tkill,
        // filesystems and namespaces
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_pivot_root,
        libc::SYS_chroot,
        libc::SYS_setns,
        libc::SYS_unshare,
        // kernel administration
        libc::SYS_reboot,
        libc::SYS_kexec_load,
        libc::SYS_init_module,
        libc::SYS_finit_module,
        libc::SYS_delete_module,
        libc::SYS_swapon,
        libc::SYS_swapoff,
        libc::SYS_bpf,
        libc::SYS_perf_event_open,
        libc::SYS_userfaultfd,
        libc::SYS_keyctl,
        libc::SYS_add_key,
        libc::SYS_request_key,
    ];

    #[cfg(target_arch = "x86_64")]
    denied.extend([libc::SYS_fork, libc::SYS_vfork]);

    denied
}
