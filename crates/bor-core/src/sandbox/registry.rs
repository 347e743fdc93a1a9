//! Name to driver lookup

use super::easysandbox::EasySandboxDriver;
use super::plain::PlainDriver;
use super::seccomp::{SeccompConfig, SeccompDriver};
use super::{Cmd, Driver, SandboxError};
use crate::config::EasySandboxConfig;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Registered sandbox drivers, keyed by name
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `plain`, `easysandbox` and, where the kernel filter
    /// compiles for this architecture, `seccomp`
    #[must_use]
    pub fn with_builtin(easysandbox: &EasySandboxConfig) -> Self {
        let mut drivers: HashMap<String, Arc<dyn Driver>> = HashMap::new();
        drivers.insert("plain".into(), Arc::new(PlainDriver));
        drivers.insert(
            "easysandbox".into(),
            Arc::new(EasySandboxDriver::new(easysandbox)),
        );

        match SeccompDriver::new(&SeccompConfig::default()) {
            Ok(driver) => {
                drivers.insert("seccomp".into(), Arc::new(driver));
            }
            Err(e) => tracing::warn!(error = %e, "seccomp driver unavailable"),
        }

        Self { drivers }
    }

    /// Add a driver under `name`; names are unique
    pub fn register(
        &mut self,
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
    ) -> Result<(), SandboxError> {
        let name = name.into();
        if self.drivers.contains_key(&name) {
            return Err(SandboxError::DuplicateDriver(name));
        }
        tracing::debug!(driver = %name, "sandbox driver registered");
        self.drivers.insert(name, driver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, SandboxError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownDriver(name.to_string()))
    }

    /// Registered names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a command through the driver registered as `driver`
    pub fn command(
        &self,
        driver: &str,
        program: &Path,
        args: &[String],
    ) -> Result<Box<dyn Cmd>, SandboxError> {
        Ok(self.get(driver)?.command(program, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_drivers_are_registered() {
        let registry = DriverRegistry::with_builtin(&EasySandboxConfig::default());
        let names = registry.names();
        assert!(names.contains(&"plain"));
        assert!(names.contains(&"easysandbox"));
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut registry = DriverRegistry::new();
        registry.register("plain", Arc::new(PlainDriver)).unwrap();
        let err = registry.register("plain", Arc::new(PlainDriver)).unwrap_err();
        assert!(matches!(err, SandboxError::DuplicateDriver(name) if name == "plain"));
    }

    #[test]
    fn unknown_name_is_an_error() {
        let registry = DriverRegistry::new();
        let err = registry.get("chroot").unwrap_err();
        assert_eq!(err.to_string(), "no such sandbox driver: chroot");
        assert!(registry.command("chroot", Path::new("/bin/true"), &[]).is_err());
    }

    #[tokio::test]
    async fn command_runs_through_named_driver() {
        let mut registry = DriverRegistry::new();
        registry.register("plain", Arc::new(PlainDriver)).unwrap();
        let mut cmd = registry
            .command("plain", Path::new("/bin/sh"), &["-c".into(), "echo hi".into()])
            .unwrap();
        let timed = crate::sandbox::run_with_timeout(
            cmd.as_mut(),
            std::time::Duration::from_secs(5),
        )
        .await;
        assert!(timed.error.is_none());
        assert_eq!(timed.output, b"hi\n");
    }
}
