//! Service configuration

use crate::{BorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the build-and-test service
///
/// Loaded from a TOML file. Only `listen` is required; every other field
/// falls back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the daemon listens on (`host:port`)
    pub listen: String,

    /// Parent directory for build directories (system temp dir if unset)
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,

    /// Filename prefix of build directories
    #[serde(default = "default_tmp_prefix")]
    pub tmp_prefix: String,

    /// Makefile template every generated build script starts with
    #[serde(default = "default_makefile_template")]
    pub makefile_template: PathBuf,

    /// Test harness entry point linked into every suite
    #[serde(default = "default_harness_source")]
    pub harness_source: PathBuf,

    /// Sandbox driver running `make`
    #[serde(default = "default_build_driver")]
    pub build_driver: String,

    /// Sandbox driver running the test executables
    #[serde(default = "default_test_driver")]
    pub test_driver: String,

    /// SO_LINGER applied to client connections, in seconds
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,

    /// Deadline for the build step
    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,

    /// Deadline for each test executable
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,

    /// Connections handled concurrently; further clients wait in the backlog
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Upper bound on the size of one request document
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: u64,

    /// Deadline for receiving the request document
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Parameters of the `easysandbox` driver
    #[serde(default)]
    pub easysandbox: EasySandboxConfig,
}

/// Parameters of the EasySandbox preload library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EasySandboxConfig {
    /// Path of `EasySandbox.so`
    #[serde(default = "default_easysandbox_library")]
    pub library: PathBuf,

    /// Heap made available to the restricted process, in bytes
    #[serde(default = "default_easysandbox_heap_size")]
    pub heap_size: u64,
}

fn default_listen() -> String {
    "localhost:7066".into()
}

fn default_tmp_prefix() -> String {
    "bor-".into()
}

fn default_makefile_template() -> PathBuf {
    PathBuf::from("/usr/share/bor/Makefile.tpl")
}

fn default_harness_source() -> PathBuf {
    PathBuf::from("/usr/share/bor/TAPListener.cpp")
}

fn default_build_driver() -> String {
    "plain".into()
}

fn default_test_driver() -> String {
    "easysandbox".into()
}

const fn default_linger_secs() -> u64 {
    5
}

const fn default_build_timeout_ms() -> u64 {
    5_000
}

const fn default_test_timeout_ms() -> u64 {
    1_000
}

const fn default_max_connections() -> usize {
    10
}

const fn default_max_request_bytes() -> u64 {
    64 * 1024 * 1024 // 64MB
}

const fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_easysandbox_library() -> PathBuf {
    PathBuf::from("/usr/lib/EasySandbox/EasySandbox.so")
}

const fn default_easysandbox_heap_size() -> u64 {
    8 * 1024 * 1024 // 8MB
}

impl Default for EasySandboxConfig {
    fn default() -> Self {
        Self {
            library: default_easysandbox_library(),
            heap_size: default_easysandbox_heap_size(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tmp_dir: None,
            tmp_prefix: default_tmp_prefix(),
            makefile_template: default_makefile_template(),
            harness_source: default_harness_source(),
            build_driver: default_build_driver(),
            test_driver: default_test_driver(),
            linger_secs: default_linger_secs(),
            build_timeout_ms: default_build_timeout_ms(),
            test_timeout_ms: default_test_timeout_ms(),
            max_connections: default_max_connections(),
            max_request_bytes: default_max_request_bytes(),
            read_timeout_ms: default_read_timeout_ms(),
            easysandbox: EasySandboxConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| BorError::Config(e.to_string()))
    }

    /// Read and parse a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BorError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(BorError::Config("listen address is empty".into()));
        }
        if self.build_timeout_ms == 0 || self.test_timeout_ms == 0 {
            return Err(BorError::Config("timeouts must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(BorError::Config("read_timeout_ms must be positive".into()));
        }
        if self.max_connections == 0 {
            return Err(BorError::Config("max_connections must be at least 1".into()));
        }
        if self.tmp_prefix.contains('/') {
            return Err(BorError::Config(format!(
                "tmp_prefix {:?} must not contain '/'",
                self.tmp_prefix
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    #[must_use]
    pub const fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    #[must_use]
    pub const fn linger(&self) -> Duration {
        Duration::from_secs(self.linger_secs)
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Builder for `ServiceConfig`
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    #[must_use]
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.config.listen = addr.into();
        self
    }

    #[must_use]
    pub fn tmp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.tmp_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn tmp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.tmp_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn makefile_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.makefile_template = path.into();
        self
    }

    #[must_use]
    pub fn harness_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.harness_source = path.into();
        self
    }

    #[must_use]
    pub fn build_driver(mut self, name: impl Into<String>) -> Self {
        self.config.build_driver = name.into();
        self
    }

    #[must_use]
    pub fn test_driver(mut self, name: impl Into<String>) -> Self {
        self.config.test_driver = name.into();
        self
    }

    #[must_use]
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.config.build_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn test_timeout(mut self, timeout: Duration) -> Self {
        self.config.test_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn max_connections(mut self, n: usize) -> Self {
        self.config.max_connections = n;
        self
    }

    #[must_use]
    pub fn easysandbox(mut self, library: impl Into<PathBuf>, heap_size: u64) -> Self {
        self.config.easysandbox = EasySandboxConfig {
            library: library.into(),
            heap_size,
        };
        self
    }

    #[must_use]
    pub fn build(self) -> ServiceConfig {
        self.config
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}
