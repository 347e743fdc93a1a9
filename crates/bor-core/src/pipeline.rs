//! Build, discover and test a staged directory

use crate::config::ServiceConfig;
use crate::result::{Response, Stats, SuiteReport};
use crate::sandbox::{Driver, DriverRegistry, run_with_timeout};
use crate::worker::{self, Completion, TestJob};
use crate::Result;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MAKE: &str = "make";

/// Drivers and deadlines resolved once at startup
#[derive(Debug, Clone)]
pub struct Pipeline {
    build_driver: Arc<dyn Driver>,
    test_driver: Arc<dyn Driver>,
    build_timeout: Duration,
    test_timeout: Duration,
    jobs: usize,
}

impl Pipeline {
    /// Resolve the configured drivers; an unknown name is an error
    pub fn new(registry: &DriverRegistry, config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            build_driver: registry.get(&config.build_driver)?,
            test_driver: registry.get(&config.test_driver)?,
            build_timeout: config.build_timeout(),
            test_timeout: config.test_timeout(),
            jobs: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        })
    }

    /// Build everything in `dir` and run each executable produced
    ///
    /// The first report always describes the build. When the build fails it
    /// is the only one.
    pub async fn run(&self, dir: &Path) -> Response {
        let building = self.build(dir).await;
        if !building.ok() {
            return vec![building];
        }

        let executables = match discover_executables(dir).await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "listing build directory failed");
                return vec![building];
            }
        };

        let mut response = Vec::with_capacity(executables.len() + 1);
        response.push(building);
        response.extend(self.run_tests(dir, executables).await);
        response
    }

    /// Run `make -j N all` and describe the outcome as the build suite
    async fn build(&self, dir: &Path) -> SuiteReport {
        let args = vec!["-j".to_string(), self.jobs.to_string(), "all".to_string()];
        let mut cmd = self.build_driver.command(Path::new(MAKE), &args);
        cmd.set_dir(dir);

        let timed = run_with_timeout(cmd.as_mut(), self.build_timeout).await;
        let stats = cmd.process_state().map(Stats::from).unwrap_or_default();

        let mut diagnostic = String::from_utf8_lossy(&timed.output).into_owned();
        let ok = match timed.error {
            None => true,
            Some(err) => {
                tracing::info!(dir = %dir.display(), error = %err, "build failed");
                if !diagnostic.is_empty() && !diagnostic.ends_with('\n') {
                    diagnostic.push('\n');
                }
                diagnostic.push_str(&err.to_string());
                false
            }
        };

        SuiteReport::building(ok, diagnostic, stats)
    }

    /// Run every executable in parallel, reporting in the order given
    async fn run_tests(&self, dir: &Path, executables: Vec<PathBuf>) -> Vec<SuiteReport> {
        let count = executables.len();
        let mut slots: Vec<Option<SuiteReport>> = vec![None; count];
        let (tx, mut rx) = mpsc::channel::<Completion>(count.max(1));

        let mut names = Vec::with_capacity(count);
        for (index, executable) in executables.into_iter().enumerate() {
            let name = executable
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            names.push(name.clone());

            let job = TestJob {
                name,
                executable,
                dir: dir.to_path_buf(),
                driver: Arc::clone(&self.test_driver),
                timeout: self.test_timeout,
            };
            tokio::spawn(worker::run(index, job, tx.clone()));
        }
        drop(tx);

        tracing::debug!(tests = count, "test executables dispatched");

        for _ in 0..count {
            // All senders gone early means a worker died without reporting
            let Some(Completion { index, report }) = rx.recv().await else {
                break;
            };
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(report);
            }
        }

        slots
            .into_iter()
            .zip(names)
            .map(|(slot, name)| {
                slot.unwrap_or_else(|| {
                    tracing::error!(suite = %name, "test runner terminated unexpectedly");
                    SuiteReport::failed(
                        name,
                        Stats::default(),
                        "test runner terminated unexpectedly",
                        b"",
                    )
                })
            })
            .collect()
    }
}

/// Regular files in `dir` with any execute bit set, sorted by name
pub async fn discover_executables(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut found = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if !file_type.is_file() {
            continue;
        }
        let mode = entry.metadata().await?.permissions().mode();
        if mode & 0o111 != 0 {
            found.push(entry.path());
        }
    }

    found.sort();
    Ok(found)
}
