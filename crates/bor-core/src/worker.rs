//! Execution of a single test executable

use crate::report;
use crate::result::{Stats, SuiteReport};
use crate::sandbox::{Driver, run_with_timeout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One discovered executable and how to run it
#[derive(Debug, Clone)]
pub struct TestJob {
    /// Suite name reported to the client (the executable's file name)
    pub name: String,
    pub executable: PathBuf,
    /// Working directory of the test process
    pub dir: PathBuf,
    pub driver: Arc<dyn Driver>,
    pub timeout: Duration,
}

/// Result of the job in slot `index`
#[derive(Debug)]
pub struct Completion {
    pub index: usize,
    pub report: SuiteReport,
}

/// Run the job and parse its report
///
/// Never fails: every problem ends up in the `error` of the returned report.
pub async fn execute(job: TestJob) -> SuiteReport {
    let mut cmd = job.driver.command(&job.executable, &[]);
    cmd.set_dir(&job.dir);

    let timed = run_with_timeout(cmd.as_mut(), job.timeout).await;
    let stats = cmd.process_state().map(Stats::from).unwrap_or_default();

    if let Some(err) = timed.error {
        tracing::warn!(suite = %job.name, error = %err, "test execution failed");
        return SuiteReport::failed(job.name, stats, err, &timed.output);
    }

    match report::parse(&timed.output) {
        Ok(suite) => {
            tracing::debug!(
                suite = %job.name,
                ok = suite.ok,
                tests = suite.tests.len(),
                "test report parsed"
            );
            SuiteReport::parsed(job.name, suite, stats)
        }
        Err(err) => {
            tracing::warn!(suite = %job.name, error = %err, "unreadable test report");
            SuiteReport::failed(job.name, stats, err, &timed.output)
        }
    }
}

/// Execute `job` and deliver its report for slot `index`
pub async fn run(index: usize, job: TestJob, results: mpsc::Sender<Completion>) {
    let report = execute(job).await;
    if results.send(Completion { index, report }).await.is_err() {
        tracing::debug!(index, "result collector went away");
    }
}
