//! Response wire format

use crate::sandbox::ProcessState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Name of the synthetic suite describing the build step
pub const BUILDING: &str = "Building";

/// Directive attached to a test line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Todo(String),
    Skip(String),
}

/// One test point of a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLine {
    #[serde(skip)]
    pub number: Option<u64>,
    pub ok: bool,
    pub description: String,
    pub diagnostic: String,
    #[serde(skip)]
    pub directive: Option<Directive>,
}

impl TestLine {
    #[must_use]
    pub fn new(ok: bool, description: impl Into<String>) -> Self {
        Self {
            number: None,
            ok,
            description: description.into(),
            diagnostic: String::new(),
            directive: None,
        }
    }

    /// Whether the line counts as passed for the suite
    #[must_use]
    pub const fn passed(&self) -> bool {
        self.ok || self.directive.is_some()
    }
}

/// A parsed report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Testsuite {
    pub ok: bool,
    #[serde(default)]
    pub tests: Vec<TestLine>,
    /// Planned number of tests
    #[serde(skip)]
    pub plan: Option<u64>,
}

/// CPU time consumed by a process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    #[serde(with = "nanos")]
    pub system_time: Duration,
    #[serde(with = "nanos")]
    pub user_time: Duration,
}

impl From<&ProcessState> for Stats {
    fn from(state: &ProcessState) -> Self {
        Self {
            system_time: state.system_time(),
            user_time: state.user_time(),
        }
    }
}

/// One element of the response array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteReport {
    pub name: String,
    pub suite: Testsuite,
    pub stats: Stats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Ordered results; the first element always describes the build
pub type Response = Vec<SuiteReport>;

impl SuiteReport {
    /// The synthetic build suite with its single test line
    #[must_use]
    pub fn building(ok: bool, diagnostic: String, stats: Stats) -> Self {
        let mut line = TestLine::new(ok, BUILDING);
        line.number = Some(1);
        line.diagnostic = diagnostic;
        Self {
            name: BUILDING.to_string(),
            suite: Testsuite {
                ok,
                tests: vec![line],
                plan: Some(1),
            },
            stats,
            error: None,
            output: None,
        }
    }

    #[must_use]
    pub fn parsed(name: impl Into<String>, suite: Testsuite, stats: Stats) -> Self {
        Self {
            name: name.into(),
            suite,
            stats,
            error: None,
            output: None,
        }
    }

    /// A slot without a parsed report
    #[must_use]
    pub fn failed(
        name: impl Into<String>,
        stats: Stats,
        error: impl ToString,
        output: &[u8],
    ) -> Self {
        Self {
            name: name.into(),
            suite: Testsuite::default(),
            stats,
            error: Some(error.to_string()),
            output: (!output.is_empty()).then(|| String::from_utf8_lossy(output).into_owned()),
        }
    }

    #[must_use]
    pub const fn ok(&self) -> bool {
        self.suite.ok
    }
}

/// `Duration` as integer nanoseconds
mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_nanos)
    }
}
