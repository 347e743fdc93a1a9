//! # bor-core
//!
//! Build-and-test execution pipeline for submitted C++ exercises.
//!
//! A request carries source files and test-suite link descriptions. This
//! crate provides:
//! - the wire protocol (gzip+base64 file payloads, JSON results)
//! - build directory staging with a generated Makefile
//! - pluggable sandbox drivers (`plain`, `easysandbox`, `seccomp`)
//! - timeout-bounded process execution with CPU-time accounting
//! - parallel test execution with a stable result order
//! - TAP report parsing

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod protocol;
pub mod report;
pub mod result;
pub mod sandbox;
pub mod stage;
pub mod worker;

pub use config::ServiceConfig;
pub use error::BorError;
pub use handler::Service;
pub use result::{Response, SuiteReport};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, BorError>;
