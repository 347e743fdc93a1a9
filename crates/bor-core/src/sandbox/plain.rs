//! Pass-through driver without any isolation

use super::process::ProcessCmd;
use super::{Cmd, Driver};
use std::path::Path;

/// Runs programs directly on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainDriver;

impl Driver for PlainDriver {
    fn command(&self, program: &Path, args: &[String]) -> Box<dyn Cmd> {
        Box::new(ProcessCmd::new(program, args))
    }
}
