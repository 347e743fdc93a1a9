//! Command line arguments of the daemon

use anyhow::Context;
use bor_core::ServiceConfig;
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bor-daemon")]
#[command(version, about = "Build and test submitted C++ exercises in a sandbox")]
pub struct DaemonArgs {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/bor/bor.toml")]
    pub config: PathBuf,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    pub listen: Option<String>,
}

impl DaemonArgs {
    /// Load and validate the configuration file, applying overrides
    pub fn load(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = ServiceConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;
        if let Some(listen) = &self.listen {
            config.listen.clone_from(listen);
        }
        config.validate()?;
        Ok(config)
    }
}
