//! bor CLI - submit exercises to a daemon or build and test them locally

use anyhow::{Context, bail};
use bor_core::protocol::{self, BuildRequest, FileContent, SuiteSpec};
use bor_core::sandbox::DriverRegistry;
use bor_core::{Response, Service, ServiceConfig};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_ADDR: &str = "localhost:7066";

#[derive(Parser)]
#[command(name = "bor")]
#[command(author, version, about = "Build and test C++ exercises in a sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send the sources in a directory to a daemon
    Submit {
        /// Daemon address
        #[arg(default_value = DEFAULT_ADDR)]
        addr: String,

        /// Directory holding the sources
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Suite to link, as `name=module,module`; inferred from file names if omitted
        #[arg(short, long = "suite", value_parser = parse_suite)]
        suites: Vec<SuiteSpec>,
    },

    /// Build and test locally, without a daemon
    Run {
        /// Configuration file (built-in defaults if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding the sources
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Suite to link, as `name=module,module`; inferred from file names if omitted
        #[arg(short, long = "suite", value_parser = parse_suite)]
        suites: Vec<SuiteSpec>,
    },

    /// Validate a configuration file
    Check {
        #[arg(short, long, default_value = "/etc/bor/bor.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("bor=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit { addr, dir, suites } => {
            let request = collect_request(&dir, suites)?;
            let response = protocol::submit(addr.as_str(), &request)
                .await
                .with_context(|| format!("submitting to {addr}"))?;
            print_response(&response)
        }

        Commands::Run { config, dir, suites } => {
            let config = match config {
                Some(path) => ServiceConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => ServiceConfig::builder().listen(DEFAULT_ADDR).build(),
            };
            config.validate()?;

            let registry = DriverRegistry::with_builtin(&config.easysandbox);
            let service = Service::new(config, &registry)?;
            let request = collect_request(&dir, suites)?;
            let response = service.process(request).await?;
            print_response(&response)
        }

        Commands::Check { config: path } => {
            let config = ServiceConfig::load(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.validate()?;
            let registry = DriverRegistry::with_builtin(&config.easysandbox);
            Service::new(config.clone(), &registry)?;

            println!("{}: ok", path.display());
            println!("  listen:       {}", config.listen);
            println!("  build driver: {}", config.build_driver);
            println!("  test driver:  {}", config.test_driver);
            println!("  drivers:      {}", registry.names().join(", "));
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print the response; the exit code tells whether every suite passed
fn print_response(response: &Response) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(response)?);
    if response.iter().all(|r| r.ok()) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn parse_suite(arg: &str) -> Result<SuiteSpec, String> {
    let (name, modules) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected name=module,...: {arg}"))?;
    let link: Vec<&str> = modules.split(',').filter(|m| !m.is_empty()).collect();
    if name.is_empty() || link.is_empty() {
        return Err(format!("expected name=module,...: {arg}"));
    }
    Ok(SuiteSpec::new(name, link))
}

/// Read every visible regular file in `dir` into a request
fn collect_request(dir: &Path, suites: Vec<SuiteSpec>) -> anyhow::Result<BuildRequest> {
    let mut files = BTreeMap::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || !entry.file_type()?.is_file() {
            continue;
        }
        let content = std::fs::read(entry.path())
            .with_context(|| format!("reading {}", entry.path().display()))?;
        files.insert(name, FileContent::from_bytes(content));
    }

    let suites = if suites.is_empty() {
        infer_suites(files.keys().map(String::as_str))
    } else {
        suites
    };
    if suites.is_empty() {
        bail!("no suites given and none found in {}", dir.display());
    }

    let request = BuildRequest { files, suites };
    request.validate()?;
    Ok(request)
}

/// A test source `<module>_<name>.cpp` next to `<module>.cpp` makes a suite
/// `<module>_<name>` linking both
fn infer_suites<'a>(names: impl Iterator<Item = &'a str> + Clone) -> Vec<SuiteSpec> {
    let modules: Vec<&str> = names.clone().filter_map(|n| n.strip_suffix(".cpp")).collect();

    let mut suites = Vec::new();
    for test in names.filter_map(|n| n.strip_suffix(".cpp")) {
        let owner = modules
            .iter()
            .filter(|m| test.len() > m.len() + 1 && test.starts_with(*m))
            .filter(|m| test.as_bytes()[m.len()] == b'_')
            .max_by_key(|m| m.len());
        if let Some(module) = owner {
            suites.push(SuiteSpec::new(test, [*module, test]));
        }
    }
    suites
}
