use plugfuzz_core::config::{DEFAULT_CONFIG_FILE_NAME, HostConfig};
use plugfuzz_core::engine::{Engine, RunOutcome};
use plugfuzz_core::loader::DylibLoader;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
const EXIT_FATAL: u8 = 1;
const EXIT_USAGE: u8 = 2;

/// Run without module arguments to list the available fuzzer modules.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (JSON, or TOML by extension). Defaults to
    /// `config.json` next to the executable.
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// `<module-name> '<module-args>'`
    #[clap(allow_hyphen_values = true)]
    args: Vec<String>,
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate the running executable")?;
    let dir = exe
        .parent()
        .context("The running executable has no parent directory")?;
    Ok(dir.join(DEFAULT_CONFIG_FILE_NAME))
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    info!("Loading configuration from {config_path:?}");
    let config = HostConfig::load_from_file(&config_path)?;

    let engine = Engine::new(config, DylibLoader::new());
    let code = match engine.run(&cli.args)? {
        RunOutcome::UsageError { .. } => EXIT_USAGE,
        RunOutcome::NoPlugins | RunOutcome::CatalogPrinted(_) => EXIT_OK,
        RunOutcome::Completed(report) => {
            info!(
                "{} ran {} iterations on {} workers",
                report.module,
                report.total_iterations(),
                report.workers.len()
            );
            EXIT_OK
        }
    };
    Ok(code)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("plugfuzz {}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
