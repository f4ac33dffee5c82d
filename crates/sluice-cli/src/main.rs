// ai
//! 🚀 sluice-cli — the front door. Opens the sluice gates, watches the water, hands you a receipt.
//!
//! 🎬 *[narrator voice]* "It was a simple plan: read some lines, change some lines, write some lines."
//! 📦 This binary loads config, sets up logging, builds one pipeline, and lets the library
//! crate do the actual swimming. 🦆

mod progress;
mod run;
mod stages;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 🌊 Move lines from a source to a sink through a configurable chain of stages.
#[derive(Parser, Debug)]
#[command(name = "sluice", version, about)]
struct Cli {
    /// 🧾 path to the TOML config (SLUICE_* env vars fill in underneath it)
    #[arg(default_value = "sluice.toml")]
    config: PathBuf,

    /// 🙈 do not draw the progress bar, whatever the config says
    #[arg(long)]
    no_progress: bool,
}

/// 🚀 main() — tracing, args, config, run, receipt. In that order, and only once.
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 RUST_LOG decides how chatty we are
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 🔒 a missing file is fine (env vars may carry everything), an unreadable path is not
    let config_file = cli.config.as_path();
    let validated_config_file = match config_file.try_exists().context(format!(
        "💀 Could not check whether the configuration file exists. Relative paths resolve against the \
        current directory, so an absolute path takes the guesswork out. Was checking here: '{}'",
        config_file.display()
    ))? {
        true => Some(config_file),
        false => None,
    };

    let mut app_config = sluice::app_config::load_config(validated_config_file)
        .context("💀 In sluice-cli, main, we couldn't load the config. Check the TOML and any SLUICE_* env vars")?;
    if cli.no_progress {
        app_config.runtime.progress = false;
    }

    match run::run(app_config).await {
        Ok(summary) => {
            // -- 🧾 the receipt goes to stdout, everything else went to the log
            println!("{}", summary.table());
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion, one layer at a time
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
            }
            std::process::exit(1);
        }
    }
}
