// ai
//! 🔧 App Configuration — where a TOML file and a handful of env vars become a plan.
//!
//! 📡 "Config not found: we looked under the couch, behind the fridge, in the junk drawer." 🦆
//!
//! 🧠 Knowledge graph:
//! - `SLUICE_*` environment variables form the base layer. An optional TOML file is merged
//!   on top and wins on conflicts.
//! - `source` and `sink` reuse the backend configs from [`crate::backends`].
//! - `runtime` carries the stream knobs ([`StreamOptions`]) plus CLI niceties, all defaulted.
//! - `stages` is the ordered list of transforms between source and sink. Empty means "copy".

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

use crate::backends::{SinkConfig, SourceConfig};
use crate::options::StreamOptions;

/// 📦 Everything one sluice run needs to know about itself.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// 🎛️ How the run behaves, as opposed to what it moves.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// 🌊 options handed to every endpoint the run builds
    pub stream: StreamOptions,
    /// 📊 draw a progress bar while the run is going
    pub progress: bool,
    /// 🧵 how many chunks a mapping stage may have in flight
    pub concurrency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stream: StreamOptions::default(),
            progress: true,
            concurrency: 1,
        }
    }
}

/// 🧩 One transform between source and sink. Applied in order.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageConfig {
    Uppercase,
    Lowercase,
    Trim,
    /// 🔍 keep only lines containing `pattern`
    Grep { pattern: String },
    SkipEmpty,
    /// 🪓 pluck one field out of a JSON line
    JsonField { field: String },
    /// 🫁 gzip everything that passes through
    Gzip {
        #[serde(default = "default_gzip_level")]
        level: u32,
    },
}

fn default_gzip_level() -> u32 {
    6
}

/// 🚀 Load the config from `SLUICE_*` env vars, plus `config_file_name` when given.
///
/// No file means env vars only. A file is merged on top of the env and wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!("🔧 Loading configuration: {:#?}", config_file_name.unwrap_or(Path::new("")));

    let config = Figment::new().merge(Env::prefixed("SLUICE_"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    // -- 💬 say which layer we were reading, nobody enjoys "error: error"
    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (SLUICE_*).",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (SLUICE_*). \
                 No file was provided, so this one is all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
