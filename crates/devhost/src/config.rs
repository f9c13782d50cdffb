//! CLI configuration: thin wrapper around `devhost_config`.
//!
//! Resolves the config path from `--config` / `DEVHOST_CONFIG` and narrows
//! the configured hosts to the ones selected on the command line.

use std::path::PathBuf;

pub use devhost_config::{Config, HostSection, LogFormat, LoggingSection};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Config file path: flag / env, then the platform default.
pub fn resolve_path(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(devhost_config::config_path)
}

/// Load the configuration. A missing file is an error for the CLI.
pub fn load(global: &GlobalOpts) -> Result<Config, CliError> {
    let path = resolve_path(global);
    if !path.is_file() {
        return Err(CliError::NoConfig {
            path: path.display().to_string(),
        });
    }
    Ok(devhost_config::load_config(&path)?)
}

/// Hosts to operate on, in name order. An empty selection means all.
pub fn select_hosts<'a>(
    config: &'a Config,
    selected: &[String],
) -> Result<Vec<(&'a str, &'a HostSection)>, CliError> {
    if selected.is_empty() {
        return Ok(config.hosts.iter().map(|(n, h)| (n.as_str(), h)).collect());
    }

    let mut hosts = Vec::with_capacity(selected.len());
    for name in selected {
        let Some((name, host)) = config.hosts.get_key_value(name) else {
            return Err(CliError::UnknownHost {
                host: name.clone(),
                available: config.hosts.keys().cloned().collect::<Vec<_>>().join(", "),
            });
        };
        hosts.push((name.as_str(), host));
    }
    Ok(hosts)
}
