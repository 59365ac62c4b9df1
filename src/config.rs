//! Configuration loading and schema definitions for splitrun.
//!
//! This module provides types and functions for loading splitrun
//! configuration from TOML files or strings. Paths in the configuration may
//! use `~` and `$VAR`; they are expanded once, at load time.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Loads splitrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
/// - A path refers to an undefined environment variable
///
/// # Example
///
/// ```no_run
/// use splitrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("splitrun.toml"))?;
/// println!("Processes: {}", config.splitrun.processes);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.expand_paths()?;

    Ok(config)
}

/// Loads splitrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use splitrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [splitrun]
///     processes = 4
///
///     [engine]
///     command = ["engine", "--log", "{report}", "{path}"]
///
///     [loader]
///     type = "directory"
///     suffix = ".t"
/// "#)?;
///
/// assert_eq!(config.splitrun.processes.resolve(), 4);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths()?;

    Ok(config)
}

impl Config {
    /// Expands `~` and environment variables in every path setting.
    pub fn expand_paths(&mut self) -> Result<()> {
        expand_opt(&mut self.splitrun.temp_dir)?;
        expand_opt(&mut self.engine.configuration)?;
        expand_opt(&mut self.report.log_junit)?;
        expand_opt(&mut self.report.coverage_dir)?;
        match &mut self.loader {
            LoaderConfig::Directory(dir) => {
                for path in &mut dir.paths {
                    expand(path)?;
                }
            }
            LoaderConfig::List(list) => expand(&mut list.file)?,
        }
        Ok(())
    }
}

fn expand(path: &mut PathBuf) -> Result<()> {
    expand_with(path, |name| std::env::var(name).ok())
}

/// Expands `$VAR` through `lookup`, then a leading `~`.
fn expand_with<F>(path: &mut PathBuf, mut lookup: F) -> Result<()>
where
    F: FnMut(&str) -> Option<String>,
{
    let raw = path.to_string_lossy().into_owned();
    let expanded = shellexpand::env_with_context(&raw, |name| {
        lookup(name).map(Some).ok_or(std::env::VarError::NotPresent)
    })
    .with_context(|| format!("Failed to expand path: {}", raw))?;
    *path = PathBuf::from(shellexpand::tilde(expanded.as_ref()).as_ref());
    Ok(())
}

fn expand_opt(path: &mut Option<PathBuf>) -> Result<()> {
    match path {
        Some(path) => expand(path),
        None => Ok(()),
    }
}
