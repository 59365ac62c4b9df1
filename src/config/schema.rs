//! Configuration schema definitions for splitrun.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Loader selection uses a tagged enum; runner,
//! order and feedback flavours are plain lowercase enums.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SplitrunConfig         - Core settings (processes, runner, batching)
//! ├── WorkerConfig           - Long-lived worker command
//! ├── EngineConfig           - Per-unit engine command template
//! ├── LoaderConfig           - Tagged enum selecting how units are found
//! │   ├── Directory          - Recursive file walk by suffix
//! │   └── List               - Explicit list file
//! └── ReportConfig           - Log, coverage and console settings
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

/// Root configuration structure for splitrun.
///
/// # TOML Structure
///
/// ```toml
/// [splitrun]
/// processes = "auto"
/// max_batch_size = 50
///
/// [engine]
/// command = ["vendor/bin/phpunit", "--log-junit", "{report}", "{filter}", "{path}"]
///
/// [loader]
/// type = "directory"
/// paths = ["tests"]
/// suffix = "Test.php"
///
/// [report]
/// log_junit = "build/junit.xml"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings.
    #[serde(default)]
    pub splitrun: SplitrunConfig,

    /// Worker process settings (optional, defaults to the built-in worker).
    #[serde(default)]
    pub worker: WorkerConfig,

    /// How each unit is executed.
    pub engine: EngineConfig,

    /// Where the units come from.
    pub loader: LoaderConfig,

    /// Output settings (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `processes` | `"auto"` |
/// | `runner` | `"wrapper"` |
/// | `max_batch_size` | 0 (never recycle) |
/// | `stop_on_failure` | false |
/// | `poll_interval_ms` | 10 |
/// | `order` | `"default"` |
/// | `random_seed` | None (seeded from entropy) |
/// | `temp_dir` | None (system temp dir) |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SplitrunConfig {
    /// Number of worker processes: an integer, `"auto"` (one per core) or
    /// `"half"` (one per two cores).
    #[serde(default)]
    pub processes: ProcessCount,

    /// Which runner drives the units.
    #[serde(default)]
    pub runner: RunnerKind,

    /// Units a worker runs before it is replaced by a fresh process.
    ///
    /// Bounds memory and global state leaking across units inside one
    /// engine process. 0 disables recycling.
    #[serde(default)]
    pub max_batch_size: usize,

    /// Stop dispatching new units after the first unsuccessful one.
    ///
    /// Units already in flight still finish and are reported.
    #[serde(default)]
    pub stop_on_failure: bool,

    /// Sleep between polling sweeps over the workers.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Order in which units are dispatched.
    #[serde(default)]
    pub order: Order,

    /// Seed for `order = "random"`.
    pub random_seed: Option<u64>,

    /// Directory for per-unit report and coverage temp files.
    pub temp_dir: Option<PathBuf>,
}

impl Default for SplitrunConfig {
    fn default() -> Self {
        Self {
            processes: ProcessCount::default(),
            runner: RunnerKind::default(),
            max_batch_size: 0,
            stop_on_failure: false,
            poll_interval_ms: default_poll_interval(),
            order: Order::default(),
            random_seed: None,
            temp_dir: None,
        }
    }
}

fn default_poll_interval() -> u64 {
    10
}

/// Configured worker count, resolved against the machine's cores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawProcessCount")]
pub enum ProcessCount {
    /// Exactly this many (at least one).
    Fixed(usize),

    /// One per available core.
    #[default]
    Auto,

    /// One per two available cores.
    Half,
}

impl ProcessCount {
    /// The concrete worker count, never zero.
    pub fn resolve(self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        match self {
            ProcessCount::Fixed(n) => n.max(1),
            ProcessCount::Auto => cores,
            ProcessCount::Half => (cores / 2).max(1),
        }
    }
}

impl FromStr for ProcessCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(ProcessCount::Auto),
            "half" => Ok(ProcessCount::Half),
            other => other.parse().map(ProcessCount::Fixed).map_err(|_| {
                format!(
                    "invalid process count `{}`: expected a number, \"auto\" or \"half\"",
                    other
                )
            }),
        }
    }
}

impl fmt::Display for ProcessCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessCount::Fixed(n) => write!(f, "{}", n),
            ProcessCount::Auto => f.write_str("auto"),
            ProcessCount::Half => f.write_str("half"),
        }
    }
}

impl Serialize for ProcessCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ProcessCount::Fixed(n) => serializer.serialize_u64(*n as u64),
            other => serializer.serialize_str(&other.to_string()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawProcessCount {
    Number(usize),
    Name(String),
}

impl TryFrom<RawProcessCount> for ProcessCount {
    type Error = String;

    fn try_from(raw: RawProcessCount) -> Result<Self, Self::Error> {
        match raw {
            RawProcessCount::Number(n) => Ok(ProcessCount::Fixed(n)),
            RawProcessCount::Name(name) => name.parse(),
        }
    }
}

/// Runner flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Long-lived workers fed over stdin.
    #[default]
    Wrapper,

    /// A fresh engine process per unit.
    Oneshot,
}

/// Dispatch order of loaded units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    /// As loaded.
    #[default]
    Default,

    /// Reverse of the loaded order.
    Reverse,

    /// Shuffled, optionally with a fixed seed.
    Random,
}

/// Long-lived worker settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Worker program and arguments.
    ///
    /// Default: this executable with the `worker` subcommand.
    pub command: Option<Vec<String>>,
}

impl WorkerConfig {
    /// The configured command, or the built-in worker.
    pub fn resolve_command(&self) -> std::io::Result<Vec<String>> {
        match &self.command {
            Some(command) => Ok(command.clone()),
            None => {
                let exe = std::env::current_exe()?;
                Ok(vec![
                    exe.to_string_lossy().into_owned(),
                    "worker".to_string(),
                ])
            }
        }
    }
}

/// The engine command run for each unit.
///
/// `command` is an argv template; see
/// [`CommandTemplate`](crate::unit::CommandTemplate) for the placeholders.
///
/// # Example
///
/// ```toml
/// [engine]
/// command = ["vendor/bin/phpunit", "--configuration", "{configuration}",
///            "--log-junit", "{report}", "{filter}", "{path}"]
/// filter_args = ["--filter", "{pattern}"]
/// coverage_args = ["--coverage-php", "{coverage}"]
/// configuration = "phpunit.xml"
///
/// [engine.env]
/// APP_ENV = "testing"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Argv template for one unit.
    pub command: Vec<String>,

    /// Expanded in place of a `{filter}` argument when a unit has filters.
    ///
    /// Default: `["--filter", "{pattern}"]`
    #[serde(default = "default_filter_args")]
    pub filter_args: Vec<String>,

    /// Appended when coverage collection is enabled.
    #[serde(default)]
    pub coverage_args: Vec<String>,

    /// Engine configuration file. Must exist when set.
    pub configuration: Option<PathBuf>,

    /// Extra environment for workers and engine processes.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            filter_args: default_filter_args(),
            coverage_args: Vec::new(),
            configuration: None,
            env: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// `env` as sorted pairs.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}

fn default_filter_args() -> Vec<String> {
    vec!["--filter".to_string(), "{pattern}".to_string()]
}

/// Unit loader selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LoaderConfig {
    /// One unit per matching file under the given paths.
    Directory(DirectoryLoaderConfig),

    /// Units listed in a file.
    List(ListLoaderConfig),
}

/// Settings for the directory loader.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirectoryLoaderConfig {
    /// Directories (or individual files) to load.
    ///
    /// Default: `["tests"]`
    #[serde(default = "default_test_paths")]
    pub paths: Vec<PathBuf>,

    /// File name suffix selecting test files, e.g. `"Test.php"`.
    pub suffix: String,
}

fn default_test_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("tests")]
}

/// Settings for the list loader.
///
/// ```text
/// # one unit per line
/// tests/FooTest.php
/// tests/BarTest.php::testA,testB
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListLoaderConfig {
    /// The list file.
    pub file: PathBuf,

    /// Split units with filters into one unit per test name.
    #[serde(default)]
    pub functional: bool,
}

/// Progress display style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackMode {
    /// One character per test case.
    #[default]
    Dots,

    /// A progress bar.
    Bar,
}

/// Output settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `log_junit` | None (no combined log) |
/// | `suite_name` | `"splitrun"` |
/// | `coverage_dir` | None (coverage off) |
/// | `feedback` | `"dots"` |
/// | `columns` | 80 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Where to write the combined JUnit log.
    pub log_junit: Option<PathBuf>,

    /// Name of the synthetic root suite in the combined log.
    #[serde(default = "default_suite_name")]
    pub suite_name: String,

    /// Collect per-unit coverage fragments into this directory.
    pub coverage_dir: Option<PathBuf>,

    #[serde(default)]
    pub feedback: FeedbackMode,

    /// Width of a row of progress characters, suffix included.
    #[serde(default = "default_columns")]
    pub columns: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            log_junit: None,
            suite_name: default_suite_name(),
            coverage_dir: None,
            feedback: FeedbackMode::default(),
            columns: default_columns(),
        }
    }
}

fn default_suite_name() -> String {
    "splitrun".to_string()
}

fn default_columns() -> usize {
    80
}
