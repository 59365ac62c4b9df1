//! splitrun: a parallel test-suite orchestrator.
//!
//! splitrun splits a test suite into units of work, runs them across a pool
//! of long-lived worker processes, and merges the per-unit JUnit reports into
//! one combined report, summary and exit code.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Loader**: turns configuration into [`WorkUnit`]s
//! - **Worker**: one child process speaking a line-based stdio protocol
//! - **Runner**: dispatches units to workers, polls, flushes and finalises
//! - **Aggregator**: consumes per-unit reports as units complete
//! - **Report**: the merged JUnit log, the text summary, live progress
//!
//! # Example
//!
//! ```no_run
//! use splitrun::config::load_config;
//! use splitrun::report::NullReporter;
//! use splitrun::runner::{RunOptions, Runner, WrapperRunner};
//! use splitrun::unit::CommandTemplate;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("splitrun.toml"))?;
//!     let units = splitrun::loader::from_config(&config.loader).load()?;
//!
//!     let options = RunOptions::from_config(&config)?;
//!     let template = CommandTemplate::from_config(&config.engine);
//!     let mut runner = WrapperRunner::new(options, template, units, NullReporter);
//!
//!     let result = runner.run().await?;
//!     std::process::exit(result.exit_code());
//! }
//! ```

pub mod aggregator;
pub mod config;
pub mod coverage;
pub mod loader;
pub mod protocol;
pub mod report;
pub mod runner;
pub mod unit;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use report::Reporter;
pub use runner::{RunError, RunResult, Runner};
pub use unit::WorkUnit;
