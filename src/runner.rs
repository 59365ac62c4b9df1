//! Scheduling units onto processes and finalising the run.
//!
//! Two runners share the same bookkeeping:
//!
//! | Runner | Processes | Unit hand-off |
//! |--------|-----------|---------------|
//! | [`wrapper::WrapperRunner`] | N long-lived [workers](crate::worker) | command line over stdin |
//! | [`oneshot::OneshotRunner`] | one engine process per unit | argv |
//!
//! # Run Phases
//!
//! ```text
//!   preflight ──► start processes ──► dispatch / poll / flush ──► drain ──► finalise
//!       │                                      │                    │           │
//!   Setup error                          crash = abort        crash = abort   merged log
//!   (exit 3)                             (exit 255)           (exit 255)      + RunResult
//! ```
//!
//! A unit is *flushed* once its process has acknowledged it: its report is
//! consumed by the [`ResultAggregator`], its coverage fragment copied, its
//! temp files deleted and the [`Reporter`] told about it. Flushing happens
//! only on the coordinating task, so every piece of run state is plain owned
//! data.

pub mod exit_codes;
pub mod oneshot;
pub mod wrapper;

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::aggregator::ResultAggregator;
use crate::config::Config;
use crate::coverage::CoverageCollector;
use crate::loader::LoaderError;
use crate::report::{ReportError, Reporter, Suite, Totals, writer};
use crate::unit::{CommandTemplate, WorkUnit};
use crate::worker::{CompletedUnit, CrashReport, WorkerError};

use exit_codes::{Severity, SplitrunExitCode};

pub use oneshot::OneshotRunner;
pub use wrapper::WrapperRunner;

/// Outcome of a completed run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed (skipped, risky and warnings included) |
/// | 1 | At least one failure, no errors |
/// | 2 | At least one error |
#[derive(Debug, Clone)]
pub struct RunResult {
    /// One unnamed root with every flushed unit's suite as a child.
    pub merged: Suite,

    /// Counts recomputed from the merged test cases.
    pub totals: Totals,

    /// Worst outcome among the flushed units.
    pub severity: Severity,

    /// Units whose reports were consumed.
    pub units: usize,

    /// Units never dispatched because the run stopped on a failure.
    pub not_dispatched: usize,

    /// Coverage fragments copied out, if coverage was collected.
    pub coverage_fragments: Option<usize>,

    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl RunResult {
    /// A run with nothing to do.
    pub fn empty(elapsed: Duration) -> Self {
        Self {
            merged: Suite::new(""),
            totals: Totals::default(),
            severity: Severity::Success,
            units: 0,
            not_dispatched: 0,
            coverage_fragments: None,
            elapsed,
        }
    }

    /// Returns `true` if no test failed or errored.
    pub fn success(&self) -> bool {
        self.severity.is_success()
    }

    /// Process exit code for this result.
    pub fn exit_code(&self) -> i32 {
        self.severity.exit_code()
    }
}

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The run could not start: bad configuration, missing files.
    #[error("{0}")]
    Setup(String),

    /// A process died mid-run.
    #[error("{0}")]
    Crashed(Box<CrashReport>),

    #[error(transparent)]
    Worker(WorkerError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RunError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Setup(_) | RunError::Loader(_) => SplitrunExitCode::SETUP_ERROR,
            _ => SplitrunExitCode::FATAL,
        }
    }
}

impl From<WorkerError> for RunError {
    fn from(error: WorkerError) -> Self {
        match error {
            WorkerError::Crashed(report) => RunError::Crashed(report),
            WorkerError::Report(e) => RunError::Report(e),
            other => RunError::Worker(other),
        }
    }
}

/// Drives a whole run.
#[async_trait]
pub trait Runner: Send {
    /// Runs every unit and returns the finalised result.
    async fn run(&mut self) -> Result<RunResult, RunError>;
}

/// Run settings shared by both runners, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Number of concurrent processes.
    pub processes: usize,

    /// Units per worker before recycling; 0 never recycles.
    pub max_batch_size: usize,

    /// Stop dispatching after the first unsuccessful unit.
    pub stop_on_failure: bool,

    /// Sleep between polling sweeps.
    pub poll_interval: Duration,

    /// Long-lived worker program and arguments.
    pub worker_command: Vec<String>,

    /// Extra environment for every child process.
    pub env: Vec<(String, String)>,

    /// Where to write the combined JUnit log.
    pub log_junit: Option<PathBuf>,

    /// Name of the synthetic root suite in the combined log.
    pub suite_name: String,

    /// Where to copy coverage fragments.
    pub coverage_dir: Option<PathBuf>,
}

impl RunOptions {
    /// Resolves options from a loaded configuration.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        Ok(Self {
            processes: config.splitrun.processes.resolve(),
            max_batch_size: config.splitrun.max_batch_size,
            stop_on_failure: config.splitrun.stop_on_failure,
            poll_interval: Duration::from_millis(config.splitrun.poll_interval_ms),
            worker_command: config.worker.resolve_command()?,
            env: config.engine.env_pairs(),
            log_junit: config.report.log_junit.clone(),
            suite_name: config.report.suite_name.clone(),
            coverage_dir: config.report.coverage_dir.clone(),
        })
    }

    /// Defaults for tests and embedding: one process, built-in worker.
    pub fn new(worker_command: Vec<String>) -> Self {
        Self {
            processes: 1,
            max_batch_size: 0,
            stop_on_failure: false,
            poll_interval: Duration::from_millis(10),
            worker_command,
            env: Vec::new(),
            log_junit: None,
            suite_name: "splitrun".to_string(),
            coverage_dir: None,
        }
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes.max(1);
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    pub fn with_log_junit(mut self, path: Option<PathBuf>) -> Self {
        self.log_junit = path;
        self
    }

    pub fn with_coverage_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.coverage_dir = dir;
        self
    }

    /// Checks everything that must hold before a process is started.
    pub fn preflight(&self, template: &CommandTemplate) -> Result<(), RunError> {
        if template.is_empty() {
            return Err(RunError::Setup("No engine command configured".to_string()));
        }
        if let Some(configuration) = template.configuration()
            && !configuration.is_file()
        {
            return Err(RunError::Setup(format!(
                "Could not read \"{}\".",
                configuration.display()
            )));
        }
        if self.coverage_dir.is_some() && !template.collects_coverage() {
            return Err(RunError::Setup(
                "A coverage directory is set but the engine has no coverage arguments"
                    .to_string(),
            ));
        }
        if let Some(dir) = template.temp_dir()
            && !dir.is_dir()
        {
            std::fs::create_dir_all(dir).map_err(|e| {
                RunError::Setup(format!(
                    "Failed to create temp directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// Per-run bookkeeping shared by the runners.
///
/// Owns the aggregator and coverage collector and tracks severity and the
/// stop-on-failure state.
#[derive(Debug)]
pub(crate) struct RunState {
    aggregator: ResultAggregator,
    coverage: Option<CoverageCollector>,
    severity: Severity,
    stop_on_failure: bool,
    units: usize,
    not_dispatched: usize,
}

impl RunState {
    pub(crate) fn new(options: &RunOptions) -> Result<Self, RunError> {
        let coverage = match &options.coverage_dir {
            Some(dir) => Some(CoverageCollector::new(dir).map_err(|e| {
                RunError::Setup(format!(
                    "Failed to create coverage directory {}: {}",
                    dir.display(),
                    e
                ))
            })?),
            None => None,
        };
        Ok(Self {
            aggregator: ResultAggregator::new(),
            coverage,
            severity: Severity::Success,
            stop_on_failure: options.stop_on_failure,
            units: 0,
            not_dispatched: 0,
        })
    }

    pub(crate) fn aggregator_mut(&mut self) -> &mut ResultAggregator {
        &mut self.aggregator
    }

    /// Flushes a completed unit.
    ///
    /// On a stop-on-failure hit, `pending` is emptied.
    pub(crate) async fn record<R: Reporter + ?Sized>(
        &mut self,
        completed: CompletedUnit,
        reporter: &R,
        pending: &mut VecDeque<WorkUnit>,
    ) -> Result<(), RunError> {
        let CompletedUnit { mut unit, outcome } = completed;
        if let Some(coverage) = self.coverage.as_mut() {
            coverage.collect(&unit)?;
        }
        unit.cleanup()?;

        let Some(outcome) = outcome else {
            debug!("No report for {}", unit);
            return Ok(());
        };
        self.units += 1;
        self.severity.escalate(outcome.severity);
        reporter.on_unit_complete(&unit, &outcome).await;

        if self.stop_on_failure && !outcome.severity.is_success() && !pending.is_empty() {
            info!(
                "Stopping after {} in {}; {} units not dispatched",
                outcome.severity,
                unit,
                pending.len()
            );
            self.not_dispatched += pending.len();
            pending.clear();
        }
        Ok(())
    }

    /// Merges the reports, writes the combined log and builds the result.
    pub(crate) fn finish(
        self,
        options: &RunOptions,
        elapsed: Duration,
    ) -> Result<RunResult, RunError> {
        let totals = self.aggregator.totals();
        let severity = self.severity.max(self.aggregator.severity());
        let merged = self.aggregator.into_merged();

        if let Some(path) = &options.log_junit {
            writer::write_report(path, &merged, &options.suite_name)?;
        }
        let coverage_fragments = self.coverage.as_ref().map(|coverage| {
            info!(
                "Collected {} coverage fragments into {}",
                coverage.collected(),
                coverage.dir().display()
            );
            coverage.collected()
        });

        Ok(RunResult {
            merged,
            totals,
            severity,
            units: self.units,
            not_dispatched: self.not_dispatched,
            coverage_fragments,
            elapsed,
        })
    }
}
