//! Test reporting and output generation.
//!
//! This module holds the report tree ([`model`]), the per-unit JUnit parser
//! ([`junit`]), the combined log writer ([`writer`]), the end-of-run text
//! summary ([`summary`]) and the live progress reporters ([`console`]).

pub mod console;
pub mod junit;
pub mod model;
pub mod summary;
pub mod writer;

use std::path::PathBuf;

use ::console::Style;
use async_trait::async_trait;

use crate::aggregator::UnitOutcome;
use crate::runner::RunResult;
use crate::unit::WorkUnit;

pub use console::{ConsoleReporter, ProgressBarReporter};
pub use model::{Defect, DefectKind, Node, Suite, TestCase, Totals};

/// Errors from reading or writing reports.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// The report file exists but is empty: the engine died before writing
    /// it.
    #[error("Report file {} is empty", path.display())]
    EmptyReport { path: PathBuf },

    /// A report file could not be parsed.
    #[error("Invalid report {}: {message}", path.display())]
    Invalid { path: PathBuf, message: String },

    /// Structurally invalid JUnit.
    #[error("Malformed JUnit report: {0}")]
    Malformed(String),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("XML attribute error: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ReportResult<T> = Result<T, ReportError>;

/// Receives progress events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the units are loaded, before any worker starts.
    async fn on_run_start(&self, units: usize, expected_tests: Option<usize>);

    /// Called each time a unit's report has been consumed.
    async fn on_unit_complete(&self, unit: &WorkUnit, outcome: &UnitOutcome);

    /// Called after the run has been finalized.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing (for testing or when output is not needed).
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _units: usize, _expected_tests: Option<usize>) {}
    async fn on_unit_complete(&self, _unit: &WorkUnit, _outcome: &UnitOutcome) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reporter to the multi-reporter.
    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, units: usize, expected_tests: Option<usize>) {
        for reporter in &self.reporters {
            reporter.on_run_start(units, expected_tests).await;
        }
    }

    async fn on_unit_complete(&self, unit: &WorkUnit, outcome: &UnitOutcome) {
        for reporter in &self.reporters {
            reporter.on_unit_complete(unit, outcome).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Prints the end-of-run summary to stdout, with a coloured footer.
pub fn print_summary(result: &RunResult) {
    println!();
    println!();
    print!("{}", summary::render_body(&result.merged, result.elapsed));
    println!();

    let footer = summary::footer(&result.totals);
    let style = if !result.totals.is_successful() {
        Style::new().white().on_red().bold()
    } else if footer.starts_with("OK (") {
        Style::new().black().on_green()
    } else {
        Style::new().black().on_yellow()
    };
    for line in footer.lines() {
        println!("{}", style.apply_to(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Reporter for Counting {
        async fn on_run_start(&self, _units: usize, _expected_tests: Option<usize>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_unit_complete(&self, _unit: &WorkUnit, _outcome: &UnitOutcome) {
            self.0.fetch_add(10, Ordering::SeqCst);
        }
        async fn on_run_complete(&self, _result: &RunResult) {}
    }

    #[tokio::test]
    async fn test_multi_reporter_fans_out() {
        let count = Arc::new(AtomicUsize::new(0));
        let multi = MultiReporter::new()
            .with_reporter(Counting(Arc::clone(&count)))
            .with_reporter(NullReporter)
            .with_reporter(Counting(Arc::clone(&count)));

        multi.on_run_start(1, None).await;
        multi
            .on_unit_complete(&WorkUnit::new("a.t"), &UnitOutcome::default())
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 22);
    }

    #[test]
    fn test_print_summary_styles_every_footer() {
        let mut result = RunResult::empty(std::time::Duration::ZERO);
        print_summary(&result);

        result.totals.tests = 2;
        result.totals.skipped = 1;
        print_summary(&result);

        result.totals.failures = 1;
        print_summary(&result);
    }
}
