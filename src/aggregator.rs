//! Incremental result aggregation.
//!
//! The [`ResultAggregator`] consumes each unit's report as soon as the unit
//! completes, keeps the parsed tree, and at the end merges everything into
//! one synthetic root whose direct children are the units' suites:
//!
//! ```text
//! <root>
//! ├── FooTest            (unit 1, nesting preserved)
//! │   ├── testA
//! │   └── FooTest::testData
//! │       └── ...
//! └── BarTest            (unit 2)
//!     └── ...
//! ```
//!
//! Totals and severity are always recomputed from the test cases; a
//! suite's self-reported rollup is never trusted.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::report::junit;
use crate::report::{ReportResult, Suite, Totals};
use crate::runner::exit_codes::Severity;
use crate::unit::WorkUnit;

/// What one consumed report contained.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitOutcome {
    /// One progress character per test case, in document order.
    pub feedback: String,

    /// The unit's worst outcome.
    pub severity: Severity,

    /// The unit's own counts.
    pub totals: Totals,
}

/// Accumulates per-unit reports.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    suites: Vec<Suite>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the report of a finished unit.
    ///
    /// Returns `Ok(None)` if the unit has no report file (it never ran).
    pub fn consume(&mut self, unit: &WorkUnit) -> ReportResult<Option<UnitOutcome>> {
        match unit.report_file() {
            Some(path) => self.consume_file(path),
            None => Ok(None),
        }
    }

    /// Consumes a report file.
    ///
    /// A missing file is skipped. An empty file is
    /// [`ReportError::EmptyReport`](crate::report::ReportError::EmptyReport).
    pub fn consume_file(&mut self, path: &Path) -> ReportResult<Option<UnitOutcome>> {
        let Some(suite) = junit::read_report(path)? else {
            debug!("No report at {}", path.display());
            return Ok(None);
        };
        Ok(Some(self.push(suite)))
    }

    /// Adds an already parsed unit suite.
    pub fn push(&mut self, suite: Suite) -> UnitOutcome {
        let totals = suite.totals();
        let feedback: String = suite.cases().iter().map(|case| case.symbol()).collect();
        let outcome = UnitOutcome {
            feedback,
            severity: Severity::from_counts(totals.failures, totals.errors),
            totals,
        };
        self.suites.push(suite);
        outcome
    }

    /// Number of reports consumed.
    pub fn len(&self) -> usize {
        self.suites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    /// Sums over every consumed suite, recomputed from the test cases.
    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for suite in &self.suites {
            totals.add(&suite.totals());
        }
        totals
    }

    /// No failures and no errors in any consumed report.
    pub fn is_successful(&self) -> bool {
        self.totals().is_successful()
    }

    /// Severity derived from the totals.
    pub fn severity(&self) -> Severity {
        let totals = self.totals();
        Severity::from_counts(totals.failures, totals.errors)
    }

    /// Builds the merged tree: one unnamed root with each unit's suite as a
    /// direct child, in consumption order.
    pub fn merge(&self) -> Suite {
        let mut root = Suite::new("");
        for suite in &self.suites {
            root.push_suite(suite.clone());
        }
        root
    }

    /// Like [`merge`](Self::merge), consuming the aggregator.
    pub fn into_merged(self) -> Suite {
        let mut root = Suite::new("");
        for suite in self.suites {
            root.push_suite(suite);
        }
        root
    }
}
