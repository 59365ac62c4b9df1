//! Process exit codes and the severity ordering they derive from.

use std::fmt;

use serde::Serialize;

/// Documented exit codes for `splitrun run`.
///
/// Each code maps to a [`Severity`]; a run exits with the code of the most
/// severe outcome observed across all units.
pub enum SplitrunExitCode {}

impl SplitrunExitCode {
    /// Every unit passed.
    pub const OK: i32 = 0;

    /// At least one test failed, none errored.
    pub const TEST_FAILURES: i32 = 1;

    /// At least one test errored.
    pub const TEST_ERRORS: i32 = 2;

    /// The run could not start: bad configuration, missing paths, or no
    /// loadable units.
    pub const SETUP_ERROR: i32 = 3;

    /// A worker crashed or the run was aborted by an unexpected error.
    pub const FATAL: i32 = 255;
}

/// How bad a unit's (or the whole run's) outcome is.
///
/// Ordered: a later, less severe unit never lowers the run's severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Success,
    Failure,
    Error,
    Fatal,
}

impl Severity {
    /// The process exit code for this severity.
    pub fn exit_code(self) -> i32 {
        match self {
            Severity::Success => SplitrunExitCode::OK,
            Severity::Failure => SplitrunExitCode::TEST_FAILURES,
            Severity::Error => SplitrunExitCode::TEST_ERRORS,
            Severity::Fatal => SplitrunExitCode::FATAL,
        }
    }

    /// Severity implied by failure and error counts.
    pub fn from_counts(failures: usize, errors: usize) -> Self {
        if errors > 0 {
            Severity::Error
        } else if failures > 0 {
            Severity::Failure
        } else {
            Severity::Success
        }
    }

    /// Folds another observation in, keeping the worse of the two.
    pub fn escalate(&mut self, other: Severity) {
        *self = (*self).max(other);
    }

    pub fn is_success(self) -> bool {
        self == Severity::Success
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Success => "success",
            Severity::Failure => "failure",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(name)
    }
}
