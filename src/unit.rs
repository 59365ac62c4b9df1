//! Units of work and the command each one is executed with.
//!
//! A [`WorkUnit`] is one independently runnable slice of the suite: a test
//! file, optionally narrowed to a set of test names. Units are produced by a
//! [loader](crate::loader), handed to workers by a [runner](crate::runner),
//! and destroyed once their report has been consumed.
//!
//! Each unit owns the temporary file its engine writes the JUnit report to.
//! The file is created lazily, exists (empty) while the unit is in flight,
//! and is deleted by [`WorkUnit::cleanup`] or on drop.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::TempPath;

use crate::config::EngineConfig;

/// One independently executable slice of the test suite.
#[derive(Debug, Serialize)]
pub struct WorkUnit {
    /// File (or suite reference) the engine runs.
    pub path: PathBuf,

    /// Test names to narrow the run to. Empty means "the whole file".
    pub filters: Vec<String>,

    /// How many tests the loader expects this unit to run, if known.
    pub expected_tests: Option<usize>,

    #[serde(skip)]
    report: Option<TempPath>,

    #[serde(skip)]
    coverage: Option<TempPath>,
}

impl WorkUnit {
    /// Creates a unit running the whole of `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            filters: Vec::new(),
            expected_tests: None,
            report: None,
            coverage: None,
        }
    }

    /// Narrows the unit to the given test names.
    pub fn with_filters<I, S>(mut self, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filters = filters.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the expected-test-count hint.
    pub fn with_expected_tests(mut self, count: usize) -> Self {
        self.expected_tests = Some(count);
        self
    }

    /// Returns the report file, creating it on first use.
    pub fn report_path(&mut self, temp_dir: Option<&Path>) -> io::Result<&Path> {
        let report = match self.report.take() {
            Some(report) => report,
            None => create_temp(temp_dir, "splitrun-log-", ".xml")?,
        };
        Ok(self.report.insert(report))
    }

    /// Returns the coverage file, creating it on first use.
    pub fn coverage_path(&mut self, temp_dir: Option<&Path>) -> io::Result<&Path> {
        let coverage = match self.coverage.take() {
            Some(coverage) => coverage,
            None => create_temp(temp_dir, "splitrun-cov-", ".cov")?,
        };
        Ok(self.coverage.insert(coverage))
    }

    /// The report file, if one was created.
    pub fn report_file(&self) -> Option<&Path> {
        self.report.as_deref()
    }

    /// The coverage file, if one was created.
    pub fn coverage_file(&self) -> Option<&Path> {
        self.coverage.as_deref()
    }

    /// Deletes the unit's temporary files.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn cleanup(&mut self) -> io::Result<()> {
        if let Some(report) = self.report.take() {
            report.close()?;
        }
        if let Some(coverage) = self.coverage.take() {
            coverage.close()?;
        }
        Ok(())
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())?;
        if !self.filters.is_empty() {
            write!(f, "::{}", self.filters.join(","))?;
        }
        Ok(())
    }
}

fn create_temp(dir: Option<&Path>, prefix: &str, suffix: &str) -> io::Result<TempPath> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(prefix).suffix(suffix);
    let file = match dir {
        Some(dir) => builder.tempfile_in(dir)?,
        None => builder.tempfile()?,
    };
    Ok(file.into_temp_path())
}

/// Renders the engine command line for a unit.
///
/// The template is an argv with placeholders:
///
/// | Placeholder | Replaced with |
/// |-------------|---------------|
/// | `{path}` | the unit's path |
/// | `{report}` | the unit's report file |
/// | `{coverage}` | the unit's coverage file |
/// | `{configuration}` | the engine configuration path |
/// | `{token}` | the worker token (empty if none) |
/// | `{filter}` | (whole argument) `filter_args`, or nothing without filters |
///
/// Inside `filter_args`, `{pattern}` expands to an anchored regex matching
/// exactly the unit's filter names.
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    args: Vec<String>,
    filter_args: Vec<String>,
    coverage_args: Vec<String>,
    configuration: Option<PathBuf>,
    collect_coverage: bool,
    temp_dir: Option<PathBuf>,
}

impl CommandTemplate {
    /// Builds a template from the `[engine]` configuration.
    pub fn from_config(engine: &EngineConfig) -> Self {
        Self {
            args: engine.command.clone(),
            filter_args: engine.filter_args.clone(),
            coverage_args: engine.coverage_args.clone(),
            configuration: engine.configuration.clone(),
            collect_coverage: false,
            temp_dir: None,
        }
    }

    /// Creates a template from a bare argv, with default filter arguments.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            filter_args: vec!["--filter".to_string(), "{pattern}".to_string()],
            coverage_args: Vec::new(),
            configuration: None,
            collect_coverage: false,
            temp_dir: None,
        }
    }

    /// Enables appending `coverage_args` to every command.
    ///
    /// Stays disabled if there are no coverage arguments.
    pub fn with_coverage(mut self, enabled: bool) -> Self {
        self.collect_coverage = enabled && !self.coverage_args.is_empty();
        self
    }

    /// Creates temporary files under `dir` instead of the system default.
    pub fn with_temp_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.temp_dir = dir;
        self
    }

    /// Whether coverage collection is enabled.
    pub fn collects_coverage(&self) -> bool {
        self.collect_coverage
    }

    /// The engine configuration file, if one is set.
    pub fn configuration(&self) -> Option<&Path> {
        self.configuration.as_deref()
    }

    /// Directory for unit temp files, if not the system default.
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }

    /// `true` if there is no command to run.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Renders the argv for `unit`, creating its temp files as needed.
    pub fn render(&self, unit: &mut WorkUnit, token: Option<usize>) -> io::Result<Vec<String>> {
        let report = unit
            .report_path(self.temp_dir.as_deref())?
            .to_string_lossy()
            .into_owned();
        let coverage = if self.collect_coverage {
            unit.coverage_path(self.temp_dir.as_deref())?
                .to_string_lossy()
                .into_owned()
        } else {
            String::new()
        };
        let pattern = filter_pattern(&unit.filters);

        let vars = Vars {
            path: unit.path.to_string_lossy().into_owned(),
            report,
            coverage,
            configuration: self
                .configuration
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
            token: token.map(|t| t.to_string()).unwrap_or_default(),
            pattern,
        };

        let mut argv = Vec::with_capacity(self.args.len() + 2);
        for arg in &self.args {
            if arg == "{filter}" {
                if !unit.filters.is_empty() {
                    argv.extend(self.filter_args.iter().map(|a| vars.substitute(a)));
                }
            } else {
                argv.push(vars.substitute(arg));
            }
        }
        if self.collect_coverage {
            argv.extend(self.coverage_args.iter().map(|a| vars.substitute(a)));
        }
        Ok(argv)
    }

    /// Renders the command as a single shell-quoted line.
    pub fn render_line(&self, unit: &mut WorkUnit, token: Option<usize>) -> io::Result<String> {
        Ok(shell_words::join(self.render(unit, token)?))
    }
}

struct Vars {
    path: String,
    report: String,
    coverage: String,
    configuration: String,
    token: String,
    pattern: String,
}

impl Vars {
    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "path" => Some(self.path.as_str()),
            "report" => Some(self.report.as_str()),
            "coverage" => Some(self.coverage.as_str()),
            "configuration" => Some(self.configuration.as_str()),
            "token" => Some(self.token.as_str()),
            "pattern" => Some(self.pattern.as_str()),
            _ => None,
        }
    }

    /// Replaces placeholders in one pass; inserted values are not rescanned
    /// and unknown `{...}` text is kept as is.
    fn substitute(&self, arg: &str) -> String {
        let mut out = String::with_capacity(arg.len());
        let mut rest = arg;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let placeholder = tail
                .find('}')
                .and_then(|end| self.lookup(&tail[1..end]).map(|value| (end, value)));
            match placeholder {
                Some((end, value)) => {
                    out.push_str(value);
                    rest = &tail[end + 1..];
                }
                None => {
                    out.push('{');
                    rest = &tail[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Builds `^(?:a|b)$` from the filter names, regex-escaped.
fn filter_pattern(filters: &[String]) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let alternatives: Vec<String> = filters.iter().map(|f| regex::escape(f)).collect();
    format!("^(?:{})$", alternatives.join("|"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_filters() {
        let unit = WorkUnit::new("tests/FooTest.php").with_filters(["testA", "testB"]);
        assert_eq!(unit.to_string(), "tests/FooTest.php::testA,testB");
        assert_eq!(WorkUnit::new("a.t").to_string(), "a.t");
    }

    #[test]
    fn test_report_file_created_lazily_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = WorkUnit::new("a.t");
        assert!(unit.report_file().is_none());

        let path = unit.report_path(Some(dir.path())).unwrap().to_path_buf();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // Same file on subsequent calls.
        assert_eq!(unit.report_path(Some(dir.path())).unwrap(), path);

        unit.cleanup().unwrap();
        assert!(!path.exists());
        unit.cleanup().unwrap();
    }

    #[test]
    fn test_render_without_filters_drops_filter_args() {
        let dir = tempfile::tempdir().unwrap();
        let template = CommandTemplate::new(["engine", "--log", "{report}", "{filter}", "{path}"])
            .with_temp_dir(Some(dir.path().to_path_buf()));
        let mut unit = WorkUnit::new("tests/a.t");

        let argv = template.render(&mut unit, Some(2)).unwrap();
        let report = unit.report_file().unwrap().to_string_lossy().into_owned();
        assert_eq!(argv, vec!["engine", "--log", &report, "tests/a.t"]);
    }

    #[test]
    fn test_render_with_filters_escapes_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let template = CommandTemplate::new(["engine", "{filter}", "{path}", "t={token}"])
            .with_temp_dir(Some(dir.path().to_path_buf()));
        let mut unit = WorkUnit::new("a.t").with_filters(["test.one", "two"]);

        let argv = template.render(&mut unit, Some(3)).unwrap();
        assert_eq!(
            argv,
            vec!["engine", "--filter", r"^(?:test\.one|two)$", "a.t", "t=3"]
        );
    }

    #[test]
    fn test_render_appends_coverage_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = EngineConfig::default();
        engine.command = vec!["engine".into(), "{path}".into()];
        engine.coverage_args = vec!["--coverage".into(), "{coverage}".into()];
        let template = CommandTemplate::from_config(&engine)
            .with_coverage(true)
            .with_temp_dir(Some(dir.path().to_path_buf()));
        let mut unit = WorkUnit::new("a.t");

        let argv = template.render(&mut unit, None).unwrap();
        let coverage = unit.coverage_file().unwrap().to_string_lossy().into_owned();
        assert_eq!(argv, vec!["engine", "a.t", "--coverage", &coverage]);
    }

    #[test]
    fn test_placeholders_in_values_are_not_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let template = CommandTemplate::new(["engine", "--log={report}", "{path}", "{other}"])
            .with_temp_dir(Some(dir.path().to_path_buf()));
        let mut unit = WorkUnit::new("tests/{report}/{token}.t");

        let argv = template.render(&mut unit, Some(1)).unwrap();
        let report = unit.report_file().unwrap().to_string_lossy().into_owned();
        assert_eq!(
            argv,
            vec![
                "engine".to_string(),
                format!("--log={report}"),
                "tests/{report}/{token}.t".to_string(),
                "{other}".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_line_quotes_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let template = CommandTemplate::new(["engine", "{path}"])
            .with_temp_dir(Some(dir.path().to_path_buf()));
        let mut unit = WorkUnit::new("dir with space/a.t");

        let line = template.render_line(&mut unit, None).unwrap();
        assert_eq!(line, "engine 'dir with space/a.t'");
    }
}
