//! The wrapper runner: long-lived workers fed one unit at a time.
//!
//! The coordinating loop owns every worker and sweeps over them:
//!
//! ```text
//! loop while units are pending:
//!     for each worker:
//!         gone?            -> abort with its crash report
//!         busy?            -> skip
//!         flush its finished unit (report, coverage, reporter)
//!         batch exhausted? -> stop, wait, start a fresh process on the same token
//!         assign the next pending unit
//!     sleep poll_interval
//! send EXIT to every worker, flush the last units as they acknowledge
//! ```
//!
//! On any error every worker is sent `EXIT` and reaped before the run
//! returns; units still in flight are dropped unflushed.

use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{RunError, RunOptions, RunResult, RunState, Runner};
use crate::loader;
use crate::report::Reporter;
use crate::unit::{CommandTemplate, WorkUnit};
use crate::worker::{EXIT_GRACE, Token, TokenPool, Worker, WorkerState};

/// Runs units on a pool of long-lived [`Worker`]s.
///
/// Each worker holds one token for its whole life, and its replacement
/// after recycling inherits it.
pub struct WrapperRunner<R> {
    options: RunOptions,
    template: CommandTemplate,
    units: Vec<WorkUnit>,
    reporter: R,
}

impl<R: Reporter> WrapperRunner<R> {
    pub fn new(
        options: RunOptions,
        template: CommandTemplate,
        units: Vec<WorkUnit>,
        reporter: R,
    ) -> Self {
        Self {
            options,
            template,
            units,
            reporter,
        }
    }

    fn spawn(&self, token: Option<Token>) -> Result<Worker, RunError> {
        Ok(Worker::start(&self.options.worker_command, token, &self.options.env)?)
    }

    /// Assigns units until none are pending.
    async fn dispatch(
        &self,
        workers: &mut [Worker],
        pending: &mut VecDeque<WorkUnit>,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        while !pending.is_empty() {
            for worker in workers.iter_mut() {
                if !worker.is_running().await? {
                    return Err(worker.crash_error().await.into());
                }
                if !worker.is_free().await? {
                    continue;
                }
                self.flush(worker, pending, state).await?;
                if pending.is_empty() {
                    break;
                }

                if self.options.max_batch_size > 0
                    && worker.assigned() >= self.options.max_batch_size
                {
                    self.recycle(worker).await?;
                }
                if let Some(unit) = pending.pop_front() {
                    worker.assign(unit, &self.template).await?;
                }
            }
            if !pending.is_empty() {
                tokio::time::sleep(self.options.poll_interval).await;
            }
        }
        Ok(())
    }

    /// Stops every worker and flushes the units still in flight.
    async fn drain(
        &self,
        workers: &mut [Worker],
        pending: &mut VecDeque<WorkUnit>,
        state: &mut RunState,
        tokens: &mut TokenPool,
    ) -> Result<(), RunError> {
        for worker in workers.iter_mut() {
            worker.stop().await?;
        }

        loop {
            let mut busy = 0;
            for worker in workers.iter_mut() {
                if worker.state() == WorkerState::Stopped {
                    continue;
                }
                if worker.is_running().await? {
                    busy += 1;
                    continue;
                }
                if worker.is_crashed().await? || worker.in_execution() > 0 {
                    return Err(worker.crash_error().await.into());
                }
                self.flush(worker, pending, state).await?;
                worker.wait().await?;
                if let Some(token) = worker.token() {
                    tokens.release(token.id);
                }
            }
            if busy == 0 {
                return Ok(());
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn flush(
        &self,
        worker: &mut Worker,
        pending: &mut VecDeque<WorkUnit>,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        if let Some(completed) = worker.print_feedback(state.aggregator_mut()).await? {
            state.record(completed, &self.reporter, pending).await?;
        }
        Ok(())
    }

    /// Replaces an idle worker with a fresh process on the same token.
    async fn recycle(&self, worker: &mut Worker) -> Result<(), RunError> {
        debug!(
            pid = worker.pid(),
            assigned = worker.assigned(),
            "Recycling worker"
        );
        worker.stop().await?;
        worker.wait().await?;
        if worker.is_crashed().await? {
            return Err(worker.crash_error().await.into());
        }
        *worker = self.spawn(worker.token().cloned())?;
        Ok(())
    }
}

/// Shutdown after an error.
///
/// Units still in flight are not flushed, but their files are only released
/// once the worker has exited (or been killed after [`EXIT_GRACE`]), so an
/// engine still running cannot recreate them.
async fn abort(workers: &mut [Worker]) {
    for worker in workers.iter_mut() {
        if let Err(e) = worker.stop().await {
            debug!("Failed to stop worker: {}", e);
        }
    }
    for worker in workers.iter_mut() {
        let reaped = tokio::time::timeout(EXIT_GRACE, worker.wait()).await;
        match reaped {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(pid = worker.pid(), "Failed to reap worker: {}", e),
            Err(_) => {
                warn!(
                    pid = worker.pid(),
                    "Worker did not exit within {:?}, killing it", EXIT_GRACE
                );
                worker.kill();
            }
        }
    }
}

#[async_trait]
impl<R: Reporter> Runner for WrapperRunner<R> {
    async fn run(&mut self) -> Result<RunResult, RunError> {
        let start = Instant::now();
        self.options.preflight(&self.template)?;

        let units = std::mem::take(&mut self.units);
        if units.is_empty() {
            warn!("No units to run");
        }
        self.reporter
            .on_run_start(units.len(), loader::expected_tests(&units))
            .await;

        let mut state = RunState::new(&self.options)?;
        let mut pending: VecDeque<WorkUnit> = units.into();
        let mut tokens = TokenPool::new(self.options.processes);
        let count = self.options.processes.min(pending.len());
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let worker = self.spawn(tokens.acquire());
            match worker {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    abort(&mut workers).await;
                    return Err(e);
                }
            }
        }
        info!("Running {} units on {} workers", pending.len(), workers.len());

        let outcome = match self.dispatch(&mut workers, &mut pending, &mut state).await {
            Ok(()) => {
                self.drain(&mut workers, &mut pending, &mut state, &mut tokens)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            abort(&mut workers).await;
            return Err(e);
        }

        let result = state.finish(&self.options, start.elapsed())?;
        self.reporter.on_run_complete(&result).await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{NullReporter, junit, summary};
    use crate::runner::exit_codes::{Severity, SplitrunExitCode};
    use crate::testing::{copy_engine, coverage_engine, shell_worker, write_report};
    use crate::worker::WorkerError;
    use std::path::Path;
    use std::time::Duration;

    fn options() -> RunOptions {
        RunOptions::new(shell_worker())
    }

    fn leftover_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_single_process_all_passing() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units: Vec<WorkUnit> = (0..10)
            .map(|i| WorkUnit::new(write_report(fixtures.path(), &format!("Unit{i}"), ".")))
            .collect();

        let mut runner = WrapperRunner::new(options(), copy_engine(temp.path()), units, NullReporter);
        let result = runner.run().await.unwrap();

        assert_eq!(summary::footer(&result.totals), "OK (10 tests, 10 assertions)\n");
        assert_eq!(result.exit_code(), SplitrunExitCode::OK);
        assert_eq!(result.units, 10);
        assert_eq!(result.merged.suites().count(), 10);
    }

    #[tokio::test]
    async fn test_errors_dominate_failures_across_processes() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "First", "..FE")),
            WorkUnit::new(write_report(fixtures.path(), "Second", "FF.")),
        ];

        let mut runner = WrapperRunner::new(
            options().with_processes(2),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();

        assert_eq!(
            summary::footer(&result.totals),
            "FAILURES!\nTests: 7, Assertions: 7, Failures: 3, Errors: 1.\n"
        );
        assert_eq!(result.severity, Severity::Error);
        assert_eq!(result.exit_code(), SplitrunExitCode::TEST_ERRORS);
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_remaining_units() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "One", "..")),
            WorkUnit::new(write_report(fixtures.path(), "Two", ".F")),
            WorkUnit::new(write_report(fixtures.path(), "Three", "..")),
            WorkUnit::new(write_report(fixtures.path(), "Four", "..")),
        ];

        let mut runner = WrapperRunner::new(
            options().with_stop_on_failure(true),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();

        let names: Vec<&str> = result.merged.suites().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["One", "Two"]);
        assert_eq!(result.not_dispatched, 2);
        assert_eq!(result.exit_code(), SplitrunExitCode::TEST_FAILURES);
    }

    #[tokio::test]
    async fn test_worker_recycled_after_batch() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let pids = fixtures.path().join("pids.txt");
        let report = write_report(fixtures.path(), "Unit", ".");
        let script = format!(
            "echo $PPID >> {}; cp {} \"$0\"",
            pids.display(),
            report.display()
        );
        let template = CommandTemplate::new(["sh", "-c", script.as_str(), "{report}"])
            .with_temp_dir(Some(temp.path().to_path_buf()));
        let units: Vec<WorkUnit> = (0..4).map(|i| WorkUnit::new(format!("u{i}.t"))).collect();

        let mut runner = WrapperRunner::new(
            options().with_max_batch_size(2),
            template,
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();
        assert_eq!(result.units, 4);

        let written = std::fs::read_to_string(&pids).unwrap();
        let pids: Vec<&str> = written.lines().collect();
        assert_eq!(pids.len(), 4);
        assert_eq!(pids[0], pids[1]);
        assert_eq!(pids[2], pids[3]);
        assert_ne!(pids[1], pids[2]);
    }

    #[tokio::test]
    async fn test_tokens_are_exported_and_distinct() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tokens = fixtures.path().join("tokens.txt");
        let report = write_report(fixtures.path(), "Unit", ".");
        let script = format!(
            "echo $TEST_TOKEN >> {}; sleep 0.2; cp {} \"$0\"",
            tokens.display(),
            report.display()
        );
        let template = CommandTemplate::new(["sh", "-c", script.as_str(), "{report}"])
            .with_temp_dir(Some(temp.path().to_path_buf()));
        let units: Vec<WorkUnit> = (0..2).map(|i| WorkUnit::new(format!("u{i}.t"))).collect();

        let mut runner = WrapperRunner::new(options().with_processes(2), template, units, NullReporter);
        runner.run().await.unwrap();

        let written = std::fs::read_to_string(&tokens).unwrap();
        let mut seen: Vec<&str> = written.lines().collect();
        seen.sort();
        assert_eq!(seen, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_crash_aborts_with_last_command() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let template = copy_engine(temp.path());
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "Fine", "..")),
            WorkUnit::new("CRASH"),
        ];

        let mut runner = WrapperRunner::new(options(), template, units, NullReporter);
        let err = runner.run().await.unwrap_err();

        let RunError::Crashed(report) = &err else {
            panic!("expected crash, got {err:?}");
        };
        assert_eq!(report.unit.as_deref(), Some("CRASH"));
        let command = report.command.as_deref().unwrap();
        assert!(command.contains(" CRASH "));
        assert!(report.stderr.contains("dying"));
        assert_eq!(err.exit_code(), SplitrunExitCode::FATAL);
    }

    #[tokio::test]
    async fn test_empty_report_is_a_crash() {
        let temp = tempfile::tempdir().unwrap();
        let units = vec![WorkUnit::new("SILENT")];

        let mut runner = WrapperRunner::new(options(), copy_engine(temp.path()), units, NullReporter);
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, RunError::Crashed(_)));
    }

    #[tokio::test]
    async fn test_temp_files_removed_after_success_and_failure() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "A", ".")),
            WorkUnit::new(write_report(fixtures.path(), "B", "F")),
            WorkUnit::new(write_report(fixtures.path(), "C", ".")),
        ];
        let mut runner = WrapperRunner::new(
            options().with_processes(2),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        runner.run().await.unwrap();
        assert!(leftover_files(temp.path()).is_empty());

        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "D", ".")),
            WorkUnit::new("CRASH"),
        ];
        let mut runner = WrapperRunner::new(options(), copy_engine(temp.path()), units, NullReporter);
        runner.run().await.unwrap_err();
        assert!(leftover_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_crash_waits_for_units_in_flight() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "Unit.slow", ".")),
            WorkUnit::new("CRASH"),
        ];

        let mut runner = WrapperRunner::new(
            options().with_processes(2),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, RunError::Crashed(_)));

        // Long enough for the slow engine to have finished had it still
        // been running.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(leftover_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_line_break_in_unit_path_is_rejected() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(fixtures.path().join("odd\nname.xml")),
            WorkUnit::new(write_report(fixtures.path(), "Unit", ".")),
        ];

        let mut runner = WrapperRunner::new(options(), copy_engine(temp.path()), units, NullReporter);
        let err = runner.run().await.unwrap_err();

        assert!(matches!(
            err,
            RunError::Worker(WorkerError::MultilineCommand { .. })
        ));
        assert_eq!(err.exit_code(), SplitrunExitCode::FATAL);
        assert!(leftover_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_coverage_fragments_collected() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let coverage = fixtures.path().join("coverage");
        let units: Vec<WorkUnit> = (0..3)
            .map(|i| WorkUnit::new(write_report(fixtures.path(), &format!("Unit{i}"), ".")))
            .collect();

        let mut runner = WrapperRunner::new(
            options()
                .with_processes(2)
                .with_coverage_dir(Some(coverage.clone())),
            coverage_engine(temp.path()),
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();
        assert_eq!(result.coverage_fragments, Some(3));

        let mut fragments = leftover_files(&coverage);
        fragments.sort();
        assert_eq!(fragments, vec!["unit-0001.cov", "unit-0002.cov", "unit-0003.cov"]);
        let fragment = std::fs::read_to_string(coverage.join("unit-0001.cov")).unwrap();
        assert!(fragment.starts_with("covered "));
        assert!(leftover_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_merged_log_conserves_counts() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let log = fixtures.path().join("out/junit.xml");
        let cases = ["..F", "E.S", "....", "F"];
        let units: Vec<WorkUnit> = cases
            .iter()
            .enumerate()
            .map(|(i, c)| WorkUnit::new(write_report(fixtures.path(), &format!("S{i}"), c)))
            .collect();

        let mut runner = WrapperRunner::new(
            options().with_processes(3).with_log_junit(Some(log.clone())),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();

        let mut expected = crate::report::Totals::default();
        for (i, _) in cases.iter().enumerate() {
            let suite = junit::read_report(&fixtures.path().join(format!("S{i}.xml")))
                .unwrap()
                .unwrap();
            expected.add(&suite.totals());
        }
        let counts = |t: &crate::report::Totals| {
            (t.tests, t.assertions, t.failures, t.errors, t.skipped)
        };
        assert_eq!(counts(&result.totals), counts(&expected));
        assert_eq!(counts(&expected), (11, 11, 2, 1, 1));

        let written = junit::read_report(&log).unwrap().unwrap();
        assert_eq!(counts(&written.totals()), counts(&expected));
    }

    #[tokio::test]
    async fn test_no_units_is_success() {
        let temp = tempfile::tempdir().unwrap();
        let mut runner = WrapperRunner::new(options(), copy_engine(temp.path()), Vec::new(), NullReporter);
        let result = runner.run().await.unwrap();
        assert_eq!(result.units, 0);
        assert_eq!(result.exit_code(), SplitrunExitCode::OK);
    }
}
