//! The oneshot runner: a fresh engine process per unit.
//!
//! No worker protocol is involved. At most `processes` engine processes run
//! at once, each under a token taken from the [`TokenPool`] and returned
//! when the process is reaped. A process that exits without writing its
//! report counts as a crash, whatever its exit status.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RunError, RunOptions, RunResult, RunState, Runner};
use crate::loader;
use crate::protocol;
use crate::report::{ReportError, Reporter};
use crate::unit::{CommandTemplate, WorkUnit};
use crate::worker::{CompletedUnit, CrashReport, EXIT_GRACE, Token, TokenPool, WorkerError};

/// An engine process and the unit it runs.
struct Job {
    unit: WorkUnit,
    token: Token,
    command: String,
    child: Child,
    stdout: JoinHandle<Vec<u8>>,
    stderr: JoinHandle<Vec<u8>>,
}

impl Job {
    async fn crash_report(self, status: ExitStatus) -> CrashReport {
        CrashReport {
            token: Some(self.token.id),
            unit: Some(self.unit.to_string()),
            command: Some(self.command),
            status: Some(status),
            stdout: collect(self.stdout).await,
            stderr: collect(self.stderr).await,
        }
    }
}

async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(EXIT_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

fn capture<S: AsyncRead + Unpin + Send + 'static>(stream: Option<S>) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream
            && let Err(e) = stream.read_to_end(&mut buf).await
        {
            debug!("Failed to read engine output: {}", e);
        }
        buf
    })
}

/// Waits for the engines still running after an error, so their units'
/// files are not released under them; stragglers are killed after
/// [`EXIT_GRACE`].
async fn abort(running: &mut [Job]) {
    for job in running.iter_mut() {
        debug!(token = job.token.id, "Abandoning {}", job.unit);
        if tokio::time::timeout(EXIT_GRACE, job.child.wait()).await.is_err() {
            warn!(token = job.token.id, "Killing {}", job.command);
            if let Err(e) = job.child.start_kill() {
                debug!("Failed to kill engine: {}", e);
            }
        }
    }
}

/// Runs every unit in its own engine process.
pub struct OneshotRunner<R> {
    options: RunOptions,
    template: CommandTemplate,
    units: Vec<WorkUnit>,
    reporter: R,
}

impl<R: Reporter> OneshotRunner<R> {
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

    fn spawn(&self, mut unit: WorkUnit, token: Token) -> Result<Job, RunError> {
        let argv = self.template.render(&mut unit, Some(token.id))?;
        let command = shell_words::join(&argv);
        let Some((program, args)) = argv.split_first() else {
            return Err(RunError::Setup("No engine command configured".to_string()));
        };

        let mut process = tokio::process::Command::new(program);
        process
            .args(args)
            .env(protocol::ENV_MARKER, "1")
            .env(protocol::ENV_TOKEN, token.id.to_string())
            .env(protocol::ENV_UNIQUE_TOKEN, &token.unique)
            .envs(self.options.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = process.spawn().map_err(|source| WorkerError::Spawn {
            command: command.clone(),
            source,
        })?;

        debug!(token = token.id, unit = %unit, "Started: {}", command);
        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());
        Ok(Job {
            unit,
            token,
            command,
            child,
            stdout,
            stderr,
        })
    }

    /// Flushes a reaped job.
    async fn finish_job(
        &self,
        job: Job,
        status: ExitStatus,
        pending: &mut VecDeque<WorkUnit>,
        state: &mut RunState,
    ) -> Result<(), RunError> {
        debug!(token = job.token.id, unit = %job.unit, "Exited: {}", status);
        match state.aggregator_mut().consume(&job.unit) {
            Ok(outcome) => {
                let completed = CompletedUnit {
                    unit: job.unit,
                    outcome,
                };
                state.record(completed, &self.reporter, pending).await
            }
            Err(ReportError::EmptyReport { .. }) => {
                Err(RunError::Crashed(Box::new(job.crash_report(status).await)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(
        &self,
        running: &mut Vec<Job>,
        pending: &mut VecDeque<WorkUnit>,
        state: &mut RunState,
        tokens: &mut TokenPool,
    ) -> Result<(), RunError> {
        while !pending.is_empty() || !running.is_empty() {
            let mut i = 0;
            while i < running.len() {
                match running[i].child.try_wait()? {
                    None => i += 1,
                    Some(status) => {
                        let job = running.remove(i);
                        tokens.release(job.token.id);
                        self.finish_job(job, status, pending, state).await?;
                    }
                }
            }

            while !pending.is_empty() {
                let Some(token) = tokens.acquire() else {
                    break;
                };
                let Some(unit) = pending.pop_front() else {
                    tokens.release(token.id);
                    break;
                };
                running.push(self.spawn(unit, token)?);
            }

            if !running.is_empty() {
                tokio::time::sleep(self.options.poll_interval).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<R: Reporter> Runner for OneshotRunner<R> {
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
        let mut running = Vec::new();
        info!(
            "Running {} units, {} at a time",
            pending.len(),
            self.options.processes
        );

        if let Err(e) = self
            .execute(&mut running, &mut pending, &mut state, &mut tokens)
            .await
        {
            abort(&mut running).await;
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
    use crate::report::{NullReporter, summary};
    use crate::runner::exit_codes::SplitrunExitCode;
    use crate::testing::{copy_engine, coverage_engine, write_report};
    use std::time::Duration;

    fn options() -> RunOptions {
        RunOptions::new(Vec::new())
    }

    #[tokio::test]
    async fn test_runs_each_unit_once() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units: Vec<WorkUnit> = (0..5)
            .map(|i| WorkUnit::new(write_report(fixtures.path(), &format!("Unit{i}"), "..")))
            .collect();

        let mut runner = OneshotRunner::new(
            options().with_processes(3),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();

        assert_eq!(result.units, 5);
        assert_eq!(summary::footer(&result.totals), "OK (10 tests, 10 assertions)\n");
        assert_eq!(result.exit_code(), SplitrunExitCode::OK);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_bounded_by_tokens() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let tokens = fixtures.path().join("tokens.txt");
        let report = write_report(fixtures.path(), "Unit", ".");
        let script = format!(
            "echo $TEST_TOKEN >> {}; cp {} \"$0\"",
            tokens.display(),
            report.display()
        );
        let template = CommandTemplate::new(["sh", "-c", script.as_str(), "{report}"])
            .with_temp_dir(Some(temp.path().to_path_buf()));
        let units: Vec<WorkUnit> = (0..6).map(|i| WorkUnit::new(format!("u{i}.t"))).collect();

        let mut runner = OneshotRunner::new(options().with_processes(2), template, units, NullReporter);
        runner.run().await.unwrap();

        let written = std::fs::read_to_string(&tokens).unwrap();
        assert_eq!(written.lines().count(), 6);
        assert!(written.lines().all(|t| t == "1" || t == "2"));
    }

    #[tokio::test]
    async fn test_missing_report_is_a_crash() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "Fine", ".")),
            WorkUnit::new("CRASH"),
        ];

        let mut runner = OneshotRunner::new(options(), copy_engine(temp.path()), units, NullReporter);
        let err = runner.run().await.unwrap_err();

        let RunError::Crashed(report) = &err else {
            panic!("expected crash, got {err:?}");
        };
        assert_eq!(report.unit.as_deref(), Some("CRASH"));
        assert!(report.command.as_deref().is_some_and(|c| c.contains(" CRASH ")));
        assert!(report.stdout.contains("dying"));
        assert!(report.status.is_some_and(|s| !s.success()));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_crash_waits_for_engines_still_running() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "Unit.slow", ".")),
            WorkUnit::new("CRASH"),
        ];

        let mut runner = OneshotRunner::new(
            options().with_processes(2),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, RunError::Crashed(_)));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_engine_spawn_failure_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let template = CommandTemplate::new(["/definitely/not/an/engine", "{path}"])
            .with_temp_dir(Some(temp.path().to_path_buf()));

        let mut runner = OneshotRunner::new(
            options(),
            template,
            vec![WorkUnit::new("a.t")],
            NullReporter,
        );
        let err = runner.run().await.unwrap_err();

        assert!(matches!(err, RunError::Worker(WorkerError::Spawn { .. })));
        assert_eq!(err.exit_code(), SplitrunExitCode::FATAL);
    }

    #[tokio::test]
    async fn test_coverage_fragments_collected() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let coverage = fixtures.path().join("coverage");
        let units: Vec<WorkUnit> = (0..2)
            .map(|i| WorkUnit::new(write_report(fixtures.path(), &format!("Unit{i}"), ".")))
            .collect();

        let mut runner = OneshotRunner::new(
            options().with_coverage_dir(Some(coverage.clone())),
            coverage_engine(temp.path()),
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();

        assert_eq!(result.coverage_fragments, Some(2));
        assert_eq!(std::fs::read_dir(&coverage).unwrap().count(), 2);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_failures_set_exit_code() {
        let fixtures = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        let units = vec![
            WorkUnit::new(write_report(fixtures.path(), "A", ".F")),
            WorkUnit::new(write_report(fixtures.path(), "B", "..")),
        ];

        let mut runner = OneshotRunner::new(
            options().with_processes(2),
            copy_engine(temp.path()),
            units,
            NullReporter,
        );
        let result = runner.run().await.unwrap();
        assert_eq!(result.exit_code(), SplitrunExitCode::TEST_FAILURES);
    }
}
