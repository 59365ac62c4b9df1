//! Shared fixtures for unit tests.

use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::unit::CommandTemplate;

/// A worker implemented in `sh`: runs each line with `eval`, acknowledges
/// with `FINISHED`, and answers `EXIT` with `EXITED`.
pub fn shell_worker() -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        r#"SHELL_WORKER_PID=$$; export SHELL_WORKER_PID; while IFS= read -r line; do if [ "$line" = "EXIT" ]; then echo EXITED; exit 0; fi; eval "$line"; echo FINISHED; done"#
            .to_string(),
    ]
}

/// Engine script: `$0` is the unit path, `$1` the report, `$2` the optional
/// coverage file.
const COPY_SCRIPT: &str = r#"case "$0" in CRASH) echo dying; echo dying >&2; [ -n "$SHELL_WORKER_PID" ] && kill -9 "$SHELL_WORKER_PID"; exit 1;; SILENT) ;; *.slow.xml) sleep 0.5; cp "$0" "$1";; *) cp "$0" "$1";; esac; if [ -n "$2" ]; then echo "covered $0" > "$2"; fi"#;

fn copy_engine_config() -> EngineConfig {
    EngineConfig {
        command: ["sh", "-c", COPY_SCRIPT, "{path}", "{report}"]
            .map(String::from)
            .to_vec(),
        ..EngineConfig::default()
    }
}

/// An engine that copies the unit's path (a prepared JUnit file) to its
/// report. A unit named `CRASH` kills the [`shell_worker`] running it (or
/// just exits outside one), one named `SILENT` writes no report, and files
/// ending in `.slow.xml` take half a second.
pub fn copy_engine(temp_dir: &Path) -> CommandTemplate {
    CommandTemplate::from_config(&copy_engine_config())
        .with_temp_dir(Some(temp_dir.to_path_buf()))
}

/// [`copy_engine`] that also writes a coverage fragment for every unit.
pub fn coverage_engine(temp_dir: &Path) -> CommandTemplate {
    let engine = EngineConfig {
        coverage_args: vec!["{coverage}".to_string()],
        ..copy_engine_config()
    };
    CommandTemplate::from_config(&engine)
        .with_coverage(true)
        .with_temp_dir(Some(temp_dir.to_path_buf()))
}

/// Writes a one-suite JUnit report with the given case outcomes.
///
/// Each character of `cases` is one test: `.` passes, `F` fails, `E`
/// errors, `S` is skipped.
pub fn write_report(dir: &Path, suite: &str, cases: &str) -> PathBuf {
    let mut body = String::new();
    for (i, symbol) in cases.chars().enumerate() {
        let inner = match symbol {
            'F' => r#"<failure type="AssertionFailed">expected true</failure>"#,
            'E' => r#"<error type="RuntimeException">boom</error>"#,
            'S' => "<skipped/>",
            _ => "",
        };
        body.push_str(&format!(
            r#"<testcase name="test{i}" class="{suite}" assertions="1" time="0.01">{inner}</testcase>"#
        ));
    }
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><testsuites><testsuite name="{suite}" file="{suite}.t">{body}</testsuite></testsuites>"#
    );
    let path = dir.join(format!("{suite}.xml"));
    std::fs::write(&path, xml).unwrap();
    path
}
