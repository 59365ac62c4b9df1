//! The child side of the worker protocol.
//!
//! `splitrun worker` runs this loop: it reads one command line per unit from
//! stdin, runs it to completion with inherited stdio, and acknowledges with
//! `FINISHED`. `EXIT` (or end of input) ends the loop with `EXITED`.
//!
//! The engine's exit status is not reported, since a failing test run exits
//! non-zero; the outcome is read from the report file. An engine that
//! cannot even be started leaves an empty report, which the orchestrator
//! turns into a crash carrying this process's stderr.

use std::io;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tracing::debug;

use crate::protocol::{self, EXIT, EXITED, FINISHED};

/// Serves commands from stdin until `EXIT`.
pub async fn serve() -> io::Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    serve_lines(stdin, &mut stdout).await
}

async fn serve_lines<R, W>(input: R, output: &mut W) -> io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line == EXIT {
            break;
        }
        if line.is_empty() {
            continue;
        }

        match run_command(line).await {
            Ok(status) => debug!("Command exited with {}: {}", status, line),
            Err(e) => eprintln!("splitrun worker: failed to run `{}`: {}", line, e),
        }
        protocol::write_line(output, FINISHED).await?;
    }

    protocol::write_line(output, EXITED).await
}

async fn run_command(line: &str) -> io::Result<ExitStatus> {
    let argv = shell_words::split(line)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let Some((program, args)) = argv.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };

    tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .status()
        .await
}
