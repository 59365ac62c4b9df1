//! Line-oriented stdio protocol spoken between the orchestrator and its workers.
//!
//! Workers are long-lived child processes. The orchestrator writes one line
//! per unit of work to the child's stdin and the child answers on stdout:
//!
//! ```text
//!  orchestrator                         worker (child)
//!       │  'engine' '--log' '/tmp/r1' 'a.t'  │
//!       │ ─────────────────────────────────► │  runs the unit
//!       │                         FINISHED   │
//!       │ ◄───────────────────────────────── │
//!       │  EXIT                              │
//!       │ ─────────────────────────────────► │  shuts down
//!       │                           EXITED   │
//!       │ ◄───────────────────────────────── │
//! ```
//!
//! Any other output line is passed through as diagnostic output. Because the
//! orchestrator reads without blocking, a read may end in the middle of a
//! line; [`LineBuffer`] keeps that tail until the rest arrives so that only
//! complete lines are ever scanned for sentinels.

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Sent by a worker after it completed one unit.
pub const FINISHED: &str = "FINISHED";

/// Sent by a worker right before it exits gracefully.
pub const EXITED: &str = "EXITED";

/// Sent to a worker to request a graceful shutdown.
pub const EXIT: &str = "EXIT";

/// Set to `1` in every child process started by the orchestrator.
pub const ENV_MARKER: &str = "SPLITRUN";

/// The worker slot token (1-based), for child-side resource namespacing.
pub const ENV_TOKEN: &str = "TEST_TOKEN";

/// A token unique across runs, for child-side resource namespacing.
pub const ENV_UNIQUE_TOKEN: &str = "UNIQUE_TEST_TOKEN";

/// A complete line read from a worker, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The worker finished one unit. Carries any text that preceded the
    /// sentinel on the same line.
    Finished(String),

    /// The worker is shutting down.
    Exited(String),

    /// Anything else: engine output, progress, warnings.
    Output(String),
}

impl Message {
    /// Classifies a complete line (without its terminator).
    pub fn parse(line: &str) -> Self {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(prefix) = try_sentinel(line, FINISHED) {
            Message::Finished(prefix.to_string())
        } else if let Some(prefix) = try_sentinel(line, EXITED) {
            Message::Exited(prefix.to_string())
        } else {
            Message::Output(line.to_string())
        }
    }
}

/// Returns the text preceding `sentinel` if `line` ends with it.
///
/// Engines do not always terminate their own output with a newline, so a
/// sentinel may share its line with leftover output.
pub fn try_sentinel<'a>(line: &'a str, sentinel: &str) -> Option<&'a str> {
    line.strip_suffix(sentinel)
}

/// Reassembles newline-terminated lines from arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns every line it completed, in order.
    ///
    /// The trailing fragment (if the chunk did not end in `\n`) stays
    /// buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);
        lines
    }

    /// Returns the incomplete tail, if any, emptying the buffer.
    ///
    /// Only used for diagnostics once the stream is closed; a fragment is
    /// never scanned for sentinels.
    pub fn take_remainder(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let rest = std::mem::take(&mut self.pending);
            Some(String::from_utf8_lossy(&rest).into_owned())
        }
    }

    /// Returns `true` if a partial line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Writes `line` followed by `\n` and flushes.
pub async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
