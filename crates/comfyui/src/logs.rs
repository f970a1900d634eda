//! Engine output forwarding.
//!
//! Each engine pipe is drained by its own task so the child never blocks
//! on a full buffer. Lines are re-emitted as `tracing` events under the
//! `engine` target. The stderr task also keeps a bounded tail, read only
//! to enrich a crash report.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Maximum bytes of stderr reported for a crashed engine.
pub const STDERR_TAIL_BYTES: usize = 4000;

/// Maximum lines retained in a [`TailBuffer`].
const TAIL_MAX_LINES: usize = 200;

/// Which engine pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Bounded buffer of the most recent lines of a stream.
#[derive(Debug, Clone, Default)]
pub struct TailBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl TailBuffer {
    pub fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == TAIL_MAX_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    /// The buffered lines joined by newlines, cut to the last
    /// [`STDERR_TAIL_BYTES`] bytes.
    pub fn snapshot(&self) -> String {
        let joined = match self.lines.lock() {
            Ok(lines) => lines.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => return String::new(),
        };
        if joined.len() <= STDERR_TAIL_BYTES {
            return joined;
        }
        let mut start = joined.len() - STDERR_TAIL_BYTES;
        while !joined.is_char_boundary(start) {
            start += 1;
        }
        joined[start..].to_string()
    }
}

/// Spawn a task that forwards every line of `reader` until EOF.
///
/// Invalid UTF-8 is replaced rather than ending the drain.
pub fn spawn_forwarder<R>(reader: R, stream: StreamKind, tail: Option<TailBuffer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    tracing::info!(target: "engine", stream = stream.as_str(), "{line}");
                    if let Some(tail) = &tail {
                        tail.push(line);
                    }
                }
                Err(e) => {
                    tracing::debug!(stream = stream.as_str(), error = %e, "Engine stream closed");
                    break;
                }
            }
        }
    })
}
