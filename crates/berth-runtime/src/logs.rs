//! Line-oriented log streams over raw runtime output.
//!
//! A [`LogStream`] is lazy: lines are produced as the runtime delivers
//! chunks. Dropping the stream stops its forwarding tasks.

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::backend::LogChunks;

const LINE_CHANNEL_CAPACITY: usize = 256;

/// One line of container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Service that produced the line.
    pub service: String,
    /// Line text without the trailing newline.
    pub text: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} | {}", self.service, self.text)
    }
}

/// A stream of log lines from one or more services.
///
/// Finite when built from non-following sources; otherwise it ends when
/// every source ends or the stream is dropped.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<LogLine>,
    _guard: DropGuard,
}

impl LogStream {
    /// Lines of a single service.
    #[must_use]
    pub fn single(service: impl Into<String>, chunks: LogChunks) -> Self {
        Self::merge(vec![(service.into(), chunks)])
    }

    /// Interleaves several services' output in arrival order.
    #[must_use]
    pub fn merge(sources: Vec<(String, LogChunks)>) -> Self {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        for (service, chunks) in sources {
            drop(tokio::spawn(forward(
                service,
                chunks,
                tx.clone(),
                token.child_token(),
            )));
        }
        Self {
            rx,
            _guard: token.drop_guard(),
        }
    }

    /// Waits for the next line; `None` once every source has ended.
    pub async fn next(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }

    /// Drains a finite stream.
    pub async fn collect(mut self) -> Vec<LogLine> {
        let mut lines = Vec::new();
        while let Some(line) = self.next().await {
            lines.push(line);
        }
        lines
    }
}

async fn forward(
    service: String,
    mut chunks: LogChunks,
    tx: mpsc::Sender<LogLine>,
    cancel: CancellationToken,
) {
    let mut splitter = LineSplitter::default();
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return,
            chunk = chunks.recv() => chunk,
        };
        let Some(bytes) = chunk else {
            if let Some(text) = splitter.finish() {
                let _ = tx.send(LogLine { service, text }).await;
            }
            return;
        };
        for text in splitter.push(&bytes) {
            let line = LogLine {
                service: service.clone(),
                text,
            };
            if tx.send(line).await.is_err() {
                return;
            }
        }
    }
}

/// Reassembles lines split across chunk boundaries.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            let _ = line.pop();
            if line.last() == Some(&b'\r') {
                let _ = line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
