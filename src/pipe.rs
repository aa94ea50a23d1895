//! Copying of a child process's output streams.
//!
//! An [`OutputPipe`] forwards everything read from one stream to a sink on a
//! background task, and can optionally report when a byte pattern has shown
//! up in the stream. Forks use it to decide when a freshly started process
//! is ready, e.g. once it has printed `Server Started!`.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

const BUFFER_SIZE: usize = 8 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum PipeError {
    #[error("The `{pattern}` pattern did not appear on {stream} before timeout was reached.")]
    TimedOut { stream: String, pattern: String },
    #[error("The {stream} stream closed before the `{pattern}` pattern appeared.")]
    StreamClosed { stream: String, pattern: String },
    #[error("The {stream} stream was still open when copying was abandoned.")]
    StillOpen { stream: String },
    #[error("Failed to copy the {stream} stream.")]
    Copy {
        stream: String,
        #[source]
        source: io::Error,
    },
}

pub struct OutputPipe {
    stream: String,
    pattern: Option<String>,
    pattern_seen: watch::Receiver<bool>,
    copy_task: JoinHandle<io::Result<()>>,
}

impl OutputPipe {
    /// Start copying `reader` into `writer`. An empty pattern counts as no
    /// pattern at all.
    pub fn spawn<R, W>(
        stream: impl Into<String>,
        reader: R,
        writer: W,
        pattern: Option<String>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pattern = pattern.filter(|p| !p.is_empty());
        let (sender, pattern_seen) = watch::channel(pattern.is_none());
        let matcher = pattern.as_deref().map(PatternMatcher::new);
        let copy_task = tokio::spawn(copy_stream(reader, writer, matcher, sender));

        Self {
            stream: stream.into(),
            pattern,
            pattern_seen,
            copy_task,
        }
    }

    /// Block until the pattern has been seen in the stream.
    pub async fn wait_for_pattern(&mut self) -> Result<(), PipeError> {
        if self.pattern_seen.wait_for(|seen| *seen).await.is_ok() {
            return Ok(());
        }
        Err(PipeError::StreamClosed {
            stream: self.stream.clone(),
            pattern: self.pattern.clone().unwrap_or_default(),
        })
    }

    pub async fn wait_for_pattern_timeout(&mut self, timeout: Duration) -> Result<(), PipeError> {
        match tokio::time::timeout(timeout, self.wait_for_pattern()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipeError::TimedOut {
                stream: self.stream.clone(),
                pattern: self.pattern.clone().unwrap_or_default(),
            }),
        }
    }

    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    /// Wait for the stream to reach its end and the sink to be closed.
    pub async fn finish(self) -> Result<(), PipeError> {
        let joined = self.copy_task.await;
        copy_outcome(self.stream, joined)
    }

    /// Like [`OutputPipe::finish`], but abandons the copy once `timeout`
    /// elapses, e.g. because a surviving descendant still holds the stream.
    pub async fn finish_timeout(mut self, timeout: Duration) -> Result<(), PipeError> {
        match tokio::time::timeout(timeout, &mut self.copy_task).await {
            Ok(joined) => copy_outcome(self.stream, joined),
            Err(_) => {
                self.copy_task.abort();
                Err(PipeError::StillOpen {
                    stream: self.stream,
                })
            }
        }
    }
}

fn copy_outcome(
    stream: String,
    joined: Result<io::Result<()>, JoinError>,
) -> Result<(), PipeError> {
    let outcome = match joined {
        Ok(outcome) => outcome,
        Err(e) => Err(io::Error::other(e)),
    };
    outcome.map_err(|source| PipeError::Copy { stream, source })
}

async fn copy_stream<R, W>(
    mut reader: R,
    mut writer: W,
    mut matcher: Option<PatternMatcher>,
    pattern_seen: watch::Sender<bool>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        writer.write_all(chunk).await?;
        writer.flush().await?;

        if matcher.as_mut().is_some_and(|m| m.feed(chunk)) {
            pattern_seen.send_replace(true);
            matcher = None;
        }
    }
    tracing::trace!("Closing the output sink");
    writer.shutdown().await
}

/// Sliding window over the most recent bytes, so that a pattern split
/// across reads is still found.
struct PatternMatcher {
    pattern: Vec<u8>,
    window: VecDeque<u8>,
}

impl PatternMatcher {
    fn new(pattern: &str) -> Self {
        let pattern = pattern.as_bytes().to_vec();
        Self {
            window: VecDeque::with_capacity(pattern.len()),
            pattern,
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            if self.window.len() == self.pattern.len() {
                self.window.pop_front();
            }
            self.window.push_back(byte);
            if self.window.len() == self.pattern.len() && self.window.iter().eq(&self.pattern) {
                return true;
            }
        }
        false
    }
}

/// Sink turning each line of process output into a `tracing` event.
pub struct LogWriter {
    fork: String,
    stream: &'static str,
    pending: Vec<u8>,
}

impl LogWriter {
    pub fn new(fork: impl Into<String>, stream: &'static str) -> Self {
        Self {
            fork: fork.into(),
            stream,
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &str) {
        tracing::info!(fork = %self.fork, stream = self.stream, "{}", line);
    }
}

impl AsyncWrite for LogWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pending.extend_from_slice(buf);
        for line in take_complete_lines(&mut this.pending) {
            this.emit(&line);
        }
        Poll::Ready(Ok(buf.len()))
    }

    // Partial lines stay pending until their newline or shutdown arrives
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending.is_empty() {
            let rest = std::mem::take(&mut this.pending);
            this.emit(String::from_utf8_lossy(&rest).trim_end_matches('\r'));
        }
        Poll::Ready(Ok(()))
    }
}

fn take_complete_lines(pending: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(end) = pending.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = pending.drain(..=end).collect();
        lines.push(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        );
    }
    lines
}
