use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

/// How long a single read may park before the loop re-checks the stop flag
/// and the partial-line clock.
const READ_SLICE: Duration = Duration::from_millis(100);

/// Byte-at-a-time scanner for the capture process's diagnostic stream.
///
/// A line completes on `\n`, `\r`, or NUL. Bytes are decoded lossily since
/// the capture binary interleaves progress output with arbitrary muxer
/// messages.
pub(crate) struct LineTokenizer {
    buf: Vec<u8>,
}

impl LineTokenizer {
    pub(crate) fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed one byte; returns the completed line when a terminator lands.
    /// Empty lines (terminator runs like `\r\n`) produce nothing.
    pub(crate) fn feed(&mut self, byte: u8) -> Option<String> {
        if matches!(byte, b'\n' | b'\r' | b'\0') {
            self.take()
        } else {
            self.buf.push(byte);
            None
        }
    }

    /// Flush whatever has accumulated as its own line.
    pub(crate) fn take(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

fn is_terminator(byte: u8) -> bool {
    matches!(byte, b'\n' | b'\r' | b'\0')
}

/// Pump the capture process's diagnostic stream into the line channel until
/// EOF, a read error, or a stop request.
///
/// A partial line that has not terminated within `flush_after` of its first
/// byte is flushed as-is; progress lines are often emitted without a
/// terminator until the next update overwrites them.
pub(crate) async fn drain_output<R>(
    mut reader: R,
    lines: mpsc::UnboundedSender<String>,
    stopped: Arc<AtomicBool>,
    flush_after: Duration,
) where
    R: AsyncRead + Unpin,
{
    let mut tokenizer = LineTokenizer::new();
    let mut byte = [0u8; 1];
    let mut line_started = Instant::now();

    loop {
        if stopped.load(Ordering::Relaxed) {
            debug!("Drain loop observed stop request");
            break;
        }

        match timeout(READ_SLICE, reader.read(&mut byte)).await {
            Ok(Ok(0)) => {
                if let Some(line) = tokenizer.take() {
                    let _ = lines.send(line);
                }
                debug!("Capture diagnostic stream closed");
                break;
            }
            Ok(Ok(_)) => {
                if let Some(line) = tokenizer.feed(byte[0]) {
                    trace!("Drained line: {}", line);
                    let _ = lines.send(line);
                }
                if is_terminator(byte[0]) {
                    line_started = Instant::now();
                } else if line_started.elapsed() >= flush_after {
                    // Trickling line with no terminator in sight
                    if let Some(line) = tokenizer.take() {
                        trace!("Flushed unterminated line: {}", line);
                        let _ = lines.send(line);
                    }
                    line_started = Instant::now();
                }
            }
            Ok(Err(e)) => {
                warn!("Capture diagnostic read failed: {}", e);
                break;
            }
            Err(_) => {
                // Sliced read elapsed without a byte; flush a stuck line
                if line_started.elapsed() >= flush_after {
                    if let Some(line) = tokenizer.take() {
                        trace!("Flushed unterminated line: {}", line);
                        let _ = lines.send(line);
                    }
                    line_started = Instant::now();
                }
            }
        }
    }
}
