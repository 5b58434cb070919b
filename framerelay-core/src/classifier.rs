//! Transcoder diagnostic stream classification
//!
//! Each transcoder's stderr is read line by line on its own task. Lines are
//! re-emitted as tracing events at a severity matching their content, and a
//! run of consecutive error lines longer than the configured threshold raises
//! a fatal signal for the supervisor.

use std::io;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::transcoder::TranscoderRole;

/// Case-insensitive substrings marking a line as an error
const ERROR_VOCABULARY: &[&str] = &["error", "could not", "failed", "invalid data"];

/// Case-insensitive substrings marking a line as a warning
const WARNING_VOCABULARY: &[&str] = &["warning", "non-monotonic", "deprecated"];

/// Longest diagnostic line kept; the remainder of a longer line is dropped
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Severity assigned to one diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Error,
    Warning,
    /// Periodic encoder/decoder status (`frame= ... fps= ...`)
    Progress,
    Info,
}

impl LineClass {
    /// Classifies a single line without any run state.
    pub fn of(line: &str) -> Self {
        let lower = line.to_ascii_lowercase();

        if ERROR_VOCABULARY.iter().any(|word| lower.contains(word)) {
            LineClass::Error
        } else if WARNING_VOCABULARY.iter().any(|word| lower.contains(word)) {
            LineClass::Warning
        } else if is_progress_line(&lower) {
            LineClass::Progress
        } else {
            LineClass::Info
        }
    }
}

fn is_progress_line(line: &str) -> bool {
    (line.contains("time=") && line.contains("bitrate="))
        || (line.contains("frame=") && line.contains("fps="))
}

/// Result of feeding one line to a classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub class: LineClass,
    /// Length of the current error run, zero after a non-error line
    pub consecutive_errors: u32,
    /// True exactly once, on the line that pushes the run past the threshold
    pub fatal: bool,
}

/// Error-run counter for one transcoder instance.
#[derive(Debug, Clone)]
pub struct LogClassifier {
    threshold: u32,
    consecutive_errors: u32,
    fatal_signalled: bool,
    report: ClassifierReport,
}

/// Totals collected by a classifier over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifierReport {
    pub role: Option<TranscoderRole>,
    pub lines: u64,
    pub error_lines: u64,
    pub warning_lines: u64,
    pub progress_lines: u64,
    pub longest_error_run: u32,
    pub fatal_signalled: bool,
    /// Lines cut at `MAX_LINE_BYTES`
    pub truncated_lines: u64,
    /// Reader stopped because of cancellation rather than end of stream
    pub cancelled: bool,
}

impl LogClassifier {
    /// Creates a classifier that turns fatal once more than `threshold`
    /// consecutive error lines have been seen.
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            consecutive_errors: 0,
            fatal_signalled: false,
            report: ClassifierReport::default(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Classifies `line` and advances the error run.
    pub fn observe(&mut self, line: &str) -> Observation {
        let class = LineClass::of(line);
        self.report.lines += 1;

        match class {
            LineClass::Error => {
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                self.report.error_lines += 1;
                self.report.longest_error_run =
                    self.report.longest_error_run.max(self.consecutive_errors);
            }
            LineClass::Warning => {
                self.consecutive_errors = 0;
                self.report.warning_lines += 1;
            }
            LineClass::Progress => {
                self.consecutive_errors = 0;
                self.report.progress_lines += 1;
            }
            LineClass::Info => self.consecutive_errors = 0,
        }

        let fatal = !self.fatal_signalled && self.consecutive_errors > self.threshold;
        if fatal {
            self.fatal_signalled = true;
            self.report.fatal_signalled = true;
        }

        Observation {
            class,
            consecutive_errors: self.consecutive_errors,
            fatal,
        }
    }

    pub fn report(&self) -> ClassifierReport {
        self.report.clone()
    }
}

/// Sent to the supervisor when a transcoder's error run crosses the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatalDiagnostics {
    pub role: TranscoderRole,
    pub consecutive_errors: u32,
}

/// Settings for one diagnostics reader task
#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub error_line_threshold: u32,
    /// Minimum spacing between emitted progress records
    pub progress_log_interval: Duration,
}

/// Outcome of reading one diagnostic line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineRead {
    Line { truncated: bool },
    Eof,
}

/// Reads up to the next CR or LF into `buffer`, keeping at most `limit`
/// bytes. Progress records are CR-terminated when stderr is a pipe, so CR
/// ends a line too; a CRLF pair yields an extra empty line.
async fn read_line_bounded<R>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut truncated = false;
    let mut read_any = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if read_any {
                LineRead::Line { truncated }
            } else {
                LineRead::Eof
            });
        }
        read_any = true;

        let terminator = available.iter().position(|b| *b == b'\n' || *b == b'\r');
        let (chunk, used) = match terminator {
            Some(end) => (&available[..end], end + 1),
            None => (available, available.len()),
        };
        let room = limit.saturating_sub(buffer.len());
        if chunk.len() > room {
            truncated = true;
        }
        buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
        reader.consume(used);

        if terminator.is_some() {
            return Ok(LineRead::Line { truncated });
        }
    }
}

/// Reads `reader` line by line on a new task until end of stream or until
/// `cancel` turns true.
///
/// The fatal signal uses `try_send`, so the reader never waits on the
/// supervisor. The task inherits the caller's span.
pub fn spawn_diagnostics_monitor<R>(
    role: TranscoderRole,
    reader: R,
    settings: MonitorSettings,
    fatal_tx: mpsc::Sender<FatalDiagnostics>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<ClassifierReport>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let task = async move {
        let mut classifier = LogClassifier::new(settings.error_line_threshold);
        let mut reader = BufReader::new(reader);
        let mut buffer = Vec::with_capacity(256);
        let mut last_progress: Option<Instant> = None;
        let mut cancelled = false;
        let mut truncated_lines = 0;

        loop {
            buffer.clear();
            let read = tokio::select! {
                read = read_line_bounded(&mut reader, &mut buffer, MAX_LINE_BYTES) => read,
                _ = cancel.wait_for(|flag| *flag) => {
                    cancelled = true;
                    break;
                }
            };

            match read {
                Ok(LineRead::Eof) => break,
                Ok(LineRead::Line { truncated: false }) => {}
                Ok(LineRead::Line { truncated: true }) => {
                    truncated_lines += 1;
                    warn!(%role, limit = MAX_LINE_BYTES, "Diagnostic line truncated");
                }
                Err(e) => {
                    warn!(%role, "Diagnostic stream read failed: {}", e);
                    break;
                }
            }

            let text = String::from_utf8_lossy(&buffer);
            let line: &str = &text;
            if line.trim().is_empty() {
                continue;
            }

            let observation = classifier.observe(line);
            emit(role, line, &observation, &mut last_progress, settings);

            if observation.fatal {
                error!(
                    %role,
                    consecutive_errors = observation.consecutive_errors,
                    threshold = classifier.threshold(),
                    "Error run exceeded threshold, requesting restart"
                );
                // A full channel already holds a pending restart request
                let _ = fatal_tx.try_send(FatalDiagnostics {
                    role,
                    consecutive_errors: observation.consecutive_errors,
                });
            }
        }

        let mut report = classifier.report();
        report.role = Some(role);
        report.cancelled = cancelled;
        report.truncated_lines = truncated_lines;
        debug!(
            %role,
            lines = report.lines,
            error_lines = report.error_lines,
            cancelled,
            "Diagnostics reader finished"
        );
        report
    };

    tokio::spawn(task.instrument(tracing::Span::current()))
}

fn emit(
    role: TranscoderRole,
    line: &str,
    observation: &Observation,
    last_progress: &mut Option<Instant>,
    settings: MonitorSettings,
) {
    match observation.class {
        LineClass::Error => error!(
            %role,
            consecutive_errors = observation.consecutive_errors,
            "{}",
            line
        ),
        LineClass::Warning => warn!(%role, "{}", line),
        LineClass::Progress => {
            let due = last_progress
                .is_none_or(|last| last.elapsed() >= settings.progress_log_interval);
            if due {
                *last_progress = Some(Instant::now());
                info!(
                    %role,
                    frame = progress_value(line, "frame="),
                    fps = progress_value(line, "fps="),
                    speed = progress_value(line, "speed="),
                    "{}",
                    line
                );
            } else {
                debug!(%role, "{}", line);
            }
        }
        LineClass::Info => debug!(%role, "{}", line),
    }
}

/// Extracts the value following `key` in a progress line; values may be
/// padded with spaces after the `=`.
fn progress_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(' ').unwrap_or(rest.len());
    Some(&rest[..end]).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ERROR_LINE: &str = "[rtp @ 0x55d1] Error parsing packet";
    const PLAIN_LINE: &str = "Stream #0:0: Video: vp9, yuv420p, 1280x720";

    fn settings(threshold: u32) -> MonitorSettings {
        MonitorSettings {
            error_line_threshold: threshold,
            progress_log_interval: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_line_classes() {
        assert_eq!(LineClass::of("Could not find codec parameters"), LineClass::Error);
        assert_eq!(LineClass::of("ERROR: bad header"), LineClass::Error);
        assert_eq!(
            LineClass::of("pipe:0: Invalid data found when processing input"),
            LineClass::Error
        );
        assert_eq!(
            LineClass::of("Warning: non-monotonic DTS in output stream"),
            LineClass::Warning
        );
        assert_eq!(
            LineClass::of("frame=  120 fps= 30 q=-0.0 size=N/A time=00:00:04.00 bitrate=N/A speed=1x"),
            LineClass::Progress
        );
        assert_eq!(LineClass::of(PLAIN_LINE), LineClass::Info);
    }

    #[test]
    fn test_fatal_after_eleventh_consecutive_error() {
        let mut classifier = LogClassifier::new(10);

        for i in 1..=10 {
            let observation = classifier.observe(ERROR_LINE);
            assert!(!observation.fatal, "signalled early on line {i}");
            assert_eq!(observation.consecutive_errors, i);
        }

        let observation = classifier.observe(ERROR_LINE);
        assert!(observation.fatal);
        assert_eq!(observation.consecutive_errors, 11);

        // Signalled once per classifier
        assert!(!classifier.observe(ERROR_LINE).fatal);
        assert!(classifier.report().fatal_signalled);
    }

    #[test]
    fn test_non_error_line_resets_run() {
        let mut classifier = LogClassifier::new(10);
        let lines = std::iter::repeat_n(ERROR_LINE, 9)
            .chain(std::iter::once(PLAIN_LINE))
            .chain(std::iter::repeat_n(ERROR_LINE, 9));

        for line in lines {
            assert!(!classifier.observe(line).fatal);
        }

        let report = classifier.report();
        assert_eq!(report.error_lines, 18);
        assert_eq!(report.longest_error_run, 9);
        assert!(!report.fatal_signalled);
    }

    #[test]
    fn test_progress_value_extraction() {
        let line = "frame=  120 fps= 30 q=-0.0 size=N/A time=00:00:04.00 bitrate=N/A speed=1.01x";
        assert_eq!(progress_value(line, "frame="), Some("120"));
        assert_eq!(progress_value(line, "fps="), Some("30"));
        assert_eq!(progress_value(line, "speed="), Some("1.01x"));
        assert_eq!(progress_value(line, "dup="), None);
    }

    #[tokio::test]
    async fn test_monitor_signals_fatal_once() {
        let mut stream = String::new();
        for _ in 0..12 {
            stream.push_str(ERROR_LINE);
            stream.push_str("\r\n");
        }
        let reader = std::io::Cursor::new(stream.into_bytes());
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let report = spawn_diagnostics_monitor(
            TranscoderRole::Input,
            reader,
            settings(10),
            fatal_tx,
            cancel_rx,
        )
        .await
        .unwrap();

        let signal = fatal_rx.recv().await.unwrap();
        assert_eq!(signal.role, TranscoderRole::Input);
        assert_eq!(signal.consecutive_errors, 11);
        assert!(fatal_rx.recv().await.is_none());
        assert_eq!(report.lines, 12);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_carriage_return_ends_progress_records() {
        let mut stream = String::new();
        for i in 0..2_000 {
            stream.push_str(&format!(
                "frame={i:5} fps=30 q=-0.0 size=N/A time=00:00:01.00 bitrate=N/A speed=1x    \r"
            ));
        }
        stream.push_str(ERROR_LINE);
        stream.push('\n');
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let report = spawn_diagnostics_monitor(
            TranscoderRole::Input,
            std::io::Cursor::new(stream.into_bytes()),
            settings(10),
            fatal_tx,
            cancel_rx,
        )
        .await
        .unwrap();

        assert_eq!(report.progress_lines, 2_000);
        assert_eq!(report.error_lines, 1);
        assert_eq!(report.lines, 2_001);
        assert_eq!(report.truncated_lines, 0);
    }

    #[tokio::test]
    async fn test_overlong_line_is_truncated() {
        let mut stream = vec![b'x'; 100];
        stream.extend_from_slice(b"\nnext\n");
        let mut reader = BufReader::with_capacity(16, std::io::Cursor::new(stream));
        let mut buffer = Vec::new();

        let read = read_line_bounded(&mut reader, &mut buffer, 32).await.unwrap();
        assert_eq!(read, LineRead::Line { truncated: true });
        assert_eq!(buffer.len(), 32);

        buffer.clear();
        let read = read_line_bounded(&mut reader, &mut buffer, 32).await.unwrap();
        assert_eq!(read, LineRead::Line { truncated: false });
        assert_eq!(buffer, b"next");

        buffer.clear();
        let read = read_line_bounded(&mut reader, &mut buffer, 32).await.unwrap();
        assert_eq!(read, LineRead::Eof);
    }

    #[tokio::test]
    async fn test_monitor_bounds_unterminated_stream() {
        let stream = vec![b'y'; MAX_LINE_BYTES * 3];
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let report = spawn_diagnostics_monitor(
            TranscoderRole::Output,
            std::io::Cursor::new(stream),
            settings(10),
            fatal_tx,
            cancel_rx,
        )
        .await
        .unwrap();

        assert_eq!(report.lines, 1);
        assert_eq!(report.truncated_lines, 1);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        // Writer half kept alive so the stream never reaches EOF
        let (_writer, reader) = tokio::io::duplex(64);
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let task = spawn_diagnostics_monitor(
            TranscoderRole::Output,
            reader,
            settings(10),
            fatal_tx,
            cancel_rx,
        );
        cancel_tx.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.role, Some(TranscoderRole::Output));
    }
}
