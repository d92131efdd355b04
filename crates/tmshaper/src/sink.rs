//! Output sink for operator-visible lines.
//!
//! Every confirmation line and telemetry row goes to the console and, when
//! requested, to a log file framed by `# Log started at ..` /
//! `# Log ended at ..` markers. The sink is created once by the top-level
//! run function, passed by `&mut` into every emitting call, and closed
//! exactly once: explicitly via [`OutputSink::close`] or on drop.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use chrono::Local;
use tracing::{debug, warn};

use crate::error::TmResult;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Log file settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileOptions {
    /// Log file path.
    pub path: PathBuf,
    /// Append instead of truncating.
    pub append: bool,
}

enum Console {
    Stdout(io::Stdout),
    Capture(Vec<String>),
}

struct LogFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl LogFile {
    fn open(options: &LogFileOptions) -> TmResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(options.append)
            .truncate(!options.append)
            .open(&options.path)?;
        let mut log = Self {
            path: options.path.clone(),
            writer: BufWriter::new(file),
        };
        let started = Local::now().format(TIMESTAMP_FORMAT);
        writeln!(log.writer, "# Log started at {}", started)?;
        writeln!(log.writer, "# Log file: {}", log.path.display())?;
        log.writer.flush()?;
        Ok(log)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()
    }

    fn finish(&mut self) -> io::Result<()> {
        let ended = Local::now().format(TIMESTAMP_FORMAT);
        writeln!(self.writer, "# Log ended at {}", ended)?;
        self.writer.flush()
    }
}

/// Console plus optional log file writer.
pub struct OutputSink {
    console: Console,
    log: Option<LogFile>,
    closed: bool,
}

impl OutputSink {
    /// Creates a sink writing to stdout and, optionally, a log file.
    pub fn stdout(log: Option<&LogFileOptions>) -> TmResult<Self> {
        Self::with_console(Console::Stdout(io::stdout()), log)
    }

    /// Creates a sink that keeps console lines in memory.
    pub fn capture(log: Option<&LogFileOptions>) -> TmResult<Self> {
        Self::with_console(Console::Capture(Vec::new()), log)
    }

    fn with_console(console: Console, log: Option<&LogFileOptions>) -> TmResult<Self> {
        let log = log.map(LogFile::open).transpose()?;
        Ok(Self {
            console,
            log,
            closed: false,
        })
    }

    /// Returns true if a log file is attached.
    pub fn has_log_file(&self) -> bool {
        self.log.is_some()
    }

    /// Writes one line to the console and the log file.
    pub fn emit(&mut self, line: &str) -> TmResult<()> {
        match &mut self.console {
            Console::Stdout(out) => {
                let mut out = out.lock();
                writeln!(out, "{}", line)?;
                out.flush()?;
            }
            Console::Capture(lines) => lines.push(line.to_string()),
        }
        if !self.closed {
            if let Some(log) = self.log.as_mut() {
                log.write_line(line)?;
            }
        }
        Ok(())
    }

    /// Returns the captured console lines (empty for stdout sinks).
    pub fn captured(&self) -> &[String] {
        match &self.console {
            Console::Capture(lines) => lines.as_slice(),
            Console::Stdout(_) => &[],
        }
    }

    /// Returns true once the sink has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Writes the end marker and releases the log file. Later calls are no-ops.
    pub fn close(&mut self) -> TmResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut log) = self.log.take() {
            debug!(path = %log.path.display(), "Closing log file");
            log.finish()?;
        }
        Ok(())
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close output log: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn options(path: &Path, append: bool) -> LogFileOptions {
        LogFileOptions {
            path: path.to_path_buf(),
            append,
        }
    }

    #[test]
    fn test_capture_without_log() {
        let mut sink = OutputSink::capture(None).unwrap();
        sink.emit("a").unwrap();
        sink.emit("b").unwrap();
        assert_eq!(sink.captured(), &["a".to_string(), "b".to_string()]);
        assert!(!sink.has_log_file());
    }

    #[test]
    fn test_log_file_framing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tm.log");
        {
            let mut sink = OutputSink::capture(Some(&options(&path, false))).unwrap();
            sink.emit("row 1").unwrap();
            sink.close().unwrap();
            sink.close().unwrap();
            assert!(sink.is_closed());
        }
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# Log started at "));
        assert_eq!(lines[1], format!("# Log file: {}", path.display()));
        assert_eq!(lines[2], "row 1");
        assert!(lines[3].starts_with("# Log ended at "));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_drop_closes_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tm.log");
        {
            let mut sink = OutputSink::capture(Some(&options(&path, false))).unwrap();
            sink.emit("row").unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("# Log ended at").count(), 1);
    }

    #[test]
    fn test_append_keeps_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tm.log");
        for run in ["first", "second"] {
            let mut sink = OutputSink::capture(Some(&options(&path, true))).unwrap();
            sink.emit(run).unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("first"));
        assert!(text.contains("second"));
        assert_eq!(text.matches("# Log started at").count(), 2);

        let mut sink = OutputSink::capture(Some(&options(&path, false))).unwrap();
        sink.emit("third").unwrap();
        sink.close().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("first"));
        assert!(text.contains("third"));
    }
}
