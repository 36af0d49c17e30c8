//! Reading an app's stdout/stderr logs, either once or following growth.

use crate::app::App;
use std::io::{BufRead, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Lines buffered between the follower task and its consumer.
const FOLLOW_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

/// Incremental reader over a file that only grows, or is truncated.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    max_line_bytes: usize,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>, max_line_bytes: usize) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    /// Return the complete lines appended since the last poll.
    ///
    /// A missing file yields nothing. A file shorter than what was already
    /// read was truncated and is read again from the start. An unterminated
    /// line longer than the line limit is emitted as is.
    pub fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "log truncated, rereading");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        let read = file.take(len - self.offset).read_to_end(&mut chunk)?;
        self.offset += read as u64;

        let mut lines = Vec::new();
        for byte in chunk {
            if byte == b'\n' {
                lines.push(take_line(&mut self.partial));
            } else {
                self.partial.push(byte);
                if self.partial.len() >= self.max_line_bytes {
                    lines.push(take_line(&mut self.partial));
                }
            }
        }
        Ok(lines)
    }

    /// Take the unterminated last line, once nothing more will be written.
    pub fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(take_line(&mut self.partial))
        }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

/// Copy every line of `path` to `out`, lines cut at `max_line_bytes`.
fn copy_lines(path: &Path, out: &mut dyn Write, max_line_bytes: usize) -> Result<(), LogsError> {
    let file = std::fs::File::open(path).map_err(|e| LogsError::Open {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = std::io::BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(|e| LogsError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            return Ok(());
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        buf.truncate(max_line_bytes);
        let line = take_line(&mut buf);
        writeln!(out, "{line}").map_err(|e| LogsError::Write { source: e })?;
    }
}

/// Print the whole stdout log to `out`, then the whole stderr log to `err`.
pub fn dump(
    app: &App,
    out: &mut dyn Write,
    err: &mut dyn Write,
    max_line_bytes: usize,
) -> Result<(), LogsError> {
    copy_lines(&app.stdout_path, out, max_line_bytes)?;
    copy_lines(&app.stderr_path, err, max_line_bytes)
}

/// A running log follower.
#[derive(Debug)]
pub struct Follow {
    pub lines: mpsc::Receiver<LogLine>,
    done: Option<oneshot::Sender<()>>,
}

impl Follow {
    /// Tell the follower the app has finished: it reads what is left,
    /// including an unterminated last line, then closes `lines`.
    pub fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

/// Follow both logs of `app` from the beginning in a background task.
///
/// The task ends when `lines` is dropped or after [`Follow::finish`].
pub fn follow(app: &App, interval: Duration, max_line_bytes: usize) -> Follow {
    let (tx, rx) = mpsc::channel(FOLLOW_CHANNEL_CAPACITY);
    let (done_tx, mut done_rx) = oneshot::channel();
    let mut tails = [
        (LogStream::Stdout, LogTail::new(&app.stdout_path, max_line_bytes)),
        (LogStream::Stderr, LogTail::new(&app.stderr_path, max_line_bytes)),
    ];

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let last = tokio::select! {
                _ = tx.closed() => return,
                _ = &mut done_rx => true,
                _ = ticker.tick() => false,
            };
            for (stream, tail) in tails.iter_mut() {
                let mut lines = match tail.poll() {
                    Ok(lines) => lines,
                    Err(e) => {
                        tracing::debug!(
                            path = %tail.path.display(),
                            error = %e,
                            "log poll failed"
                        );
                        Vec::new()
                    }
                };
                if last {
                    lines.extend(tail.flush());
                }
                for text in lines {
                    let line = LogLine {
                        stream: *stream,
                        text,
                    };
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            if last {
                return;
            }
        }
    });
    Follow {
        lines: rx,
        done: Some(done_tx),
    }
}

#[derive(Debug)]
pub enum LogsError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        source: std::io::Error,
    },
}

impl std::fmt::Display for LogsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogsError::Open { path, source } => {
                write!(f, "failed to open file {}: {source}", path.display())
            }
            LogsError::Read { path, source } => {
                write!(f, "error reading file {}: {source}", path.display())
            }
            LogsError::Write { source } => write!(f, "failed to write logs: {source}"),
        }
    }
}

impl std::error::Error for LogsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogsError::Open { source, .. } => Some(source),
            LogsError::Read { source, .. } => Some(source),
            LogsError::Write { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{sample_app, AppStatus};

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn app_in(dir: &Path) -> App {
        let mut app = sample_app("web", AppStatus::Running);
        app.stdout_path = dir.join("stdout.log");
        app.stderr_path = dir.join("stderr.log");
        app
    }

    #[test]
    fn test_tail_complete_lines_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.log");
        let mut tail = LogTail::new(&path, 1024);

        assert!(tail.poll().unwrap().is_empty());

        append(&path, "one\ntw");
        assert_eq!(tail.poll().unwrap(), vec!["one"]);
        assert!(tail.poll().unwrap().is_empty());

        append(&path, "o\r\nthree\n");
        assert_eq!(tail.poll().unwrap(), vec!["two", "three"]);
    }

    #[test]
    fn test_tail_rereads_truncated_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.log");
        let mut tail = LogTail::new(&path, 1024);

        append(&path, "first run line\n");
        assert_eq!(tail.poll().unwrap(), vec!["first run line"]);

        std::fs::write(&path, "new\n").unwrap();
        assert_eq!(tail.poll().unwrap(), vec!["new"]);
    }

    #[test]
    fn test_tail_splits_overlong_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.log");
        let mut tail = LogTail::new(&path, 4);

        append(&path, "abcdefg\n");
        assert_eq!(tail.poll().unwrap(), vec!["abcd", "efg"]);
    }

    #[test]
    fn test_dump_prints_both_streams() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_in(tmp.path());
        std::fs::write(&app.stdout_path, "hello\nworld\n").unwrap();
        std::fs::write(&app.stderr_path, "oops").unwrap();

        let mut out = Vec::new();
        let mut err = Vec::new();
        dump(&app, &mut out, &mut err, 1024).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "hello\nworld\n");
        assert_eq!(String::from_utf8(err).unwrap(), "oops\n");
    }

    #[test]
    fn test_dump_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_in(tmp.path());
        let err = dump(&app, &mut Vec::new(), &mut Vec::new(), 1024).unwrap_err();
        assert!(matches!(err, LogsError::Open { .. }));
        assert!(err.to_string().contains("stdout.log"));
    }

    #[tokio::test]
    async fn test_follow_streams_new_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_in(tmp.path());
        append(&app.stdout_path, "early\n");

        let mut follower = follow(&app, Duration::from_millis(10), 1024);
        let rx = &mut follower.lines;
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            first,
            LogLine {
                stream: LogStream::Stdout,
                text: "early".to_string()
            }
        );

        append(&app.stderr_path, "late error\n");
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.stream, LogStream::Stderr);
        assert_eq!(second.text, "late error");
    }

    #[test]
    fn test_tail_flush_returns_unterminated_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.log");
        let mut tail = LogTail::new(&path, 1024);

        append(&path, "line\ndone");
        assert_eq!(tail.poll().unwrap(), vec!["line"]);
        assert_eq!(tail.flush().as_deref(), Some("done"));
        assert_eq!(tail.flush(), None);
    }

    #[tokio::test]
    async fn test_follow_finish_emits_last_partial_line() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_in(tmp.path());
        append(&app.stdout_path, "first\nno newline");

        let mut follower = follow(&app, Duration::from_millis(10), 1024);
        let first = tokio::time::timeout(Duration::from_secs(5), follower.lines.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.text, "first");

        follower.finish();
        let mut rest = Vec::new();
        while let Some(line) = tokio::time::timeout(Duration::from_secs(5), follower.lines.recv())
            .await
            .unwrap()
        {
            rest.push(line.text);
        }
        assert_eq!(rest, vec!["no newline"]);
    }
}
