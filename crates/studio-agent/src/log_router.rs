use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use studio_process::{LogEntry, LogLevel, ServiceId};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};

use crate::events::{ControlEvent, EventSink};
use crate::services::StderrPolicy;

const LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const LOG_FILE_MAX_FILES: usize = 3;
const MAX_LINE_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Reads one line into `buf`, keeping at most `max` bytes of it; the rest of
/// an overlong line is consumed and dropped. Returns bytes read, 0 at EOF.
async fn read_line_capped<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(read);
        }
        let (used, done) = match chunk.iter().position(|b| *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (chunk.len(), false),
        };
        let room = max.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..used.min(room)]);
        reader.consume(used);
        read += used;
        if done {
            return Ok(read);
        }
    }
}

/// Severity for one line, or `None` if the line is dropped.
pub fn classify(stream: Stream, line: &str, policy: &StderrPolicy) -> Option<LogLevel> {
    if line.trim().is_empty() {
        return None;
    }
    match stream {
        Stream::Stdout => Some(LogLevel::Info),
        Stream::Stderr => {
            if policy.suppress.iter().any(|s| line.contains(s.as_str())) {
                None
            } else if policy.benign.iter().any(|s| line.contains(s.as_str())) {
                Some(LogLevel::Info)
            } else {
                Some(LogLevel::Error)
            }
        }
    }
}

/// Bounded window of recent entries with a monotonic cursor.
#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, LogEntry)>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, entry));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Entries after `cursor`, plus the cursor to pass next time.
    /// A zero cursor returns the most recent `limit` entries.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<LogEntry>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, entry) in self.lines.iter().skip(start) {
                out.push(entry.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, entry) in self.lines.iter() {
            if *seq > cursor {
                out.push(entry.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

struct FileLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    bytes: u64,
    file: tokio::fs::File,
}

impl FileLogWriter {
    async fn open(path: PathBuf, max_bytes: u64, max_files: usize) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            max_bytes,
            max_files,
            bytes,
            file,
        })
    }

    async fn rotate(&mut self) -> std::io::Result<()> {
        let _ = self.file.flush().await;

        // .(n-1) -> .n
        for i in (1..self.max_files).rev() {
            let from = PathBuf::from(format!("{}.{}", self.path.display(), i));
            let to = PathBuf::from(format!("{}.{}", self.path.display(), i + 1));
            if tokio::fs::metadata(&from).await.is_ok() {
                let _ = tokio::fs::rename(from, to).await;
            }
        }

        let rotated = PathBuf::from(format!("{}.1", self.path.display()));
        if tokio::fs::metadata(&self.path).await.is_ok() {
            let _ = tokio::fs::rename(&self.path, &rotated).await;
        }

        self.file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        self.bytes = 0;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }

        let write_len = line.len() as u64;
        if self.max_bytes > 0 && self.bytes.saturating_add(write_len) > self.max_bytes {
            self.rotate().await.ok();
        }

        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        self.bytes = self.bytes.saturating_add(write_len);
        Ok(())
    }
}

fn file_line(entry: &LogEntry) -> String {
    let level = match entry.level {
        LogLevel::Info => "info",
        LogLevel::Error => "error",
    };
    format!(
        "{} [{}] {}",
        entry.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        level,
        entry.message
    )
}

/// Per-service log channel. Survives restarts of the service.
#[derive(Clone)]
pub struct ServiceLog {
    id: ServiceId,
    buffer: Arc<Mutex<LogBuffer>>,
    file_tx: Option<mpsc::UnboundedSender<String>>,
    sink: Arc<dyn EventSink>,
}

impl ServiceLog {
    pub fn emit(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry::new(self.id, level, message);
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(file_line(&entry));
        }
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry.clone());
        self.sink.emit(ControlEvent::ProcessLog(entry));
    }

    /// Line written by the supervisor itself rather than the child.
    pub fn note(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, format!("[studio] {}", message.as_ref()));
    }

    pub fn note_error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, format!("[studio] {}", message.as_ref()));
    }

    pub fn tail(&self, cursor: u64, limit: usize) -> (Vec<LogEntry>, u64) {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tail_after(cursor, limit)
    }
}

#[derive(Clone)]
pub struct LogRouter {
    sink: Arc<dyn EventSink>,
    max_lines: usize,
    log_dir: Option<PathBuf>,
}

impl LogRouter {
    /// `log_dir` enables `<log_dir>/<service>/console.log` with rotation.
    pub fn new(sink: Arc<dyn EventSink>, max_lines: usize, log_dir: Option<PathBuf>) -> Self {
        Self {
            sink,
            max_lines,
            log_dir,
        }
    }

    /// Must be called from within a Tokio runtime when file logging is on.
    pub fn open(&self, id: ServiceId) -> ServiceLog {
        let file_tx = self.log_dir.as_ref().map(|dir| {
            let path = dir.join(id.as_str()).join("console.log");
            let (tx, mut rx) = mpsc::unbounded_channel::<String>();
            tokio::spawn(async move {
                let mut writer =
                    match FileLogWriter::open(path.clone(), LOG_FILE_MAX_BYTES, LOG_FILE_MAX_FILES)
                        .await
                    {
                        Ok(w) => w,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "console log disabled");
                            return;
                        }
                    };
                while let Some(line) = rx.recv().await {
                    let _ = writer.write_line(&line).await;
                }
            });
            tx
        });

        ServiceLog {
            id,
            buffer: Arc::new(Mutex::new(LogBuffer::new(self.max_lines))),
            file_tx,
            sink: self.sink.clone(),
        }
    }

    /// Forwards each line of `reader` in order until EOF.
    pub fn pump<R>(
        &self,
        log: &ServiceLog,
        stream: Stream,
        reader: R,
        policy: &StderrPolicy,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = log.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(service = %log.id, error = %e, "log stream closed");
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                if let Some(level) = classify(stream, line, &policy) {
                    log.emit(level, line);
                }
            }
        })
    }

    /// Starts one pump per captured stream.
    pub fn attach<O, E>(
        &self,
        log: &ServiceLog,
        stdout: Option<O>,
        stderr: Option<E>,
        policy: &StderrPolicy,
    ) -> Vec<JoinHandle<()>>
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let mut handles = Vec::new();
        if let Some(out) = stdout {
            handles.push(self.pump(log, Stream::Stdout, out, policy));
        }
        if let Some(err) = stderr {
            handles.push(self.pump(log, Stream::Stderr, err, policy));
        }
        handles
    }
}
