//! Backend output capture
//!
//! Each output stream of the backend gets a reader task that turns lines into
//! tracing events under the `spawnrelay::app` target. Lines indented by two
//! spaces or a tab are folded into the previous line so stack traces stay in
//! one event.
//! A pending line is flushed after a short idle period, at EOF, or when the
//! relay asks for it after serving a request.
//!
//! Lines that are JSON objects with a `level` field are re-emitted at their
//! own level; everything else uses the level configured for the stream.

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, Level};

use crate::config::{parse_level, LogLevels};

/// How long a line may sit in the buffer after the last line was read
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

macro_rules! app_event {
    ($level:expr, $($arg:tt)+) => {
        let level = $level;
        if level == Level::ERROR {
            tracing::error!(target: "spawnrelay::app", $($arg)+);
        } else if level == Level::WARN {
            tracing::warn!(target: "spawnrelay::app", $($arg)+);
        } else if level == Level::INFO {
            tracing::info!(target: "spawnrelay::app", $($arg)+);
        } else if level == Level::DEBUG {
            tracing::debug!(target: "spawnrelay::app", $($arg)+);
        } else {
            tracing::trace!(target: "spawnrelay::app", $($arg)+);
        }
    };
}

/// Groups indented continuation lines with the line before them.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Option<String>,
}

impl LineBuffer {
    /// Add a line, returning the previous group if this line starts a new one.
    pub fn push(&mut self, line: String) -> Option<String> {
        if is_continuation(&line) {
            if let Some(pending) = self.pending.as_mut() {
                pending.push('\n');
                pending.push_str(&line);
                return None;
            }
        }
        self.pending.replace(line)
    }

    /// Take whatever is buffered.
    pub fn take(&mut self) -> Option<String> {
        self.pending.take()
    }
}

fn is_continuation(line: &str) -> bool {
    line.starts_with("  ") || line.starts_with('\t')
}

/// A structured log line written by the backend
#[derive(Debug, PartialEq)]
pub struct JsonEntry {
    pub level: Level,
    pub message: String,
    pub fields: Map<String, Value>,
}

/// Parse a JSON log line carrying its own `level`.
///
/// The message is read from `message` or `msg`; remaining keys are kept as
/// fields. Returns `None` for anything else, including unknown levels.
pub fn parse_json_log(line: &str) -> Option<JsonEntry> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') || !trimmed.contains("\"level\"") {
        return None;
    }

    let mut fields: Map<String, Value> = serde_json::from_str(trimmed).ok()?;
    let level = match fields.get("level")? {
        Value::String(s) => parse_level(s).ok()?,
        _ => return None,
    };
    fields.remove("level");

    let message = match fields.remove("message").or_else(|| fields.remove("msg")) {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };

    Some(JsonEntry {
        level,
        message,
        fields,
    })
}

/// Per-stream buffer and emission settings
#[derive(Debug)]
struct StreamSink {
    buffer: Mutex<LineBuffer>,
    level: Level,
    stream: &'static str,
    pid: u32,
}

impl StreamSink {
    fn new(stream: &'static str, level: Level, pid: u32) -> Self {
        Self {
            buffer: Mutex::new(LineBuffer::default()),
            level,
            stream,
            pid,
        }
    }

    fn push(&self, line: String) {
        let ready = self.buffer.lock().push(line);
        if let Some(text) = ready {
            self.emit(&text);
        }
    }

    fn flush(&self) {
        let pending = self.buffer.lock().take();
        if let Some(text) = pending {
            self.emit(&text);
        }
    }

    fn emit(&self, text: &str) {
        let (pid, stream) = (self.pid, self.stream);

        if let Some(entry) = parse_json_log(text) {
            if entry.fields.is_empty() {
                app_event!(entry.level, pid, stream, "{}", entry.message);
            } else {
                let fields = Value::Object(entry.fields);
                app_event!(entry.level, pid, stream, %fields, "{}", entry.message);
            }
            return;
        }

        let text = text.trim_end();
        if !text.is_empty() {
            app_event!(self.level, pid, stream, "{}", text);
        }
    }
}

/// Output readers attached to one backend process
#[derive(Debug)]
pub struct OutputCapture {
    sinks: Vec<Arc<StreamSink>>,
    // Readers stop on their own at EOF
    _tasks: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    /// Take the child's piped stdout and stderr and start forwarding them.
    pub fn attach(child: &mut Child, levels: LogLevels) -> Self {
        let pid = child.id().unwrap_or(0);
        let mut capture = Self {
            sinks: Vec::with_capacity(2),
            _tasks: Vec::with_capacity(2),
        };

        if let Some(stdout) = child.stdout.take() {
            capture.add_stream(stdout, StreamSink::new("stdout", levels.stdout, pid));
        }
        if let Some(stderr) = child.stderr.take() {
            capture.add_stream(stderr, StreamSink::new("stderr", levels.stderr, pid));
        }

        capture
    }

    fn add_stream<R>(&mut self, reader: R, sink: StreamSink)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = Arc::new(sink);
        self._tasks
            .push(tokio::spawn(forward_lines(reader, Arc::clone(&sink))));
        self.sinks.push(sink);
    }

    /// Emit any buffered lines now.
    pub fn flush(&self) {
        for sink in &self.sinks {
            sink.flush();
        }
    }
}

async fn forward_lines<R>(reader: R, sink: Arc<StreamSink>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let idle = tokio::time::sleep(FLUSH_INTERVAL);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    sink.push(line);
                    idle.as_mut().reset(Instant::now() + FLUSH_INTERVAL);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(pid = sink.pid, stream = sink.stream, error = %e, "Stopped reading backend output");
                    break;
                }
            },
            _ = &mut idle => {
                sink.flush();
                idle.as_mut().reset(Instant::now() + FLUSH_INTERVAL);
            }
        }
    }

    sink.flush();
}
