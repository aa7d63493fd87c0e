//! Content-Length framing of DAP messages.
//!
//! The connection is split in a reader, owned by the reader thread, and a cloneable writer
//! shared by everything that sends responses or events.

use crate::dap::protocol::{DapEvent, DapRequest, DapResponse};
use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Appends adapter diagnostics and message traces to a file.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<File>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            _ = writeln!(file, "{text}");
        }
    }
}

/// Split a client connection. `tracer` receives every message when `trace` is set.
pub fn split(
    stream: TcpStream,
    tracer: Option<FileTracer>,
    trace: bool,
) -> anyhow::Result<(DapReader, DapWriter)> {
    stream.set_nodelay(true)?;
    let tracer = tracer.filter(|_| trace);
    let reader = DapReader {
        reader: BufReader::new(stream.try_clone()?),
        tracer: tracer.clone(),
    };
    let writer = DapWriter {
        state: Arc::new(Mutex::new(WriterState { stream, seq: 1 })),
        tracer,
    };
    Ok((reader, writer))
}

pub struct DapReader {
    reader: BufReader<TcpStream>,
    tracer: Option<FileTracer>,
}

impl DapReader {
    pub fn read_message(&mut self) -> anyhow::Result<Value> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line)? == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(v.trim().parse().context("bad Content-Length")?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        let msg: Value = serde_json::from_slice(&buf)?;
        if let Some(tracer) = &self.tracer {
            tracer.line(&format!("<- {msg}"));
        }
        Ok(msg)
    }

    /// Next request, messages of other types are skipped.
    pub fn read_request(&mut self) -> anyhow::Result<DapRequest> {
        loop {
            let msg = self.read_message()?;
            match serde_json::from_value::<DapRequest>(msg) {
                Ok(req) if req.r#type == "request" => return Ok(req),
                Ok(other) => {
                    log::debug!(target: "dap", "skip message of type {}", other.r#type);
                }
                Err(e) => log::warn!(target: "dap", "malformed message: {e}"),
            }
        }
    }
}

struct WriterState {
    stream: TcpStream,
    seq: i64,
}

/// Sends responses and events, numbering them in the order they hit the wire.
#[derive(Clone)]
pub struct DapWriter {
    state: Arc<Mutex<WriterState>>,
    tracer: Option<FileTracer>,
}

impl DapWriter {
    fn state(&self) -> MutexGuard<'_, WriterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_message<T: Serialize>(&self, build: impl FnOnce(i64) -> T) -> anyhow::Result<()> {
        let mut state = self.state();
        let seq = state.seq;
        state.seq += 1;

        let message = build(seq);
        let payload = serde_json::to_vec(&message)?;
        if let Some(tracer) = &self.tracer {
            tracer.line(&format!("-> {}", String::from_utf8_lossy(&payload)));
        }
        write!(state.stream, "Content-Length: {}\r\n\r\n", payload.len())?;
        state.stream.write_all(&payload)?;
        state.stream.flush()?;
        Ok(())
    }

    pub fn respond(
        &self,
        req: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> anyhow::Result<()> {
        self.write_message(|seq| DapResponse {
            seq,
            r#type: "response",
            request_seq: req.seq,
            success,
            command: req.command.clone(),
            message,
            body,
        })
    }

    pub fn event(&self, name: &'static str, body: Option<Value>) -> anyhow::Result<()> {
        self.write_message(|seq| DapEvent {
            seq,
            r#type: "event",
            event: name,
            body,
        })
    }

    /// Close the connection, a reader blocked on it wakes up with an error.
    pub fn shutdown(&self) {
        _ = self.state().stream.shutdown(Shutdown::Both);
    }
}
