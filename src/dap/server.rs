use crate::config::{Config, LoginConfig};
use crate::dap::hook::{DapHook, EventQueue};
use crate::dap::io::{split, DapReader, DapWriter, FileTracer};
use crate::dap::logger::DapLogger;
use crate::dap::protocol::{DapRequest, InternalEvent};
use crate::dap::PROCESS_THREAD_ID;
use crate::debugger::breakpoint::BreakpointView;
use crate::debugger::step::StepKind;
use crate::debugger::variable::Window;
use crate::debugger::{DebugSession, DebugSessionBuilder};
use crate::exec::{CancelToken, Outcome, ProgressSink};
use crate::gci::{GemSession, Oop, SessionRegistry};
use crate::log::LOGGER_SWITCHER;
use crate::weak_error;
use anyhow::{anyhow, Context};
use indexmap::IndexMap;
use log::LevelFilter;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::cell::Cell;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Serves DAP clients. Sessions logged in by a client are logged out when it leaves,
/// other sessions of the registry stay available for `attach`.
pub struct DapServer {
    registry: Arc<SessionRegistry>,
    config: Config,
    tracer: Option<FileTracer>,
    trace: bool,
}

impl DapServer {
    pub fn new(registry: Arc<SessionRegistry>, config: Config) -> Self {
        Self {
            registry,
            config,
            tracer: None,
            trace: false,
        }
    }

    /// Write diagnostics to `tracer`, and every message too when `trace` is set.
    pub fn with_tracer(self, tracer: Option<FileTracer>, trace: bool) -> Self {
        Self {
            tracer,
            trace,
            ..self
        }
    }

    pub fn tracer(&self) -> Option<&FileTracer> {
        self.tracer.as_ref()
    }

    /// Serve one client until it disconnects.
    pub fn serve(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (reader, writer) = split(stream, self.tracer.clone(), self.trace)?;
        let cancel = CancelToken::new();
        let busy = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let reader_thread = {
            let writer = writer.clone();
            let cancel = cancel.clone();
            let busy = busy.clone();
            thread::Builder::new()
                .name("dap-reader".to_string())
                .spawn(move || read_requests(reader, writer, cancel, busy, tx))
                .context("spawn reader thread")?
        };

        let mut client = ClientSession::new(self, writer.clone(), cancel, busy);
        let result = client.run(rx);
        client.close();

        writer.shutdown();
        if reader_thread.join().is_err() {
            log::warn!(target: "dap", "reader thread panicked");
        }
        result
    }
}

/// Reader thread loop. Cancellation requests are answered here so that they reach a
/// running evaluation, everything else goes to the request loop.
fn read_requests(
    mut reader: DapReader,
    writer: DapWriter,
    cancel: CancelToken,
    busy: Arc<AtomicBool>,
    tx: Sender<DapRequest>,
) {
    loop {
        let req = match reader.read_request() {
            Ok(req) => req,
            Err(e) => {
                log::debug!(target: "dap", "stop reading: {e:#}");
                break;
            }
        };

        match req.command.as_str() {
            "cancel" | "pause" => {
                let running = busy.load(Ordering::SeqCst);
                let result = if running {
                    let n = cancel.cancel();
                    log::info!(target: "dap", "{}: cancellation request #{n}", req.command);
                    writer.respond(&req, true, None, None)
                } else if req.command == "pause" {
                    writer.respond(&req, false, Some("nothing is running".to_string()), None)
                } else {
                    writer.respond(&req, true, None, None)
                };
                if let Err(e) = result {
                    log::warn!(target: "dap", "respond to {}: {e:#}", req.command);
                    break;
                }
            }
            _ => {
                if tx.send(req).is_err() {
                    break;
                }
            }
        }
    }
}

// --------------------------------- request arguments --------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchArguments {
    expression: String,
    #[serde(default)]
    login: LoginConfig,
    #[serde(default = "default_true")]
    stop_on_error: bool,
    #[serde(default)]
    log_to_client: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachArguments {
    session_id: u32,
    process: u64,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StackTraceArguments {
    #[serde(default)]
    start_frame: u32,
    levels: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameArguments {
    frame_id: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArguments {
    variables_reference: i64,
    #[serde(default)]
    start: usize,
    count: Option<usize>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Source {
    path: Option<String>,
    source_reference: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceArguments {
    source_reference: Option<i64>,
    #[serde(default)]
    source: Source,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArguments {
    expression: String,
    frame_id: Option<u32>,
}

#[derive(Deserialize)]
struct SourceBreakpoint {
    line: i64,
}

#[derive(Deserialize)]
struct SetBreakpointsArguments {
    source: Source,
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakpointLocationsArguments {
    source: Source,
    line: u32,
    end_line: Option<u32>,
}

fn parse_args<T: DeserializeOwned>(req: &DapRequest) -> anyhow::Result<T> {
    let arguments = match &req.arguments {
        Value::Null => json!({}),
        other => other.clone(),
    };
    serde_json::from_value(arguments).with_context(|| format!("{}: invalid arguments", req.command))
}

// --------------------------------- progress ------------------------------------------------------

/// Progress of a running launch expression, reported with DAP progress events.
struct DapProgress {
    writer: DapWriter,
    id: String,
    reported_secs: Cell<u64>,
}

impl DapProgress {
    fn new(writer: DapWriter) -> Self {
        Self {
            writer,
            id: uuid::Uuid::new_v4().to_string(),
            reported_secs: Cell::new(0),
        }
    }
}

impl ProgressSink for DapProgress {
    fn start(&self, title: &str) {
        let body = json!({
            "progressId": self.id,
            "title": title,
            "cancellable": true,
        });
        weak_error!(self.writer.event("progressStart", Some(body)), "progress:");
    }

    fn update(&self, elapsed: Duration) {
        let secs = elapsed.as_secs();
        if secs == self.reported_secs.replace(secs) {
            return;
        }
        let body = json!({
            "progressId": self.id,
            "message": format!("running for {secs}s"),
        });
        weak_error!(self.writer.event("progressUpdate", Some(body)), "progress:");
    }

    fn end(&self) {
        let body = json!({"progressId": self.id});
        weak_error!(self.writer.event("progressEnd", Some(body)), "progress:");
    }
}

// --------------------------------- client session ------------------------------------------------

struct PendingBreakpoint {
    id: i64,
    line: i64,
}

struct ClientSession<'a> {
    server: &'a DapServer,
    writer: DapWriter,
    events: EventQueue,
    debug: DebugSession<DapHook>,
    cancel: CancelToken,
    busy: Arc<AtomicBool>,
    /// Breakpoints set before login, by source path.
    pending_breakpoints: IndexMap<String, Vec<PendingBreakpoint>>,
    next_breakpoint_id: i64,
    /// Session logged in by `launch`.
    launched: Option<u32>,
    log_to_client: bool,
    terminated: bool,
}

impl<'a> ClientSession<'a> {
    fn new(
        server: &'a DapServer,
        writer: DapWriter,
        cancel: CancelToken,
        busy: Arc<AtomicBool>,
    ) -> Self {
        let events = EventQueue::default();
        let debug = DebugSessionBuilder::new()
            .with_hooks(DapHook::new(events.clone()))
            .with_poll_config(server.config.poll.clone())
            .build(server.registry.clone());
        Self {
            server,
            writer,
            events,
            debug,
            cancel,
            busy,
            pending_breakpoints: IndexMap::new(),
            next_breakpoint_id: 1,
            launched: None,
            log_to_client: false,
            terminated: false,
        }
    }

    fn run(&mut self, requests: Receiver<DapRequest>) -> anyhow::Result<()> {
        for req in requests {
            let cont = match self.dispatch(&req) {
                Ok(cont) => cont,
                Err(e) => {
                    log::debug!(target: "dap", "{} failed: {e:#}", req.command);
                    self.send_err(&req, format!("{e:#}"))?;
                    true
                }
            };
            self.drain_events()?;
            if !cont {
                break;
            }
        }
        Ok(())
    }

    /// Release the debug session, the launched session and the client logger.
    fn close(&mut self) {
        self.debug.disconnect();
        if let Some(id) = self.launched.take() {
            weak_error!(self.server.registry.logout(id), "logout:");
        }
        if self.log_to_client {
            self.log_to_client = false;
            let logger = env_logger::Logger::from_default_env();
            let filter = logger.filter();
            LOGGER_SWITCHER.switch(logger, filter);
        }
    }

    fn dispatch(&mut self, req: &DapRequest) -> anyhow::Result<bool> {
        match req.command.as_str() {
            "initialize" => self.handle_initialize(req)?,
            "launch" => self.handle_launch(req)?,
            "attach" => self.handle_attach(req)?,
            "configurationDone" => self.send_success(req)?,
            "threads" => self.handle_threads(req)?,
            "stackTrace" => self.handle_stack_trace(req)?,
            "scopes" => self.handle_scopes(req)?,
            "variables" => self.handle_variables(req)?,
            "source" => self.handle_source(req)?,
            "next" | "stepIn" | "stepOut" => self.handle_step(req)?,
            "continue" => self.handle_continue(req)?,
            "evaluate" => self.handle_evaluate(req)?,
            "restartFrame" => self.handle_restart_frame(req)?,
            "setBreakpoints" => self.handle_set_breakpoints(req)?,
            "breakpointLocations" => self.handle_breakpoint_locations(req)?,
            "terminate" => self.handle_terminate(req)?,
            "disconnect" => {
                self.close();
                self.send_success(req)?;
                return Ok(false);
            }
            other => {
                self.send_err(req, format!("Unsupported DAP command: {other}"))?;
            }
        }
        Ok(true)
    }

    // --------------------------------- output ----------------------------------------------------

    fn send_success(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.writer.respond(req, true, None, None)
    }

    fn send_success_body(&self, req: &DapRequest, body: Value) -> anyhow::Result<()> {
        self.writer.respond(req, true, None, Some(body))
    }

    fn send_err(&self, req: &DapRequest, message: impl ToString) -> anyhow::Result<()> {
        self.writer.respond(req, false, Some(message.to_string()), None)
    }

    fn output(&self, category: &'static str, output: String) {
        self.events.push(InternalEvent::Output { category, output });
    }

    fn drain_events(&mut self) -> anyhow::Result<()> {
        for event in self.events.take() {
            match event {
                InternalEvent::Stopped {
                    reason,
                    thread_id,
                    description,
                } => {
                    let body = json!({
                        "reason": reason,
                        "threadId": thread_id,
                        "allThreadsStopped": true,
                        "description": description,
                    });
                    self.writer.event("stopped", Some(body))?;
                }
                InternalEvent::Terminated => {
                    if !self.terminated {
                        self.terminated = true;
                        self.writer.event("terminated", None)?;
                    }
                }
                InternalEvent::Output { category, output } => {
                    let body = json!({"category": category, "output": output});
                    self.writer.event("output", Some(body))?;
                }
                InternalEvent::Breakpoint { reason, breakpoint } => {
                    let body = json!({"reason": reason, "breakpoint": breakpoint});
                    self.writer.event("breakpoint", Some(body))?;
                }
            }
        }
        Ok(())
    }

    // --------------------------------- lifecycle -------------------------------------------------

    fn handle_initialize(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsTerminateRequest": true,
            "supportsRestartFrame": true,
            "supportsBreakpointLocationsRequest": true,
            "supportsCancelRequest": true,
            "supportsEvaluateForHovers": true,
            "supportsSetVariable": false,
            "supportsStepBack": false,
        });
        self.send_success_body(req, body)?;
        self.writer.event("initialized", None)
    }

    fn handle_launch(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: LaunchArguments = parse_args(req)?;
        if self.launched.is_some() {
            return Err(anyhow!("launch: already launched"));
        }
        if args.log_to_client && !self.log_to_client {
            self.log_to_client = true;
            LOGGER_SWITCHER.switch(
                DapLogger::new(self.events.clone(), LevelFilter::Info),
                LevelFilter::Info,
            );
        }

        let login = self.server.config.login.clone().merge(args.login);
        let session = self
            .server
            .registry
            .login(&login.to_params())
            .context("login")?;
        self.launched = Some(session.id());
        self.debug.bind(session.clone());
        self.apply_pending_breakpoints();

        self.send_success(req)?;
        // breakpoint changes go out before the expression starts running
        self.drain_events()?;
        self.run_expression(session, &args.expression, args.stop_on_error)
    }

    fn run_expression(
        &mut self,
        session: Arc<GemSession>,
        expression: &str,
        stop_on_error: bool,
    ) -> anyhow::Result<()> {
        let query = self.debug.query()?;
        let progress = DapProgress::new(self.writer.clone());
        self.cancel.reset();
        self.busy.store(true, Ordering::SeqCst);
        let outcome = query.execute_source_nb(expression, self.cancel.clone(), &progress);
        self.busy.store(false, Ordering::SeqCst);

        match outcome? {
            Outcome::Ready(result) => {
                let printed = query
                    .print_string(result)
                    .unwrap_or_else(|e| format!("<error: {e}>"));
                self.output("stdout", format!("{printed}\n"));
                self.events.push(InternalEvent::Terminated);
            }
            Outcome::Failed(e) => match e.debuggable_context() {
                Some(process) if stop_on_error => {
                    self.debug.attach_session(session, process, &e.to_string())?;
                }
                _ => {
                    query.discard(&e);
                    self.output("stderr", format!("{e}\n"));
                    self.events.push(InternalEvent::Terminated);
                }
            },
            Outcome::Cancelled { drained } => {
                let output = if drained {
                    "execution cancelled\n"
                } else {
                    "execution cancelled, the session is busy until the call finishes\n"
                };
                self.output("console", output.to_string());
                self.events.push(InternalEvent::Terminated);
            }
        }
        Ok(())
    }

    fn handle_attach(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: AttachArguments = parse_args(req)?;
        self.debug
            .attach(args.session_id, Oop::from_raw(args.process), &args.message)?;
        self.apply_pending_breakpoints();
        self.send_success(req)
    }

    fn handle_terminate(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let attached = self.debug.process().is_some();
        self.debug.terminate();
        if !attached {
            self.events.push(InternalEvent::Terminated);
        }
        self.send_success(req)
    }

    // --------------------------------- inspection ------------------------------------------------

    fn handle_threads(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let threads: Vec<Value> = match self.debug.process() {
            Some(process) => vec![json!({
                "id": PROCESS_THREAD_ID,
                "name": format!("GemStone process {process}"),
            })],
            None => vec![],
        };
        self.send_success_body(req, json!({"threads": threads}))
    }

    fn handle_stack_trace(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: StackTraceArguments = parse_args(req)?;
        let (frames, depth) = self.debug.stack_trace(args.start_frame + 1, args.levels)?;

        let frames: Vec<Value> = frames
            .into_iter()
            .map(|frame| {
                let mut value = json!({
                    "id": frame.level,
                    "name": &frame.name,
                    "line": frame.line,
                    "column": frame.column,
                });
                if frame.source_ref > 0 {
                    value["source"] = json!({
                        "name": frame.name,
                        "sourceReference": frame.source_ref,
                    });
                }
                value
            })
            .collect();
        self.send_success_body(req, json!({"stackFrames": frames, "totalFrames": depth}))
    }

    fn handle_scopes(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: FrameArguments = parse_args(req)?;
        let scopes: Vec<Value> = self
            .debug
            .scopes(args.frame_id)?
            .into_iter()
            .map(|scope| {
                json!({
                    "name": scope.name,
                    "variablesReference": scope.reference,
                    "namedVariables": scope.named_variables,
                    "expensive": false,
                })
            })
            .collect();
        self.send_success_body(req, json!({"scopes": scopes}))
    }

    fn handle_variables(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: VariablesArguments = parse_args(req)?;
        let window = Window {
            start: args.start,
            count: args.count.filter(|&c| c > 0),
        };
        let variables: Vec<Value> = self
            .debug
            .variables(args.variables_reference, window)?
            .into_iter()
            .map(|var| {
                let mut value = json!({
                    "name": var.name,
                    "value": var.value,
                    "variablesReference": var.reference,
                });
                if let Some(type_name) = var.type_name {
                    value["type"] = json!(type_name);
                }
                if let Some(named) = var.named_variables {
                    value["namedVariables"] = json!(named);
                }
                if let Some(indexed) = var.indexed_variables {
                    value["indexedVariables"] = json!(indexed);
                }
                value
            })
            .collect();
        self.send_success_body(req, json!({"variables": variables}))
    }

    fn handle_source(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: SourceArguments = parse_args(req)?;
        let reference = args
            .source_reference
            .or(args.source.source_reference)
            .ok_or_else(|| anyhow!("source: sourceReference is required"))?;
        let content = self.debug.source(reference)?;
        self.send_success_body(req, json!({"content": content}))
    }

    // --------------------------------- execution -------------------------------------------------

    fn handle_step(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let kind = StepKind::from_dap_command(&req.command)
            .ok_or_else(|| anyhow!("unknown step command {}", req.command))?;
        self.debug.step(kind, 1)?;
        self.send_success(req)
    }

    fn handle_continue(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        self.debug.continue_execution()?;
        self.send_success_body(req, json!({"allThreadsContinued": true}))
    }

    fn handle_evaluate(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: EvaluateArguments = parse_args(req)?;
        let level = args.frame_id.unwrap_or(1);
        let result = self.debug.evaluate(level, &args.expression);
        self.send_success_body(req, json!({"result": result, "variablesReference": 0}))
    }

    fn handle_restart_frame(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: FrameArguments = parse_args(req)?;
        self.debug.restart_frame(args.frame_id)?;
        self.send_success(req)
    }

    // --------------------------------- breakpoints -----------------------------------------------

    fn breakpoint_id(&mut self) -> i64 {
        let id = self.next_breakpoint_id;
        self.next_breakpoint_id += 1;
        id
    }

    fn handle_set_breakpoints(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: SetBreakpointsArguments = parse_args(req)?;
        let path = args
            .source
            .path
            .ok_or_else(|| anyhow!("setBreakpoints: source path is required"))?;
        let lines: Vec<i64> = args.breakpoints.iter().map(|bp| bp.line).collect();

        let breakpoints: Vec<Value> = if self.debug.session().is_none() {
            let pending: Vec<PendingBreakpoint> = lines
                .iter()
                .map(|&line| PendingBreakpoint {
                    id: self.breakpoint_id(),
                    line,
                })
                .collect();
            let views = pending
                .iter()
                .map(|bp| unverified_json(bp.id, bp.line, "pending until login"))
                .collect();
            self.pending_breakpoints.insert(path, pending);
            views
        } else {
            match self.debug.set_breakpoints(&path, &lines) {
                Ok(views) => views
                    .iter()
                    .map(|view| {
                        let id = self.breakpoint_id();
                        breakpoint_json(id, view)
                    })
                    .collect(),
                Err(e) => {
                    log::warn!(target: "dap", "breakpoints of {path}: {e:#}");
                    let message = e.to_string();
                    lines
                        .iter()
                        .map(|&line| {
                            let id = self.breakpoint_id();
                            unverified_json(id, line, &message)
                        })
                        .collect()
                }
            }
        };
        self.send_success_body(req, json!({"breakpoints": breakpoints}))
    }

    /// Set breakpoints received before login, reporting each one as changed.
    fn apply_pending_breakpoints(&mut self) {
        for (path, pending) in std::mem::take(&mut self.pending_breakpoints) {
            let lines: Vec<i64> = pending.iter().map(|bp| bp.line).collect();
            let Some(views) = weak_error!(
                self.debug.set_breakpoints(&path, &lines),
                "pending breakpoints:"
            ) else {
                continue;
            };
            for (bp, view) in pending.iter().zip(views.iter()) {
                self.events.push(InternalEvent::Breakpoint {
                    reason: "changed",
                    breakpoint: breakpoint_json(bp.id, view),
                });
            }
        }
    }

    fn handle_breakpoint_locations(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let args: BreakpointLocationsArguments = parse_args(req)?;
        let path = args
            .source
            .path
            .ok_or_else(|| anyhow!("breakpointLocations: source path is required"))?;
        let end_line = args.end_line.unwrap_or(args.line);
        let locations: Vec<Value> = self
            .debug
            .breakpoint_locations(&path, args.line, end_line)?
            .into_iter()
            .map(|loc| json!({"line": loc.line, "column": loc.column}))
            .collect();
        self.send_success_body(req, json!({"breakpoints": locations}))
    }
}

fn breakpoint_json(id: i64, view: &BreakpointView) -> Value {
    let mut value = json!({
        "id": id,
        "verified": view.verified,
        "line": view.line,
    });
    if let Some(message) = &view.message {
        value["message"] = json!(message);
    }
    value
}

fn unverified_json(id: i64, line: i64, message: &str) -> Value {
    json!({
        "id": id,
        "verified": false,
        "line": line,
        "message": message,
    })
}
