//! Remote debugging of a suspended GemStone process.
//!
//! ```text
//! Unattached -> Stopped <-> Running -> Detached
//! ```
//!
//! Every operation maps to one or more blocking remote calls on the process. Variable
//! references live until the process runs again, source references until detach.

pub mod breakpoint;
pub mod error;
pub mod frame;
pub mod keyword;
pub mod location;
pub mod source;
pub mod step;
pub mod variable;

pub use error::Error;

use crate::debugger::breakpoint::{
    BreakpointLocation, BreakpointMapper, BreakpointView, TrackedBreakpoint,
};
use crate::debugger::frame::{name_locals, FrameContents, StackFrameView};
use crate::debugger::location::MethodLocation;
use crate::debugger::source::SourceRegistry;
use crate::debugger::step::StepKind;
use crate::debugger::variable::{ScopeView, VarRef, VarRegistry, VariableView, Window};
use crate::exec::PollConfig;
use crate::gci::error::{ERR_BREAKPOINT, ERR_STEP};
use crate::gci::{GciError, GemSession, Oop, SessionRegistry};
use crate::query::QueryFacade;
use crate::{muted_error, weak_error};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::Display;

/// Name of frames whose method has no owning class, like the top frame of an execute.
pub const EXECUTED_CODE: &str = "Executed Code";
/// Source text of a frame whose contents can not be fetched.
pub const UNAVAILABLE_SOURCE: &str = "\"source not available\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StopReason {
    Entry,
    Exception,
    Step,
    Breakpoint,
    Restart,
}

pub trait EventHook {
    fn on_stopped(&self, reason: StopReason, description: &str) -> anyhow::Result<()>;
    fn on_terminated(&self);
}

pub struct NopHook;

impl EventHook for NopHook {
    fn on_stopped(&self, _: StopReason, _: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_terminated(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    Stopped,
    /// Inside a blocking step or continue.
    Running,
    Detached,
}

pub struct DebugSessionBuilder<H: EventHook> {
    hooks: H,
    poll: PollConfig,
}

impl DebugSessionBuilder<NopHook> {
    pub fn new() -> Self {
        Self {
            hooks: NopHook,
            poll: PollConfig::default(),
        }
    }
}

impl Default for DebugSessionBuilder<NopHook> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: EventHook> DebugSessionBuilder<H> {
    pub fn with_hooks<H1: EventHook>(self, hooks: H1) -> DebugSessionBuilder<H1> {
        DebugSessionBuilder {
            hooks,
            poll: self.poll,
        }
    }

    pub fn with_poll_config(self, poll: PollConfig) -> Self {
        Self { poll, ..self }
    }

    pub fn build(self, registry: Arc<SessionRegistry>) -> DebugSession<H> {
        DebugSession {
            registry,
            hooks: self.hooks,
            poll: self.poll,
            query: None,
            state: SessionState::Unattached,
            process: None,
            message: String::new(),
            vars: VarRegistry::default(),
            sources: SourceRegistry::default(),
            breakpoints: BreakpointMapper::default(),
            frames: HashMap::new(),
            class_names: HashMap::new(),
            method_labels: HashMap::new(),
        }
    }
}

pub struct DebugSession<H: EventHook> {
    registry: Arc<SessionRegistry>,
    hooks: H,
    poll: PollConfig,
    query: Option<QueryFacade>,
    state: SessionState,
    process: Option<Oop>,
    message: String,

    vars: VarRegistry,
    sources: SourceRegistry,
    breakpoints: BreakpointMapper,
    frames: HashMap<u32, FrameContents>,
    class_names: HashMap<Oop, String>,
    method_labels: HashMap<Oop, String>,
}

impl<H: EventHook> DebugSession<H> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Suspended process, `None` when nothing is attached.
    pub fn process(&self) -> Option<Oop> {
        self.process
    }

    /// Message of the error the process stopped on.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn session(&self) -> Option<&Arc<GemSession>> {
        self.query.as_ref().map(QueryFacade::session)
    }

    pub fn query(&self) -> Result<QueryFacade, Error> {
        self.query.clone().ok_or(Error::NotAttached)
    }

    fn suspended(&self) -> Result<Oop, Error> {
        match self.state {
            SessionState::Running => Err(Error::ProcessRunning),
            _ => self.process.ok_or(Error::NotAttached),
        }
    }

    /// Use `session` for breakpoints and evaluation without a suspended process.
    pub fn bind(&mut self, session: Arc<GemSession>) {
        let same = self.session().map(|s| s.id()) == Some(session.id());
        if !same {
            self.sources.clear();
            self.breakpoints.clear();
            self.class_names.clear();
            self.method_labels.clear();
        }
        self.query = Some(QueryFacade::new(session).with_poll_config(self.poll.clone()));
    }

    // --------------------------------- attach / detach -------------------------------------------

    /// Attach to `process` suspended in the session with `session_id`.
    pub fn attach(&mut self, session_id: u32, process: Oop, message: &str) -> Result<(), Error> {
        let session = self
            .registry
            .get(session_id)
            .ok_or(Error::InvalidSession(session_id))?;
        self.attach_session(session, process, message)
    }

    pub fn attach_session(
        &mut self,
        session: Arc<GemSession>,
        process: Oop,
        message: &str,
    ) -> Result<(), Error> {
        if matches!(self.state, SessionState::Stopped | SessionState::Running) {
            return Err(Error::AlreadyAttached);
        }
        if process.is_nil() || process.is_special() {
            return Err(Error::UnexpectedValue(process, "suspended process"));
        }

        log::info!(
            target: "debugger",
            "attach to process {process:?} of session {}",
            session.id()
        );
        self.bind(session);
        self.process = Some(process);
        self.message = message.to_string();
        self.vars.clear();
        self.frames.clear();
        self.sources.clear();
        self.state = SessionState::Stopped;
        self.hooks
            .on_stopped(StopReason::Exception, message)
            .map_err(Error::Hook)
    }

    /// Clear the stack of the attached process and release local state. Does nothing
    /// when nothing is attached.
    pub fn disconnect(&mut self) {
        if let (Some(query), Some(process)) = (&self.query, self.process) {
            log::info!(target: "debugger", "clear stack of process {process:?}");
            weak_error!(query.clear_stack(process), "disconnect:");
        }
        if self.state != SessionState::Unattached {
            self.state = SessionState::Detached;
        }
        self.process = None;
        self.query = None;
        self.vars.clear();
        self.frames.clear();
        self.sources.clear();
        self.breakpoints.clear();
        self.class_names.clear();
        self.method_labels.clear();
    }

    pub fn terminate(&mut self) {
        let attached = self.process.is_some();
        self.disconnect();
        if attached {
            self.hooks.on_terminated();
        }
    }

    // --------------------------------- stack -----------------------------------------------------

    pub fn stack_depth(&self) -> Result<u32, Error> {
        let process = self.suspended()?;
        let query = self.query()?;
        let depth = query.perform(process, "stackDepth", &[])?;
        Ok(QueryFacade::expect_int(depth)?.max(0) as u32)
    }

    /// Frame contents of a 1-based stack level.
    pub fn frame(&mut self, level: u32) -> Result<FrameContents, Error> {
        if let Some(frame) = self.frames.get(&level) {
            return Ok(frame.clone());
        }
        let process = self.suspended()?;
        let query = self.query()?;
        if level == 0 {
            return Err(Error::FrameNotFound(level));
        }

        let array = query.perform(process, "_frameContentsAt:", &[Oop::from_i32(level as i32)])?;
        if array.is_nil() {
            return Err(Error::FrameNotFound(level));
        }
        let frame = FrameContents::from_oops(&query.fetch_all_oops(array)?)?;
        self.frames.insert(level, frame.clone());
        Ok(frame)
    }

    /// Frames of levels `start..start + levels`, all remaining levels when `levels` is `None`.
    /// Returns the frames and the stack depth.
    ///
    /// A frame whose method can not be described is still reported.
    pub fn stack_trace(
        &mut self,
        start: u32,
        levels: Option<u32>,
    ) -> Result<(Vec<StackFrameView>, u32), Error> {
        let depth = self.stack_depth()?;
        let start = start.max(1);
        let end = match levels {
            Some(n) if n > 0 => (start + n - 1).min(depth),
            _ => depth,
        };

        let frames = (start..=end)
            .map(|level| {
                let frame = match self.frame(level) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!(target: "debugger", "frame {level}: {e:#}");
                        return StackFrameView {
                            level,
                            name: EXECUTED_CODE.to_string(),
                            source_ref: self.sources.reference(Oop::NIL),
                            line: 1,
                            column: 1,
                            method: Oop::NIL,
                        };
                    }
                };
                self.frame_view(level, &frame)
            })
            .collect();
        Ok((frames, depth))
    }

    fn frame_view(&mut self, level: u32, frame: &FrameContents) -> StackFrameView {
        let source_ref = self.sources.reference(frame.method);
        let name = muted_error!(self.method_label(frame.method), "method label:")
            .unwrap_or_else(|| EXECUTED_CODE.to_string());
        let line = muted_error!(self.frame_line(level, frame), "frame line:").unwrap_or(1);
        StackFrameView {
            level,
            name,
            source_ref,
            line,
            column: 1,
            method: frame.method,
        }
    }

    /// `Class>>selector` of a compiled method.
    pub fn method_label(&mut self, method: Oop) -> Result<String, Error> {
        if let Some(label) = self.method_labels.get(&method) {
            return Ok(label.clone());
        }
        let query = self.query()?;
        let class = query.perform(method, "inClass", &[])?;
        if class.is_nil() {
            return Err(Error::UnexpectedValue(class, "method class"));
        }
        let class_name = self.class_name(&query, class)?;
        let selector = query.perform(method, "selector", &[])?;
        let label = format!("{class_name}>>{}", query.fetch_string(selector)?);
        self.method_labels.insert(method, label.clone());
        Ok(label)
    }

    fn frame_line(&mut self, level: u32, frame: &FrameContents) -> Result<u32, Error> {
        let query = self.query()?;
        let args = [
            Oop::from_i64(frame.ip_offset).unwrap_or(Oop::NIL),
            Oop::from_i32(level as i32),
            Oop::FALSE,
        ];
        let step = query.perform(frame.method, "_stepPointForIp:level:useNext:", &args)?;
        let step = QueryFacade::expect_int(step)?;
        let source = self.sources.source(&query, frame.method)?;
        Ok(source.line_of_step_point(step))
    }

    fn class_name(&mut self, query: &QueryFacade, class: Oop) -> Result<String, Error> {
        if let Some(name) = self.class_names.get(&class) {
            return Ok(name.clone());
        }
        let name = query.class_name(class)?;
        self.class_names.insert(class, name.clone());
        Ok(name)
    }

    /// Source text by source reference.
    pub fn source(&mut self, source_ref: i64) -> Result<String, Error> {
        let method = self
            .sources
            .method(source_ref)
            .ok_or(Error::UnknownSourceReference(source_ref))?;
        if method.is_nil() {
            return Ok(UNAVAILABLE_SOURCE.to_string());
        }
        let query = self.query()?;
        Ok(self.sources.source(&query, method)?.text.clone())
    }

    pub fn source_reference(&mut self, method: Oop) -> i64 {
        self.sources.reference(method)
    }

    // --------------------------------- variables -------------------------------------------------

    /// Locals and receiver scopes of a stack level.
    pub fn scopes(&mut self, level: u32) -> Result<Vec<ScopeView>, Error> {
        let frame = self.frame(level)?;
        let locals = self.vars.alloc(VarRef::FrameLocals(level));
        let receiver = self.vars.alloc(VarRef::Receiver(frame.receiver));
        Ok(vec![
            ScopeView {
                name: "Locals",
                reference: locals,
                named_variables: Some(frame.arg_and_temps.len() as i64),
            },
            ScopeView {
                name: "Receiver",
                reference: receiver,
                named_variables: Some(1),
            },
        ])
    }

    pub fn variables(
        &mut self,
        reference: i64,
        window: Window,
    ) -> Result<Vec<VariableView>, Error> {
        let var_ref = self
            .vars
            .get(reference)
            .ok_or(Error::UnknownVariableReference(reference))?;
        let query = self.query()?;

        let entries = match var_ref {
            VarRef::FrameLocals(level) => {
                let frame = self.frame(level)?;
                let names = weak_error!(query.fetch_string_array(frame.names), "local names:")
                    .unwrap_or_default();
                name_locals(&names, &frame.arg_and_temps)
            }
            VarRef::Receiver(oop) => vec![("self".to_string(), oop)],
            VarRef::Named(oop) => {
                let class = query.class_of(oop)?;
                let names = query.perform(class, "allInstVarNames", &[])?;
                let names = query.fetch_string_array(names)?;
                let info = query.fetch_obj_info(oop)?;
                let values = query.fetch_oops(oop, 1, info.named_size.max(0) as usize)?;
                name_locals(&names, &values)
            }
            VarRef::Indexed { oop, size } => {
                let info = query.fetch_obj_info(oop)?;
                let (start, count) = window.clamp(size.max(0) as usize);
                let first = info.named_size as i64 + 1 + start as i64;
                query
                    .fetch_oops(oop, first, count)?
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| (format!("[{}]", start + i + 1), value))
                    .collect()
            }
        };

        Ok(entries
            .into_iter()
            .map(|(name, oop)| self.variable_view(&query, name, oop))
            .collect())
    }

    /// Never fails, errors of a single entry end up in its value.
    fn variable_view(&mut self, query: &QueryFacade, name: String, oop: Oop) -> VariableView {
        let value = query
            .print_string(oop)
            .unwrap_or_else(|e| format!("<error: {e}>"));
        let type_name = muted_error!(query
            .class_of(oop)
            .map_err(Error::from)
            .and_then(|class| self.class_name(query, class)));
        let info = if oop.is_nil() || oop.is_special() {
            None
        } else {
            muted_error!(query.fetch_obj_info(oop))
        };

        let child = VarRef::child_of(oop, info.as_ref());
        let (named_variables, indexed_variables) = match child {
            Some(VarRef::Indexed { size, .. }) => (None, Some(size)),
            Some(VarRef::Named(_)) => (info.map(|i| i.named_size as i64), None),
            _ => (None, None),
        };
        VariableView {
            name,
            value,
            type_name,
            reference: child.map(|c| self.vars.alloc(c)).unwrap_or(0),
            named_variables,
            indexed_variables,
        }
    }

    // --------------------------------- execution -------------------------------------------------

    /// Step from `level` and wait until the process stops again.
    pub fn step(&mut self, kind: StepKind, level: u32) -> Result<(), Error> {
        let process = self.suspended()?;
        let query = self.query()?;
        self.vars.clear();
        self.frames.clear();

        log::debug!(target: "debugger", "step {kind} from level {level}");
        query.perform(process, kind.selector(), &[Oop::from_i32(level as i32)])?;
        self.state = SessionState::Running;
        let result = query.continue_process(process);
        self.on_run_finished(result)
    }

    /// Resume the process until it completes or stops on another error.
    pub fn continue_execution(&mut self) -> Result<(), Error> {
        let process = self.suspended()?;
        let query = self.query()?;
        self.vars.clear();
        self.frames.clear();

        self.state = SessionState::Running;
        let result = query.continue_process(process);
        self.on_run_finished(result)
    }

    fn on_run_finished(&mut self, result: Result<Oop, GciError>) -> Result<(), Error> {
        match result {
            Ok(value) => {
                log::info!(target: "debugger", "process completed with {value:?}");
                self.process = None;
                self.state = SessionState::Detached;
                self.hooks.on_terminated();
                Ok(())
            }
            Err(GciError::Vm(record)) => {
                let reason = match record.number {
                    ERR_STEP => StopReason::Step,
                    ERR_BREAKPOINT => StopReason::Breakpoint,
                    _ => StopReason::Exception,
                };
                if let Some(process) = record.debuggable_context() {
                    self.process = Some(process);
                }
                if reason == StopReason::Exception {
                    self.message = record.to_string();
                }
                self.state = SessionState::Stopped;
                log::debug!(target: "debugger", "process stopped: {reason} ({record})");
                let description = match reason {
                    StopReason::Exception => self.message.clone(),
                    _ => reason.to_string(),
                };
                self.hooks
                    .on_stopped(reason, &description)
                    .map_err(Error::Hook)
            }
            Err(e) => {
                self.state = SessionState::Stopped;
                Err(e.into())
            }
        }
    }

    /// Evaluate `expression` with `self` bound to the receiver of `level`. Failures are
    /// rendered into the result.
    pub fn evaluate(&mut self, level: u32, expression: &str) -> String {
        match self.try_evaluate(level, expression) {
            Ok(printed) => printed,
            Err(e) => format!("error: {e}"),
        }
    }

    fn try_evaluate(&mut self, level: u32, expression: &str) -> Result<String, Error> {
        let query = self.query()?;
        let context = match self.process {
            Some(_) => self.frame(level)?.receiver,
            None => Oop::NIL,
        };
        match query.execute_in(expression, context) {
            Ok(result) => Ok(query.print_string(result)?),
            Err(e) => {
                query.discard(&e);
                Err(e.into())
            }
        }
    }

    /// Trim the stack so that `level` becomes the top frame.
    pub fn restart_frame(&mut self, level: u32) -> Result<(), Error> {
        let process = self.suspended()?;
        let query = self.query()?;
        query.perform(process, "_trimStackToLevel:", &[Oop::from_i32(level as i32)])?;

        self.vars.clear();
        self.frames.clear();
        self.hooks
            .on_stopped(StopReason::Restart, &format!("restarted at level {level}"))
            .map_err(Error::Hook)
    }

    // --------------------------------- breakpoints -----------------------------------------------

    /// Replace breakpoints of the method at a synthetic source path.
    pub fn set_breakpoints(
        &mut self,
        path: &str,
        lines: &[i64],
    ) -> Result<Vec<BreakpointView>, Error> {
        let query = self.query()?;
        let method = MethodLocation::from_str(path)?.resolve_method(&query)?;
        self.breakpoints
            .set_breakpoints_for_source(&query, path, method, lines)
    }

    pub fn breakpoint_locations(
        &mut self,
        path: &str,
        line: u32,
        end_line: u32,
    ) -> Result<Vec<BreakpointLocation>, Error> {
        let query = self.query()?;
        let method = MethodLocation::from_str(path)?.resolve_method(&query)?;
        let source = self.sources.source(&query, method)?;
        Ok(breakpoint::breakpoint_locations(source, line, end_line))
    }

    /// Breakpoints set on the method at `path`.
    pub fn tracked_breakpoints(&self, path: &str) -> Vec<TrackedBreakpoint> {
        self.breakpoints
            .tracked(path)
            .map(|(_, bps)| bps.to_vec())
            .unwrap_or_default()
    }

    /// Forget state tied to a method that was recompiled.
    pub fn invalidate_method(&mut self, method: Oop) {
        self.breakpoints.invalidate_method(method);
        self.method_labels.remove(&method);
    }
}
