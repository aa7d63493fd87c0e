//! Remote evaluation helpers built on the binding: evaluate source, resolve classes,
//! send messages, compile methods and bulk-fetch objects.

use crate::exec::{CancelToken, ExecutionPoller, NbRequest, Outcome, PollConfig, ProgressSink};
use crate::gci::traversal::{ObjectReport, TraversalBuffer, TraversalError, TraversalStatus};
use crate::gci::{
    flags, ClampedTravArgs, CompileRequest, ExecRequest, GciError, GemSession, Oop, OopKind,
    PerformRequest,
};
use crate::weak_error;
use std::sync::Arc;

/// Maximum size of a fetched printable result.
pub const MAX_RESULT_SIZE: usize = 64 * 1024;
/// Maximum size of a fetched symbol or class name.
const MAX_NAME_SIZE: usize = 1024;

/// Blocking calls check that no non-blocking call is outstanding and fail with
/// [`GciError::SessionBusy`] without touching the VM otherwise.
#[derive(Clone)]
pub struct QueryFacade {
    session: Arc<GemSession>,
    poll: PollConfig,
}

impl QueryFacade {
    pub fn new(session: Arc<GemSession>) -> Self {
        Self {
            session,
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(self, poll: PollConfig) -> Self {
        Self { poll, ..self }
    }

    pub fn session(&self) -> &Arc<GemSession> {
        &self.session
    }

    fn ready(&self) -> Result<&GemSession, GciError> {
        self.session.ensure_idle()?;
        Ok(&self.session)
    }

    // --------------------------------- evaluation ------------------------------------------------

    pub fn execute(&self, source: &str) -> Result<Oop, GciError> {
        let s = self.ready()?;
        let req = ExecRequest::new(source, s.helper_class()?);
        s.gci().execute(s.handle(), &req)
    }

    /// Execute with debugging enabled: an unhandled error leaves its process suspended.
    pub fn execute_debuggable(&self, source: &str) -> Result<Oop, GciError> {
        let s = self.ready()?;
        let req = ExecRequest::new(source, s.helper_class()?).with_flags(flags::ENABLE_DEBUG);
        s.gci().execute(s.handle(), &req)
    }

    /// Execute with `self` bound to `context`.
    pub fn execute_in(&self, source: &str, context: Oop) -> Result<Oop, GciError> {
        let s = self.ready()?;
        let req = ExecRequest::new(source, s.helper_class()?).with_context(context);
        s.gci().execute(s.handle(), &req)
    }

    /// Execute and fetch the result as a string, silently truncated at [`MAX_RESULT_SIZE`].
    pub fn execute_string(&self, source: &str) -> Result<String, GciError> {
        let s = self.ready()?;
        let req = ExecRequest::new(source, s.helper_class()?);
        let bytes = s.gci().execute_fetch_bytes(s.handle(), &req, MAX_RESULT_SIZE)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn perform(&self, receiver: Oop, selector: &str, args: &[Oop]) -> Result<Oop, GciError> {
        let s = self.ready()?;
        s.gci()
            .perform(s.handle(), &PerformRequest::new(receiver, selector, args))
    }

    /// Perform and fetch the bytes of the result as a string.
    pub fn perform_string(
        &self,
        receiver: Oop,
        selector: &str,
        args: &[Oop],
    ) -> Result<String, GciError> {
        let s = self.ready()?;
        let bytes = s.gci().perform_fetch_bytes(
            s.handle(),
            &PerformRequest::new(receiver, selector, args),
            MAX_RESULT_SIZE,
        )?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Printable representation, computed locally for immediate objects.
    pub fn print_string(&self, oop: Oop) -> Result<String, GciError> {
        if let Some(printed) = oop.kind().print_string() {
            return Ok(printed);
        }
        self.perform_string(oop, "printString", &[])
    }

    /// Run a non-blocking execute or perform through the poller.
    pub fn execute_nb(
        &self,
        req: &NbRequest,
        cancel: CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<Outcome, GciError> {
        let call = self.session.begin_nb()?;
        let outcome = ExecutionPoller::new(&self.session, self.poll.clone())
            .with_cancel(cancel)
            .with_progress(progress)
            .run(req);
        match outcome {
            Outcome::Cancelled { drained: false } => drop(call),
            _ => call.finish(),
        }
        Ok(outcome)
    }

    /// Non-blocking execute of source code with debugging enabled.
    pub fn execute_source_nb(
        &self,
        source: &str,
        cancel: CancelToken,
        progress: &dyn ProgressSink,
    ) -> Result<Outcome, GciError> {
        let req = ExecRequest::new(source, self.ready()?.helper_class()?)
            .with_flags(flags::ENABLE_DEBUG);
        self.execute_nb(&NbRequest::Execute(req), cancel, progress)
    }

    // --------------------------------- objects ---------------------------------------------------

    pub fn resolve_class(&self, name: &str) -> Result<Oop, GciError> {
        let s = self.ready()?;
        s.gci().resolve_symbol(s.handle(), name, Oop::NIL)
    }

    pub fn class_of(&self, oop: Oop) -> Result<Oop, GciError> {
        if oop.is_special() {
            return Ok(oop.special_class());
        }
        let s = self.ready()?;
        s.gci().fetch_class(s.handle(), oop)
    }

    pub fn class_name(&self, class: Oop) -> Result<String, GciError> {
        self.perform_string(class, "name", &[])
    }

    pub fn new_symbol(&self, name: &str) -> Result<Oop, GciError> {
        let s = self.ready()?;
        s.gci().new_symbol(s.handle(), name)
    }

    /// Wrap source text into an instance of the session helper class.
    pub fn new_source_string(&self, source: &str) -> Result<Oop, GciError> {
        let s = self.ready()?;
        let class = s.helper_class()?;
        let string = s.gci().new_obj(s.handle(), class)?;
        if !source.is_empty() {
            s.gci()
                .store_bytes(s.handle(), string, 1, source.as_bytes(), class)?;
        }
        Ok(string)
    }

    /// Content of a String or Symbol.
    pub fn fetch_string(&self, oop: Oop) -> Result<String, GciError> {
        let s = self.ready()?;
        let mut fetched = s.gci().fetch_utf8_bytes(s.handle(), oop, 1, MAX_NAME_SIZE)?;
        if fetched.required > fetched.bytes.len() {
            fetched = s
                .gci()
                .fetch_utf8_bytes(s.handle(), oop, 1, fetched.required)?;
        }
        Ok(String::from_utf8_lossy(&fetched.bytes).into_owned())
    }

    /// All OOPs of a pointer object (named slots first).
    pub fn fetch_all_oops(&self, oop: Oop) -> Result<Vec<Oop>, GciError> {
        let s = self.ready()?;
        let size = s.gci().fetch_size(s.handle(), oop)?;
        if size <= 0 {
            return Ok(vec![]);
        }
        s.gci().fetch_oops(s.handle(), oop, 1, size as usize)
    }

    /// Slice of `count` OOPs starting at the 1-based `start` index.
    pub fn fetch_oops(&self, oop: Oop, start: i64, count: usize) -> Result<Vec<Oop>, GciError> {
        if count == 0 {
            return Ok(vec![]);
        }
        let s = self.ready()?;
        s.gci().fetch_oops(s.handle(), oop, start, count)
    }

    /// Names in an Array of Symbols or Strings.
    pub fn fetch_string_array(&self, array: Oop) -> Result<Vec<String>, GciError> {
        if array.is_nil() {
            return Ok(vec![]);
        }
        self.fetch_all_oops(array)?
            .into_iter()
            .map(|oop| self.fetch_string(oop))
            .collect()
    }

    pub fn fetch_obj_info(&self, oop: Oop) -> Result<crate::gci::ObjInfo, GciError> {
        let s = self.ready()?;
        s.gci().fetch_obj_info(s.handle(), oop)
    }

    /// Decode a SmallInteger result, failing on anything else.
    pub fn expect_int(oop: Oop) -> Result<i64, GciError> {
        match oop.kind() {
            OopKind::SmallInt(i) => Ok(i),
            _ => Err(GciError::UnexpectedResult(oop, "SmallInteger")),
        }
    }

    // --------------------------------- processes -------------------------------------------------

    pub fn clear_stack(&self, process: Oop) -> Result<(), GciError> {
        let s = self.ready()?;
        s.gci().clear_stack(s.handle(), process)
    }

    pub fn continue_process(&self, process: Oop) -> Result<Oop, GciError> {
        let s = self.ready()?;
        s.gci().continue_with(s.handle(), process, Oop::ILLEGAL, 0)
    }

    /// Clear the suspended process of a failed evaluation, if there is one.
    pub fn discard(&self, error: &GciError) {
        if let Some(process) = error.debuggable_context() {
            log::debug!(target: "gci", "discard suspended process {process:?}");
            weak_error!(self.clear_stack(process), "discard suspended process:");
        }
    }

    // --------------------------------- methods ---------------------------------------------------

    /// Compile `source` into `class`. The suspended process of a compile error is cleared.
    pub fn compile_method(
        &self,
        class: Oop,
        source: &str,
        category: &str,
        env: u16,
    ) -> Result<Oop, GciError> {
        let source_oop = self.new_source_string(source)?;
        let category = self.new_symbol(category)?;
        let s = self.ready()?;
        let req = CompileRequest {
            source: source_oop,
            class,
            category,
            symbol_list: Oop::NIL,
            override_selector: Oop::NIL,
            flags: 0,
            env,
        };
        let result = s.gci().compile_method(s.handle(), &req);
        if let Err(e) = &result {
            self.discard(e);
        }
        result
    }

    pub fn remove_all_methods(&self, class: Oop) -> Result<(), GciError> {
        self.perform(class, "removeAllMethods", &[]).map(|_| ())
    }

    /// Compiled method for `selector`, nil when the class does not define it.
    pub fn compiled_method_at(
        &self,
        class: Oop,
        selector: &str,
        env: u16,
    ) -> Result<Oop, GciError> {
        let selector = self.new_symbol(selector)?;
        let env = Oop::from_i32(env as i32);
        self.perform(class, "compiledMethodAt:environmentId:otherwise:", &[selector, env, Oop::NIL])
    }

    // --------------------------------- traversal -------------------------------------------------

    /// Traverse from `oops` collecting every report, following "more" statuses.
    ///
    /// A "more" page without reports means the buffer cannot hold the next object.
    pub fn fetch_traversal_all(
        &self,
        oops: &[Oop],
        args: &ClampedTravArgs,
    ) -> Result<Vec<ObjectReport>, GciError> {
        let s = self.ready()?;
        let capacity = args.trav_buff_size.max(0) as usize;
        let mut buf = TraversalBuffer::with_capacity(capacity);
        let mut status = s.gci().fetch_traversal(s.handle(), oops, args, &mut buf)?;
        let mut page = buf.reports()?;
        let mut reports = vec![];
        while status == TraversalStatus::More {
            if page.is_empty() {
                return Err(TraversalError::EmptyPage(capacity).into());
            }
            reports.append(&mut page);
            let mut next = TraversalBuffer::with_capacity(capacity);
            status = s.gci().more_traversal(s.handle(), &mut next)?;
            page = next.reports()?;
        }
        reports.append(&mut page);
        Ok(reports)
    }

    /// Store reports back into their objects.
    pub fn store_traversal(&self, reports: &[ObjectReport], flags: i32) -> Result<(), GciError> {
        let s = self.ready()?;
        let capacity = crate::gci::traversal::packed_size(reports);
        let mut buf = TraversalBuffer::from_reports(reports, capacity)?;
        s.gci().store_traversal(s.handle(), &mut buf, flags)
    }
}
