//! Binding to the GemStone C interface (thread-safe "GciTs" flavour).
//!
//! [`Gci`] has one typed method per remote entry point. Every session-bound call turns the
//! `(result, error record)` pair of the C ABI into a `Result`: an error record with a non-zero
//! number becomes [`GciError::Vm`] and the companion value is never exposed.
//!
//! [`GciLibrary`] implements the trait over the shared library loaded at runtime; tests
//! implement it in memory.

pub mod error;
pub mod library;
pub mod oop;
pub mod session;
pub mod sys;
pub mod traversal;

pub use error::{ErrorRecord, GciError};
pub use library::GciLibrary;
pub use oop::{Oop, OopKind};
pub use session::{CallState, GemSession, NbCall, SessionRegistry};
pub use traversal::{ObjectReport, TraversalBuffer, TraversalStatus};

/// Opaque session handle returned by login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub usize);

/// Flags for execute/perform calls.
pub mod flags {
    /// Keep the process of an unhandled error suspended so it can be debugged.
    pub const ENABLE_DEBUG: i32 = 0x1;
    pub const DISABLE_ASYNC_EVENTS: i32 = 0x2;
    pub const SINGLE_THREADED: i32 = 0x4;
}

/// Environment id of Smalltalk methods.
pub const DEFAULT_ENV: u16 = 0;

#[derive(Debug, Clone, Default)]
pub struct LoginParams {
    pub stone: String,
    pub gem: String,
    pub username: String,
    pub password: String,
    pub host_username: Option<String>,
    pub host_password: Option<String>,
    pub login_flags: u32,
}

/// Source evaluation request. `symbol_list` nil means the user's default symbol list.
#[derive(Debug, Clone, Copy)]
pub struct ExecRequest<'a> {
    pub source: &'a str,
    /// Class used to wrap `source` into a VM string.
    pub source_class: Oop,
    pub context: Oop,
    pub symbol_list: Oop,
    pub flags: i32,
    pub env: u16,
}

impl<'a> ExecRequest<'a> {
    pub fn new(source: &'a str, source_class: Oop) -> Self {
        Self {
            source,
            source_class,
            context: Oop::NIL,
            symbol_list: Oop::NIL,
            flags: 0,
            env: DEFAULT_ENV,
        }
    }

    pub fn with_flags(self, flags: i32) -> Self {
        Self { flags, ..self }
    }

    pub fn with_context(self, context: Oop) -> Self {
        Self { context, ..self }
    }
}

/// Message send request. An empty `args` slice is a valid unary send.
#[derive(Debug, Clone, Copy)]
pub struct PerformRequest<'a> {
    pub receiver: Oop,
    pub selector: &'a str,
    pub args: &'a [Oop],
    pub flags: i32,
    pub env: u16,
}

impl<'a> PerformRequest<'a> {
    pub fn new(receiver: Oop, selector: &'a str, args: &'a [Oop]) -> Self {
        Self {
            receiver,
            selector,
            args,
            flags: 0,
            env: DEFAULT_ENV,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompileRequest {
    pub source: Oop,
    pub class: Oop,
    pub category: Oop,
    pub symbol_list: Oop,
    /// Nil to take the selector from the source.
    pub override_selector: Oop,
    pub flags: i32,
    pub env: u16,
}

/// Object header summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjInfo {
    pub id: Oop,
    pub class: Oop,
    /// Named plus indexed size.
    pub size: i64,
    pub named_size: i32,
    pub access: u32,
    pub security_policy: u16,
    pub bits: u16,
}

impl ObjInfo {
    const IMPL_MASK: u16 = 0x03;
    const INDEXABLE: u16 = 0x04;

    pub fn indexed_size(&self) -> i64 {
        (self.size - self.named_size as i64).max(0)
    }

    pub fn implementation(&self) -> traversal::ObjImpl {
        match self.bits & Self::IMPL_MASK {
            0 => traversal::ObjImpl::Pointer,
            1 => traversal::ObjImpl::Byte,
            2 => traversal::ObjImpl::Nsc,
            _ => traversal::ObjImpl::Special,
        }
    }

    pub fn is_indexable(&self) -> bool {
        self.bits & Self::INDEXABLE != 0
    }

    /// Number of indexed slots holding OOPs. Byte objects have none.
    pub fn indexed_oops(&self) -> i64 {
        match self.implementation() {
            traversal::ObjImpl::Pointer | traversal::ObjImpl::Nsc => self.indexed_size(),
            _ => 0,
        }
    }
}

/// Result of a UTF-8 fetch. `required` exceeds `bytes.len()` when the buffer was too small.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utf8Fetch {
    pub bytes: Vec<u8>,
    pub required: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Ready,
    NotReady,
}

/// Arguments of a clamped traversal.
#[derive(Debug, Clone, Copy)]
pub struct ClampedTravArgs {
    pub clamp_spec: Oop,
    pub result_oop: Oop,
    pub trav_buff_size: i32,
    pub level: i32,
    pub retrieval_flags: i32,
    pub is_rpc: bool,
}

impl Default for ClampedTravArgs {
    fn default() -> Self {
        Self {
            clamp_spec: Oop::NIL,
            result_oop: Oop::ILLEGAL,
            trav_buff_size: 64 * 1024,
            level: 1,
            retrieval_flags: 0,
            is_rpc: false,
        }
    }
}

/// Remote entry points. Apart from [`Gci::version`] every call needs a logged in session.
pub trait Gci: Send + Sync {
    fn version(&self) -> String;

    // --------------------------------- session lifecycle -----------------------------------------
    fn login(&self, params: &LoginParams) -> Result<SessionHandle, GciError>;
    fn logout(&self, session: SessionHandle) -> Result<(), GciError>;
    fn abort(&self, session: SessionHandle) -> Result<(), GciError>;
    fn begin(&self, session: SessionHandle) -> Result<(), GciError>;
    fn commit(&self, session: SessionHandle) -> Result<bool, GciError>;

    // --------------------------------- evaluation ------------------------------------------------
    fn resolve_symbol(
        &self,
        session: SessionHandle,
        name: &str,
        symbol_list: Oop,
    ) -> Result<Oop, GciError>;
    fn execute(&self, session: SessionHandle, req: &ExecRequest) -> Result<Oop, GciError>;
    /// Execute and fetch the bytes of the result, truncated to `max`.
    fn execute_fetch_bytes(
        &self,
        session: SessionHandle,
        req: &ExecRequest,
        max: usize,
    ) -> Result<Vec<u8>, GciError>;
    fn perform(&self, session: SessionHandle, req: &PerformRequest) -> Result<Oop, GciError>;
    /// Perform and fetch the bytes of the result, truncated to `max`.
    fn perform_fetch_bytes(
        &self,
        session: SessionHandle,
        req: &PerformRequest,
        max: usize,
    ) -> Result<Vec<u8>, GciError>;
    fn compile_method(&self, session: SessionHandle, req: &CompileRequest)
        -> Result<Oop, GciError>;

    // --------------------------------- non-blocking evaluation -----------------------------------
    fn nb_execute(&self, session: SessionHandle, req: &ExecRequest) -> Result<(), GciError>;
    fn nb_perform(&self, session: SessionHandle, req: &PerformRequest) -> Result<(), GciError>;
    fn nb_poll(&self, session: SessionHandle, timeout_ms: i32) -> Result<PollStatus, GciError>;
    fn nb_result(&self, session: SessionHandle) -> Result<Oop, GciError>;
    /// Soft or hard break of the running evaluation.
    fn interrupt(&self, session: SessionHandle, hard: bool) -> Result<(), GciError>;

    // --------------------------------- processes -------------------------------------------------
    fn clear_stack(&self, session: SessionHandle, process: Oop) -> Result<(), GciError>;
    fn continue_with(
        &self,
        session: SessionHandle,
        process: Oop,
        replace_top: Oop,
        flags: i32,
    ) -> Result<Oop, GciError>;

    // --------------------------------- objects ---------------------------------------------------
    fn fetch_class(&self, session: SessionHandle, oop: Oop) -> Result<Oop, GciError>;
    fn fetch_size(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError>;
    fn fetch_varying_size(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError>;
    fn fetch_obj_info(&self, session: SessionHandle, oop: Oop) -> Result<ObjInfo, GciError>;
    /// Fetch up to `max` bytes starting at the 1-based `start` index.
    fn fetch_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        max: usize,
    ) -> Result<Vec<u8>, GciError>;
    fn fetch_utf8_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        max: usize,
    ) -> Result<Utf8Fetch, GciError>;
    fn store_bytes(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        bytes: &[u8],
        of_class: Oop,
    ) -> Result<(), GciError>;
    /// Fetch up to `count` OOPs starting at the 1-based `start` index.
    fn fetch_oops(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        count: usize,
    ) -> Result<Vec<Oop>, GciError>;
    fn store_oops(
        &self,
        session: SessionHandle,
        oop: Oop,
        start: i64,
        oops: &[Oop],
        overlay: bool,
    ) -> Result<(), GciError>;
    fn new_obj(&self, session: SessionHandle, class: Oop) -> Result<Oop, GciError>;
    fn new_string(&self, session: SessionHandle, s: &str) -> Result<Oop, GciError>;
    fn new_symbol(&self, session: SessionHandle, s: &str) -> Result<Oop, GciError>;

    // --------------------------------- conversions -----------------------------------------------
    fn i64_to_oop(&self, session: SessionHandle, i: i64) -> Result<Oop, GciError>;
    fn oop_to_i64(&self, session: SessionHandle, oop: Oop) -> Result<i64, GciError>;
    fn double_to_oop(&self, session: SessionHandle, d: f64) -> Result<Oop, GciError>;
    fn oop_to_double(&self, session: SessionHandle, oop: Oop) -> Result<f64, GciError>;

    // --------------------------------- traversal -------------------------------------------------
    fn fetch_traversal(
        &self,
        session: SessionHandle,
        oops: &[Oop],
        args: &ClampedTravArgs,
        buf: &mut TraversalBuffer,
    ) -> Result<TraversalStatus, GciError>;
    fn more_traversal(
        &self,
        session: SessionHandle,
        buf: &mut TraversalBuffer,
    ) -> Result<TraversalStatus, GciError>;
    fn store_traversal(
        &self,
        session: SessionHandle,
        buf: &mut TraversalBuffer,
        flags: i32,
    ) -> Result<(), GciError>;
}
