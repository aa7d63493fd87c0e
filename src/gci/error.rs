use crate::gci::oop::Oop;
use crate::gci::traversal::TraversalError;
use smallvec::SmallVec;
use std::fmt::{Display, Formatter};

/// Maximum number of error arguments carried by an error record.
pub const MAX_ERR_ARGS: usize = 10;

// well known error numbers
pub const ERR_DOES_NOT_UNDERSTAND: i32 = 2010;
pub const ERR_COMPILE: i32 = 1001;
pub const ERR_HARD_BREAK: i32 = 6004;
pub const ERR_SOFT_BREAK: i32 = 6003;
pub const ERR_BREAKPOINT: i32 = 6005;
pub const ERR_STEP: i32 = 6006;

/// Error record filled by every remote call. `number == 0` means success.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub category: Oop,
    /// Suspended process when the error is debuggable, nil otherwise.
    pub context: Oop,
    pub exception_obj: Oop,
    pub args: SmallVec<[Oop; MAX_ERR_ARGS]>,
    pub number: i32,
    pub arg_count: i32,
    pub fatal: bool,
    pub message: String,
    pub reason: String,
}

impl Default for ErrorRecord {
    fn default() -> Self {
        Self {
            category: Oop::NIL,
            context: Oop::NIL,
            exception_obj: Oop::NIL,
            args: SmallVec::new(),
            number: 0,
            arg_count: 0,
            fatal: false,
            message: String::new(),
            reason: String::new(),
        }
    }
}

impl ErrorRecord {
    pub fn new(number: i32, message: impl Into<String>) -> Self {
        Self {
            number,
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: Oop) -> Self {
        self.context = context;
        self
    }

    #[inline(always)]
    pub fn is_success(&self) -> bool {
        self.number == 0
    }

    /// Suspended process attached to this error, if any.
    pub fn debuggable_context(&self) -> Option<Oop> {
        (!self.context.is_nil() && !self.context.is_illegal() && self.context.raw() != 0)
            .then_some(self.context)
    }

    pub fn is_debuggable(&self) -> bool {
        self.debuggable_context().is_some()
    }

    /// Convert the `(result, record)` pair of a remote call into a `Result`.
    pub fn check<T>(self, value: T) -> Result<T, GciError> {
        if self.is_success() {
            Ok(value)
        } else {
            Err(GciError::Vm(Box::new(self)))
        }
    }
}

impl Display for ErrorRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = if self.message.is_empty() {
            &self.reason
        } else {
            &self.message
        };
        write!(f, "error {}: {}", self.number, text)?;
        if self.fatal {
            f.write_str(" (fatal)")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GciError {
    // --------------------------------- vm errors -------------------------------------------------
    #[error("{0}")]
    Vm(Box<ErrorRecord>),

    // --------------------------------- local faults ----------------------------------------------
    #[error("session busy: a non-blocking call is already outstanding")]
    SessionBusy,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Traversal(#[from] TraversalError),
    #[error("gci library: {0}")]
    Library(String),
    #[error("unexpected result {0:?}, expected {1}")]
    UnexpectedResult(Oop, &'static str),
}

impl GciError {
    /// Record of a failed remote evaluation, `None` for local faults.
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            GciError::Vm(record) => Some(record),
            _ => None,
        }
    }

    pub fn debuggable_context(&self) -> Option<Oop> {
        self.record().and_then(ErrorRecord::debuggable_context)
    }

    pub fn number(&self) -> Option<i32> {
        self.record().map(|r| r.number)
    }

    /// Return a hint to a caller - keep the session or drop it.
    pub fn is_fatal(&self) -> bool {
        match self {
            GciError::Vm(record) => record.fatal,
            GciError::SessionBusy => false,
            GciError::NotLoggedIn => false,
            GciError::InvalidArgument(_) => false,
            GciError::Traversal(_) => false,
            GciError::UnexpectedResult(_, _) => false,

            // currently fatal errors
            GciError::Library(_) => true,
        }
    }
}

impl From<ErrorRecord> for GciError {
    fn from(record: ErrorRecord) -> Self {
        GciError::Vm(Box::new(record))
    }
}
