use crate::gci::{GciError, Oop};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- session errors --------------------------------------------
    #[error("debug session is not attached to a process")]
    NotAttached,
    #[error("debug session already attached")]
    AlreadyAttached,
    #[error("no session with id {0}")]
    InvalidSession(u32),
    #[error("process is running")]
    ProcessRunning,

    // --------------------------------- debugger entity not found----------------------------------
    #[error("frame number {0} not found")]
    FrameNotFound(u32),
    #[error("unknown variable reference {0}")]
    UnknownVariableReference(i64),
    #[error("unknown source reference {0}")]
    UnknownSourceReference(i64),
    #[error("method not found at {0}")]
    MethodNotFound(String),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("frame contents of {actual} slots, at least {expected} expected")]
    FrameShape { expected: usize, actual: usize },
    #[error("invalid source location `{0}`: {1}")]
    SourceLocation(String, &'static str),
    #[error("unexpected value {0:?} for {1}")]
    UnexpectedValue(Oop, &'static str),

    // --------------------------------- remote errors ---------------------------------------------
    #[error(transparent)]
    Gci(#[from] GciError),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NotAttached => false,
            Error::AlreadyAttached => false,
            Error::InvalidSession(_) => false,
            Error::ProcessRunning => false,
            Error::FrameNotFound(_) => false,
            Error::UnknownVariableReference(_) => false,
            Error::UnknownSourceReference(_) => false,
            Error::MethodNotFound(_) => false,
            Error::FrameShape { .. } => false,
            Error::SourceLocation(_, _) => false,
            Error::UnexpectedValue(_, _) => false,
            Error::Hook(_) => false,
            Error::Gci(e) => e.is_fatal(),
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
