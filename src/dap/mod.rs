//! Debug Adapter Protocol server over TCP, one client is one debug session.

pub mod hook;
pub mod io;
pub mod logger;
pub mod protocol;
pub mod server;

pub use server::DapServer;

/// DAP thread id of the suspended GemStone process, the only thread ever reported.
pub const PROCESS_THREAD_ID: i64 = 1;
