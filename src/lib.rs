pub mod config;
pub mod dap;
pub mod debugger;
pub mod exec;
pub mod gci;
pub mod log;
pub mod query;
pub mod version;
