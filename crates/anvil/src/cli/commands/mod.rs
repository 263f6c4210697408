//! CLI commands

mod cache;
mod exec;
mod init;

pub use cache::CacheCommand;
pub use exec::ExecCommand;
pub use init::InitCommand;
