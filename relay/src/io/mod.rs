//! Side effects: record files, git, agent processes, verification.

pub mod config;
pub mod git;
pub mod init;
pub mod merge;
pub mod mirror;
pub mod paths;
pub mod plan_store;
pub mod process;
pub mod prompt;
pub mod records;
pub mod session_log;
pub mod store;
pub mod supervisor;
pub mod verify;
pub mod workspace;
