//! Task orchestration over git worktrees and an external coding agent.
//!
//! A queued task is claimed from the durable store, given its own worktree
//! on `task/<id>`, executed by the agent process, and integrated into the
//! integration branch by a serialized merge/verify/rebase/push pipeline.
//! Tasks flagged for plan review first run a read-only planning pass and
//! wait for a human decision.
//!
//! - **[`core`]**: Pure logic (records, transition table, event decoding).
//! - **[`io`]**: Side effects (record files, mirror, git, processes).
//!
//! [`coordinator`], [`pipeline`], [`dispatcher`] and [`review`] compose
//! the two into the running system.

pub mod coordinator;
pub mod core;
pub mod dispatcher;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod review;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
