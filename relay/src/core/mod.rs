//! Pure, deterministic logic for the orchestrator.
//!
//! Nothing here touches the filesystem, spawns processes or takes locks.

pub mod events;
pub mod ids;
pub mod transitions;
pub mod types;
