//! Warm Engine Pool Manager.
//!
//! Keeps up to `max_pool_size` long-lived workload units around so a job can
//! skip the cold install. Each engine moves through
//!
//! ```text
//! STARTING → READY → GENERATING → EXPORTING → READY
//!                                           ↘ RESETTING → READY
//! any non-error state ──failure──▶ ERROR (torn down, removed)
//! ```
//!
//! The pool never retries a job itself; a failed job retires its engine and
//! the job controller decides what happens next.

pub mod manager;
pub mod recycle;
pub mod registry;

pub use manager::{ENGINE_READY_PATTERNS, WarmEnginePool, spawn_maintenance};
pub use recycle::{FastRestart, JobWatch, LiveReconfigure, RecycleContext, RecycleStrategy};
pub use registry::{EngineEntry, EngineRegistry, PoolStatus};
