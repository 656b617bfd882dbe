//! World generation orchestrator.
//!
//! Runs a game-server workload once per seed inside an isolated compute unit,
//! waits until the world is written, validates the artifacts, and tracks the
//! job. An optional warm engine pool keeps units alive between seeds.

pub mod config;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod pool;
pub mod readiness;
pub mod runtime;

pub use worldgen_common as common;
