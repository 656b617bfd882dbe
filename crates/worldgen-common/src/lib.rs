//! Shared domain types for the worldgen orchestrator.
//!
//! These types cross every subsystem boundary (plan builder, readiness
//! detector, orchestrator, warm pool, job controller) and are persisted as
//! JSON by the status store, so they live in their own crate with no runtime
//! dependencies.

pub mod engine;
pub mod job;
pub mod plan;
pub mod result;

pub use engine::{Engine, EngineState, EngineTransitionError};
pub use job::{GenerationStatus, Job, JobStage, JobStatus, JobTransitionError};
pub use plan::{ExpectedOutputs, LaunchPlan, MountMode, ReadinessSpec, VolumeMount};
pub use result::{FailureKind, GenerationResult};
