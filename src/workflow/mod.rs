//! # Workflow
//!
//! Declarative field mappings and sync-run orchestration:
//!
//! - mapping specs move `draft → validated → published`, and back to
//!   `validated` on unpublish
//! - the planner pins a run to a checkpoint and derives an idempotency seed
//! - the runner dedupes changes through the change log, records conflicts
//!   for stale versions and writes the next checkpoint
//! - schema baselines flag drift between mapping versions

pub mod compiler;
pub mod runtime;
pub mod store;
pub mod types;

pub use runtime::{BaselineRequest, PlanRequest, ResumeRequest, ResumedRun, WorkflowRuntime};
pub use store::{MappingStore, MemoryMappingStore, MemorySyncStore, SyncStateStore};
pub use types::*;
