//! Rollback-mode derivation: given a finished run, produce the plan and the
//! workflow document a rollback run executes.
//!
//! Both transformers read the source run as a point-in-time snapshot and
//! produce new immutable artifacts; they never mutate the source run.

mod plan;
mod yaml;

pub use plan::{ExecutedNode, derive_rollback_plan};
pub use yaml::{PIPELINE_ROLLBACK_STAGE_NAME, RollbackError, RollbackYamlTransformer};
