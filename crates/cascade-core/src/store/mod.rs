//! Storage ports for the execution core.
//!
//! These traits are the seam between the engine and whatever durable store
//! the embedding service uses. The engine never mutates a node execution
//! except through [`NodeExecutionStore::update_status_with_ops`], the guarded
//! compare-and-swap primitive that linearizes concurrent transitions.

mod memory;
mod node;
mod plan;

pub use memory::{InMemoryNodeExecutionStore, InMemoryPlanStore};
pub use node::NodeExecutionStore;
pub use plan::PlanStore;
