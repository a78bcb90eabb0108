//! Shared domain types for the Cascade execution core.
//!
//! This crate contains the types that flow between the engine and its
//! embedding service: the hierarchical execution context (ambiance), static
//! plan nodes, runtime node executions, and their status machinery.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod ambiance;
pub mod error;
pub mod execution;
pub mod plan;
pub mod status;
pub mod step;
