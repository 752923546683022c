//! Shared domain types for genegraph.
//!
//! Executions, tasks, vertex records, engine configuration and engine events,
//! plus the repository error type used by the core traits.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod vertex;
