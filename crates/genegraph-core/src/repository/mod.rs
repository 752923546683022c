//! Repository trait definitions (ports).
//!
//! The infrastructure layer (genegraph-infra) implements these with SQLite.
//! `memory` holds the in-process implementation used by the engine tests.

pub mod execution;
pub mod memory;

pub use execution::ExecutionRepository;
pub use memory::InMemoryExecutionRepository;
