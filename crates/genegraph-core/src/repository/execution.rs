//! Execution repository trait definition.
//!
//! Stores each execution as its immutable spec plus the latest status
//! snapshot. The reconciliation pass is the only writer of status, and it
//! always writes the whole snapshot, so readers never observe a partial pass.

use genegraph_types::error::RepositoryError;
use genegraph_types::execution::{Execution, ExecutionStatus};

/// Repository trait for execution persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionRepository: Send + Sync {
    /// Store a newly submitted execution. Fails with `Conflict` when the
    /// name is taken.
    fn create(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an owned copy of an execution by name.
    fn get(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// Replace the status snapshot. Fails with `NotFound` for unknown names.
    fn update_status(
        &self,
        name: &str,
        status: &ExecutionStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All executions, oldest first.
    fn list(&self) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// Remove an execution. Returns `true` if it existed.
    fn delete(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
