//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools.

pub mod execution;
pub mod pool;

pub use execution::SqliteExecutionRepository;
pub use pool::{database_url_in, default_data_dir, DatabasePool};
