//! Infrastructure layer for genegraph.
//!
//! Implements the ports defined in `genegraph-core`: SQLite execution storage,
//! the local process job backend, and the configuration file loader.

pub mod backend;
pub mod config;
pub mod sqlite;
