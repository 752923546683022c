//! Engine logic and port traits for genegraph.
//!
//! This crate defines the ports (`JobBackend`, `ExecutionRepository`) that
//! the infrastructure layer implements. It depends only on `genegraph-types`,
//! never on `genegraph-infra` or any database/process IO crate.

pub mod backend;
pub mod engine;
pub mod event;
pub mod repository;

#[cfg(test)]
pub(crate) mod test_support;
