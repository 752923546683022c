//! `JobBackend` implementations.

pub mod local;

pub use local::LocalProcessBackend;
