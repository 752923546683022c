//! Workflow engine: graph validation, gating, fan-out, retries, the
//! reconciliation pass and the controller that drives it.

pub mod condition;
pub mod controller;
pub mod definition;
pub mod fanout;
pub mod graph;
pub mod reconcile;
pub mod retry;
pub mod status;
pub mod vertex;

pub use controller::{ControllerError, ExecutionController};
pub use definition::{load_execution_file, parse_execution_yaml, ExecutionDocument, GraphValidationError};
pub use reconcile::{PassReport, Reconciler};
