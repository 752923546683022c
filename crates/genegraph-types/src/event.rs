//! Event types for the engine event bus.
//!
//! `EngineEvent` is broadcast by the controller as executions and vertices
//! change state. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionPhase;
use crate::vertex::VertexPhase;

/// Events emitted while executions are reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// An execution passed graph validation and was stored.
    ExecutionSubmitted {
        execution: String,
        uid: Uuid,
        tasks: usize,
    },

    /// A vertex changed phase.
    VertexTransitioned {
        execution: String,
        vertex: String,
        /// `None` when the vertex was created by this transition.
        from: Option<VertexPhase>,
        to: VertexPhase,
        reason: Option<String>,
        at: DateTime<Utc>,
    },

    /// A fan-out task materialized its children.
    FanOutExpanded {
        execution: String,
        vertex: String,
        children: Vec<String>,
    },

    /// The aggregate phase of an execution changed.
    ExecutionPhaseChanged {
        execution: String,
        from: ExecutionPhase,
        to: ExecutionPhase,
        message: Option<String>,
    },

    /// An execution and its jobs were removed.
    ExecutionDeleted { execution: String },
}

impl EngineEvent {
    /// Name of the execution this event concerns.
    pub fn execution(&self) -> &str {
        match self {
            Self::ExecutionSubmitted { execution, .. }
            | Self::VertexTransitioned { execution, .. }
            | Self::FanOutExpanded { execution, .. }
            | Self::ExecutionPhaseChanged { execution, .. }
            | Self::ExecutionDeleted { execution } => execution,
        }
    }
}
