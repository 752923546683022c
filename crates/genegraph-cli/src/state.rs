//! Application state wiring the controller to its concrete backend and
//! repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use genegraph_core::engine::ExecutionController;
use genegraph_infra::backend::LocalProcessBackend;
use genegraph_infra::sqlite::{database_url_in, DatabasePool, SqliteExecutionRepository};
use genegraph_types::config::EngineConfig;

/// Controller pinned to the local process backend and SQLite storage.
pub type ConcreteController = ExecutionController<LocalProcessBackend, SqliteExecutionRepository>;

pub struct AppState {
    pub controller: Arc<ConcreteController>,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Open the database and build the controller.
    ///
    /// `database_url` and `volume_root` fall back to `<data_dir>/genegraph.db`
    /// and `<data_dir>/volumes`.
    pub async fn init(data_dir: &Path, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;

        let db_url = config
            .database_url
            .clone()
            .unwrap_or_else(|| database_url_in(data_dir));
        let pool = DatabasePool::new(&db_url).await?;

        let volume_root = config
            .volume_root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("volumes"));

        tracing::debug!(
            database = db_url.as_str(),
            volume_root = %volume_root.display(),
            "engine state initialized"
        );

        let backend = Arc::new(LocalProcessBackend::new(volume_root));
        let repo = Arc::new(SqliteExecutionRepository::new(pool));
        Ok(Self {
            controller: Arc::new(ExecutionController::new(backend, repo, config)),
            data_dir: data_dir.to_path_buf(),
        })
    }
}
