//! In-memory execution repository backed by `DashMap`.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use genegraph_types::error::RepositoryError;
use genegraph_types::execution::{Execution, ExecutionStatus};

use super::execution::ExecutionRepository;

/// Process-local store. Reads return clones, so callers never alias the
/// stored value.
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<String, Execution>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryExecutionRepository {
    async fn create(&self, execution: &Execution) -> Result<(), RepositoryError> {
        match self.executions.entry(execution.name.clone()) {
            Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "execution '{}' already exists",
                execution.name
            ))),
            Entry::Vacant(slot) => {
                slot.insert(execution.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<Execution>, RepositoryError> {
        Ok(self.executions.get(name).map(|e| e.value().clone()))
    }

    async fn update_status(&self, name: &str, status: &ExecutionStatus) -> Result<(), RepositoryError> {
        let mut entry = self.executions.get_mut(name).ok_or(RepositoryError::NotFound)?;
        entry.status = status.clone();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Execution>, RepositoryError> {
        let mut all: Vec<Execution> = self.executions.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));
        Ok(all)
    }

    async fn delete(&self, name: &str) -> Result<bool, RepositoryError> {
        Ok(self.executions.remove(name).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{command_task, spec_of};
    use genegraph_types::execution::ExecutionPhase;

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let repo = InMemoryExecutionRepository::new();
        let exec = Execution::new("wgs", spec_of(vec![command_task("a", &[])]));
        repo.create(&exec).await.unwrap();

        let mut status = ExecutionStatus::default();
        status.phase = ExecutionPhase::Running;
        repo.update_status("wgs", &status).await.unwrap();

        let loaded = repo.get("wgs").await.unwrap().unwrap();
        assert_eq!(loaded.status.phase, ExecutionPhase::Running);
        assert_eq!(loaded.spec, exec.spec);

        assert!(repo.delete("wgs").await.unwrap());
        assert!(!repo.delete("wgs").await.unwrap());
        assert!(repo.get("wgs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let repo = InMemoryExecutionRepository::new();
        let exec = Execution::new("wgs", spec_of(vec![command_task("a", &[])]));
        repo.create(&exec).await.unwrap();
        let err = repo.create(&exec).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let repo = InMemoryExecutionRepository::new();
        let err = repo
            .update_status("ghost", &ExecutionStatus::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_reads_are_copies() {
        let repo = InMemoryExecutionRepository::new();
        repo.create(&Execution::new("wgs", spec_of(vec![command_task("a", &[])])))
            .await
            .unwrap();
        let mut copy = repo.get("wgs").await.unwrap().unwrap();
        copy.status.phase = ExecutionPhase::Failed;
        assert_eq!(
            repo.get("wgs").await.unwrap().unwrap().status.phase,
            ExecutionPhase::Pending
        );
    }

    #[tokio::test]
    async fn test_list_is_oldest_first() {
        let repo = InMemoryExecutionRepository::new();
        for name in ["first", "second", "third"] {
            repo.create(&Execution::new(name, spec_of(vec![command_task("a", &[])])))
                .await
                .unwrap();
        }
        let names: Vec<String> = repo.list().await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }
}
