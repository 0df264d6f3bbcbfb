use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use switchyard_types::{Run, RunPatch, RunStore, StoreError, StoreResult};

/// Run store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<String, Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.read().is_empty()
    }
}

impl RunStore for MemoryRunStore {
    fn create_run(&self, run: &Run) -> StoreResult<()> {
        let mut runs = self.runs.write();
        if runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run '{}' already exists", run.id)));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn get_run(&self, id: &str) -> StoreResult<Option<Run>> {
        Ok(self.runs.read().get(id).cloned())
    }

    fn update_run(&self, id: &str, patch: RunPatch) -> StoreResult<Run> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(id)
            .ok_or_else(|| StoreError::Missing(id.to_string()))?;
        patch.apply(run, Utc::now());
        Ok(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use serde_json::json;
    use switchyard_types::RunStatus;

    #[test]
    fn test_create_get_update() {
        let store = MemoryRunStore::new();
        let run = Run::new(testing::context(json!({})));
        store.create_run(&run).unwrap();

        let updated = store
            .update_run(&run.id, RunPatch::status(RunStatus::Running))
            .unwrap();
        assert_eq!(updated.status, RunStatus::Running);
        assert!(updated.updated_at >= run.updated_at);
        assert_eq!(store.get_run(&run.id).unwrap().unwrap(), updated);
    }

    #[test]
    fn test_duplicate_create_conflicts() {
        let store = MemoryRunStore::new();
        let run = Run::new(testing::context(json!({})));
        store.create_run(&run).unwrap();
        assert!(matches!(store.create_run(&run), Err(StoreError::Conflict(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_unknown() {
        let store = MemoryRunStore::new();
        assert!(matches!(
            store.update_run("nope", RunPatch::default()),
            Err(StoreError::Missing(_))
        ));
    }
}
