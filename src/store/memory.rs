/// In-memory document store
///
/// Used by tests and single-process deployments that do not need durability.

use super::{direct_child, normalize_path, DocumentStore};
use crate::workflow::types::{Workflow, WorkflowSummary};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    workflows: RwLock<HashMap<String, Workflow>>,
    files: RwLock<BTreeMap<String, String>>,
    directories: RwLock<BTreeSet<String>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.workflows.read().await.get(id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let mut summaries: Vec<WorkflowSummary> = self
            .workflows
            .read()
            .await
            .values()
            .map(Workflow::summary)
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.workflows
            .write()
            .await
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        Ok(self.workflows.write().await.remove(id).is_some())
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        self.directories.write().await.insert(normalize_path(path));
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        Ok(self.files.read().await.get(&normalize_path(path)).cloned())
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .write()
            .await
            .insert(normalize_path(path), content.to_string());
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        let parent = normalize_path(path);
        let mut children = BTreeSet::new();

        for key in self.files.read().await.keys() {
            if let Some(child) = direct_child(&parent, key) {
                children.insert(child.to_string());
            }
        }
        for dir in self.directories.read().await.iter() {
            if let Some(child) = direct_child(&parent, dir) {
                children.insert(child.to_string());
            }
        }

        Ok(children.into_iter().collect())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let target = normalize_path(path);
        let prefix = format!("{}/", target);

        self.files
            .write()
            .await
            .retain(|key, _| key != &target && !key.starts_with(&prefix));
        self.directories
            .write()
            .await
            .retain(|dir| dir != &target && !dir.starts_with(&prefix));
        Ok(())
    }
}
