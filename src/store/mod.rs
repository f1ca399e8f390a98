/// Document store boundary
///
/// Workflow definitions and user components live in an external key-value
/// document store. The engine only talks to it through [`DocumentStore`].

pub mod memory;
pub mod sqlite;

use crate::workflow::types::{Workflow, WorkflowSummary};
use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;

/// Narrow interface onto the external document store
///
/// Paths are `/`-separated and relative (e.g. `components/user/slugify/manifest.json`).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>>;

    /// Insert or replace a workflow by id
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Returns whether a workflow was deleted
    async fn delete_workflow(&self, id: &str) -> Result<bool>;

    async fn create_directory(&self, path: &str) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Option<String>>;

    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Names of the direct children of `path`, sorted
    async fn list_directory(&self, path: &str) -> Result<Vec<String>>;

    /// Delete a file, or a directory with everything below it
    async fn delete_file(&self, path: &str) -> Result<()>;
}

/// Normalize a store path: no leading/trailing slashes, no empty segments
pub(crate) fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Direct child name of `path` under `parent`, if `path` lies below it
pub(crate) fn direct_child<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    let rest = if parent.is_empty() {
        path
    } else {
        path.strip_prefix(parent)?.strip_prefix('/')?
    };
    rest.split('/').next().filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes() {
        assert_eq!(normalize_path("/components//user/"), "components/user");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn finds_direct_children_only() {
        assert_eq!(direct_child("components", "components/user/a.json"), Some("user"));
        assert_eq!(direct_child("components", "componentsx/a"), None);
        assert_eq!(direct_child("", "top/level"), Some("top"));
    }
}
