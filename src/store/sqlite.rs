/// SQLite persistence layer for the document store
///
/// Workflows are stored as JSON definitions next to indexed lookup fields.
/// Files (user component manifests and code) live in a flat `documents` table
/// keyed by path; directories are explicit marker rows.

use super::{direct_child, normalize_path, DocumentStore};
use crate::workflow::types::{Workflow, WorkflowSummary};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool},
    Row,
};
use std::{collections::BTreeSet, path::Path};

/// SQLite-backed document store
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    /// SQLite connection pool
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Open (creating if missing) the database file and initialize the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!("Failed to create database directory '{}': {}", parent.display(), e)
            })?;
        }

        tracing::info!("🗄️ Opening document store: {}", path.display());
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables; safe to call multiple times
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                content TEXT,
                is_dir INTEGER NOT NULL DEFAULT 0,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let definition_json: String = row.get("definition");
            let workflow: Workflow = serde_json::from_str(&definition_json)?;
            summaries.push(workflow.summary());
        }
        Ok(summaries)
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, enabled, definition, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                enabled = excluded.enabled,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(workflow.enabled)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_directory(&self, path: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (path, content, is_dir) VALUES (?, NULL, 1) ON CONFLICT(path) DO NOTHING",
        )
        .bind(normalize_path(path))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT content FROM documents WHERE path = ? AND is_dir = 0")
            .bind(normalize_path(path))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| row.get::<Option<String>, _>("content")))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (path, content, is_dir, updated_at)
            VALUES (?, ?, 0, CURRENT_TIMESTAMP)
            ON CONFLICT(path) DO UPDATE SET
                content = excluded.content,
                is_dir = 0,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(normalize_path(path))
        .bind(content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        let parent = normalize_path(path);
        let pattern = if parent.is_empty() {
            "%".to_string()
        } else {
            format!("{}/%", parent)
        };

        let rows = sqlx::query("SELECT path FROM documents WHERE path LIKE ?")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;

        let children: BTreeSet<String> = rows
            .iter()
            .filter_map(|row| {
                let path: String = row.get("path");
                direct_child(&parent, &path).map(str::to_string)
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let target = normalize_path(path);
        sqlx::query("DELETE FROM documents WHERE path = ? OR path LIKE ?")
            .bind(&target)
            .bind(format!("{}/%", target))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{TriggerConfig, TriggerType};

    #[tokio::test]
    async fn round_trips_workflows_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteDocumentStore::open(dir.path().join("store.db"))
            .await
            .unwrap();

        let workflow = Workflow {
            id: "wf1".into(),
            name: "First".into(),
            description: String::new(),
            enabled: false,
            trigger: TriggerConfig {
                trigger_type: TriggerType::Webhook,
                cron_expression: None,
            },
            steps: vec![],
        };
        store.save_workflow(&workflow).await.unwrap();

        let loaded = store.get_workflow("wf1").await.unwrap().unwrap();
        assert!(!loaded.enabled);
        assert_eq!(store.list_workflows().await.unwrap().len(), 1);

        store
            .write_file("components/user/slug/manifest.json", "{\"name\":\"slug\"}")
            .await
            .unwrap();
        assert_eq!(
            store.list_directory("components/user").await.unwrap(),
            vec!["slug".to_string()]
        );

        store.delete_file("components/user/slug").await.unwrap();
        assert!(store.list_directory("components/user").await.unwrap().is_empty());
        assert!(store.delete_workflow("wf1").await.unwrap());
        assert!(!store.delete_workflow("wf1").await.unwrap());
    }
}
