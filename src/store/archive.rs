//! SQLite-backed workflow archive

use super::schema::init_schema;
use super::sqlite::to_millis;
use super::{ArchiveStore, KIND_ARCHIVED, ListFilter, StoreError};
use crate::model::Workflow;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Archive of terminal workflow snapshots
///
/// Snapshots are never rewritten: a repeated `put` for a UID keeps the first
/// snapshot. Faults other than `NotFound` are retried with the configured
/// policy before they surface as a storage error.
pub struct WorkflowArchive {
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl WorkflowArchive {
    /// Open or create the archive at `path`
    pub fn open(path: &Path, retry: RetryPolicy) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            retry,
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(Path::new(":memory:"), RetryPolicy::default())
    }

    async fn put_once(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let uid = workflow.uid().to_string();
        let finished_at = workflow
            .status
            .finished_at
            .or(workflow.metadata.created_at)
            .map(|t| t.timestamp_millis())
            .unwrap_or_default();
        let snapshot = serde_json::to_string(workflow)?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO archived_workflows (uid, namespace, name, phase, started_at, finished_at, snapshot)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(uid) DO NOTHING",
            params![
                uid,
                workflow.namespace(),
                workflow.name(),
                workflow.phase().as_str(),
                to_millis(workflow.status.started_at),
                finished_at,
                snapshot,
            ],
        )?;

        if inserted == 1 {
            for (key, value) in &workflow.metadata.labels {
                tx.execute(
                    "INSERT INTO archived_workflow_labels (uid, key, value) VALUES (?1, ?2, ?3)",
                    params![uid, key, value],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_once(&self, uid: Uuid) -> Result<Workflow, StoreError> {
        let conn = self.conn.lock().await;
        let snapshot: Option<String> = conn
            .query_row(
                "SELECT snapshot FROM archived_workflows WHERE uid = ?1",
                [uid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match snapshot {
            Some(snapshot) => Ok(serde_json::from_str(&snapshot)?),
            None => Err(StoreError::not_found(KIND_ARCHIVED, uid.to_string())),
        }
    }

    async fn list_once(&self, filter: &ListFilter) -> Result<Vec<Workflow>, StoreError> {
        let mut sql = String::from("SELECT a.snapshot FROM archived_workflows a WHERE 1 = 1");
        let mut args: Vec<Box<dyn ToSql + Send>> = Vec::new();

        if let Some(ref namespace) = filter.namespace {
            args.push(Box::new(namespace.clone()));
            sql.push_str(&format!(" AND a.namespace = ?{}", args.len()));
        }
        if let Some(ref prefix) = filter.name_prefix {
            args.push(Box::new(prefix.clone()));
            sql.push_str(&format!(" AND instr(a.name, ?{}) = 1", args.len()));
        }
        for (key, value) in &filter.labels {
            args.push(Box::new(key.clone()));
            let key_idx = args.len();
            args.push(Box::new(value.clone()));
            sql.push_str(&format!(
                " AND EXISTS (SELECT 1 FROM archived_workflow_labels l
                   WHERE l.uid = a.uid AND l.key = ?{} AND l.value = ?{})",
                key_idx,
                args.len()
            ));
        }
        sql.push_str(" ORDER BY a.finished_at DESC, a.name");

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref() as &dyn ToSql).collect();
        let snapshots = stmt
            .query_map(refs.as_slice(), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        snapshots
            .iter()
            .map(|s| serde_json::from_str(s).map_err(StoreError::from))
            .collect()
    }

    async fn delete_once(&self, uid: Uuid) -> Result<(), StoreError> {
        let uid = uid.to_string();
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM archived_workflow_labels WHERE uid = ?1",
            [&uid],
        )?;
        let deleted = tx.execute("DELETE FROM archived_workflows WHERE uid = ?1", [&uid])?;
        if deleted == 0 {
            return Err(StoreError::not_found(KIND_ARCHIVED, uid));
        }
        tx.commit()?;
        Ok(())
    }
}

/// Collapse exhausted retries into a plain storage error
fn surface(err: StoreError) -> StoreError {
    match err {
        StoreError::Storage { message } => {
            tracing::warn!(error = %message, "Archive operation failed after retries");
            StoreError::Storage { message }
        }
        other => other,
    }
}

#[async_trait]
impl ArchiveStore for WorkflowArchive {
    async fn put(&self, workflow: &Workflow) -> Result<(), StoreError> {
        if !workflow.is_terminal() {
            return Err(StoreError::NotTerminal {
                name: workflow.name().to_string(),
            });
        }
        self.retry
            .run("archive put", StoreError::is_retryable, || {
                self.put_once(workflow)
            })
            .await
            .map_err(surface)?;
        tracing::debug!(workflow = %workflow.name(), uid = %workflow.uid(), "Archived workflow");
        Ok(())
    }

    async fn get(&self, uid: Uuid) -> Result<Workflow, StoreError> {
        self.retry
            .run("archive get", StoreError::is_retryable, || self.get_once(uid))
            .await
            .map_err(surface)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Workflow>, StoreError> {
        self.retry
            .run("archive list", StoreError::is_retryable, || {
                self.list_once(filter)
            })
            .await
            .map_err(surface)
    }

    async fn delete(&self, uid: Uuid) -> Result<(), StoreError> {
        self.retry
            .run("archive delete", StoreError::is_retryable, || {
                self.delete_once(uid)
            })
            .await
            .map_err(surface)
    }
}
