//! SQLite-backed live instance store

use super::schema::init_schema;
use super::{InstanceStore, KIND_CRON, KIND_TEMPLATE, KIND_WORKFLOW, StoreError};
use crate::model::{CronWorkflow, ObjectMeta, Workflow, WorkflowTemplate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

const TEMPLATES: &str = "workflow_templates";
const CRONS: &str = "cron_workflows";

/// Live object storage in a single SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(Path::new(":memory:"))
    }
}

pub(super) fn to_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(|t| t.timestamp_millis())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn decode<T: DeserializeOwned>(bodies: Vec<String>) -> Result<Vec<T>, StoreError> {
    bodies
        .iter()
        .map(|b| serde_json::from_str(b).map_err(StoreError::from))
        .collect()
}

/// Prepare metadata for a first write
fn stamp_new(meta: &mut ObjectMeta) -> i64 {
    meta.revision = 1;
    meta.created_at.get_or_insert_with(Utc::now).timestamp_millis()
}

/// Shared create for the name-keyed tables
fn create_named<T: Serialize>(
    conn: &Connection,
    table: &str,
    kind: &'static str,
    meta: &ObjectMeta,
    created_at: i64,
    object: &T,
) -> Result<(), StoreError> {
    let body = serde_json::to_string(object)?;
    let sql = format!(
        "INSERT INTO {} (namespace, name, revision, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        table
    );
    match conn.execute(
        &sql,
        params![meta.namespace, meta.name, meta.revision as i64, body, created_at],
    ) {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(StoreError::NameCollision {
            kind,
            name: meta.name.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

fn get_named<T: DeserializeOwned>(
    conn: &Connection,
    table: &str,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<T, StoreError> {
    let sql = format!("SELECT body FROM {} WHERE namespace = ?1 AND name = ?2", table);
    let body: Option<String> = conn
        .query_row(&sql, params![namespace, name], |row| row.get(0))
        .optional()?;
    match body {
        Some(body) => Ok(serde_json::from_str(&body)?),
        None => Err(StoreError::not_found(kind, name)),
    }
}

fn list_named<T: DeserializeOwned>(
    conn: &Connection,
    table: &str,
    namespace: Option<&str>,
) -> Result<Vec<T>, StoreError> {
    let sql = format!(
        "SELECT body FROM {} WHERE (?1 IS NULL OR namespace = ?1) ORDER BY namespace, name",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let bodies = stmt
        .query_map(params![namespace], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    decode(bodies)
}

fn update_named<T: Serialize>(
    conn: &Connection,
    table: &str,
    kind: &'static str,
    meta: &ObjectMeta,
    object: &T,
) -> Result<(), StoreError> {
    let expected = meta.revision.saturating_sub(1);
    let body = serde_json::to_string(object)?;
    let sql = format!(
        "UPDATE {} SET revision = ?1, body = ?2 WHERE namespace = ?3 AND name = ?4 AND revision = ?5",
        table
    );
    let changed = conn.execute(
        &sql,
        params![
            meta.revision as i64,
            body,
            meta.namespace,
            meta.name,
            expected as i64
        ],
    )?;
    if changed == 1 {
        return Ok(());
    }

    let sql = format!(
        "SELECT revision FROM {} WHERE namespace = ?1 AND name = ?2",
        table
    );
    let actual: Option<i64> = conn
        .query_row(&sql, params![meta.namespace, meta.name], |row| row.get(0))
        .optional()?;
    Err(match actual {
        None => StoreError::not_found(kind, meta.name.clone()),
        Some(actual) => StoreError::Conflict {
            kind,
            name: meta.name.clone(),
            expected,
            actual: actual as u64,
        },
    })
}

fn delete_named(
    conn: &Connection,
    table: &str,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> Result<(), StoreError> {
    let sql = format!("DELETE FROM {} WHERE namespace = ?1 AND name = ?2", table);
    if conn.execute(&sql, params![namespace, name])? == 0 {
        return Err(StoreError::not_found(kind, name));
    }
    Ok(())
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        let uid = workflow.uid().to_string();
        let conn = self.conn.lock().await;

        let existing: Option<String> = conn
            .query_row("SELECT body FROM workflows WHERE uid = ?1", [&uid], |row| {
                row.get(0)
            })
            .optional()?;
        if let Some(body) = existing {
            return Ok(serde_json::from_str(&body)?);
        }

        let mut stored = workflow.clone();
        let created_at = stamp_new(&mut stored.metadata);
        let body = serde_json::to_string(&stored)?;

        match conn.execute(
            "INSERT INTO workflows (uid, namespace, name, phase, revision, body, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uid,
                stored.namespace(),
                stored.name(),
                stored.phase().as_str(),
                stored.metadata.revision as i64,
                body,
                created_at,
                to_millis(stored.status.finished_at),
            ],
        ) {
            Ok(_) => Ok(stored),
            Err(e) if is_unique_violation(&e) => Err(StoreError::NameCollision {
                kind: KIND_WORKFLOW,
                name: stored.metadata.name,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_workflow(&self, uid: Uuid) -> Result<Workflow, StoreError> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM workflows WHERE uid = ?1",
                [uid.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::not_found(KIND_WORKFLOW, uid.to_string())),
        }
    }

    async fn get_workflow_by_name(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Workflow, StoreError> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM workflows WHERE namespace = ?1 AND name = ?2",
                params![namespace, name],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(serde_json::from_str(&body)?),
            None => Err(StoreError::not_found(KIND_WORKFLOW, name)),
        }
    }

    async fn list_workflows(&self, namespace: Option<&str>) -> Result<Vec<Workflow>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT body FROM workflows
             WHERE (?1 IS NULL OR namespace = ?1)
             ORDER BY created_at DESC, name",
        )?;
        let bodies = stmt
            .query_map(params![namespace], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        decode(bodies)
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
        let expected = workflow.metadata.revision;
        let mut stored = workflow.clone();
        stored.metadata.revision = expected + 1;
        let body = serde_json::to_string(&stored)?;
        let uid = stored.uid().to_string();

        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workflows SET phase = ?1, revision = ?2, body = ?3, finished_at = ?4
             WHERE uid = ?5 AND revision = ?6",
            params![
                stored.phase().as_str(),
                stored.metadata.revision as i64,
                body,
                to_millis(stored.status.finished_at),
                uid,
                expected as i64,
            ],
        )?;
        if changed == 1 {
            return Ok(stored);
        }

        let actual: Option<i64> = conn
            .query_row(
                "SELECT revision FROM workflows WHERE uid = ?1",
                [&uid],
                |row| row.get(0),
            )
            .optional()?;
        Err(match actual {
            None => StoreError::not_found(KIND_WORKFLOW, stored.metadata.name),
            Some(actual) => StoreError::Conflict {
                kind: KIND_WORKFLOW,
                name: stored.metadata.name,
                expected,
                actual: actual as u64,
            },
        })
    }

    async fn delete_workflow(&self, uid: Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM workflows WHERE uid = ?1", [uid.to_string()])?;
        if deleted == 0 {
            return Err(StoreError::not_found(KIND_WORKFLOW, uid.to_string()));
        }
        Ok(())
    }

    async fn create_template(
        &self,
        template: &WorkflowTemplate,
    ) -> Result<WorkflowTemplate, StoreError> {
        let mut stored = template.clone();
        let created_at = stamp_new(&mut stored.metadata);
        let conn = self.conn.lock().await;
        create_named(
            &conn,
            TEMPLATES,
            KIND_TEMPLATE,
            &stored.metadata,
            created_at,
            &stored,
        )?;
        Ok(stored)
    }

    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkflowTemplate, StoreError> {
        let conn = self.conn.lock().await;
        get_named(&conn, TEMPLATES, KIND_TEMPLATE, namespace, name)
    }

    async fn list_templates(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<WorkflowTemplate>, StoreError> {
        let conn = self.conn.lock().await;
        list_named(&conn, TEMPLATES, namespace)
    }

    async fn delete_template(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        delete_named(&conn, TEMPLATES, KIND_TEMPLATE, namespace, name)
    }

    async fn create_cron(&self, cron: &CronWorkflow) -> Result<CronWorkflow, StoreError> {
        let mut stored = cron.clone();
        let created_at = stamp_new(&mut stored.metadata);
        let conn = self.conn.lock().await;
        create_named(&conn, CRONS, KIND_CRON, &stored.metadata, created_at, &stored)?;
        Ok(stored)
    }

    async fn get_cron(&self, namespace: &str, name: &str) -> Result<CronWorkflow, StoreError> {
        let conn = self.conn.lock().await;
        get_named(&conn, CRONS, KIND_CRON, namespace, name)
    }

    async fn list_crons(&self, namespace: Option<&str>) -> Result<Vec<CronWorkflow>, StoreError> {
        let conn = self.conn.lock().await;
        list_named(&conn, CRONS, namespace)
    }

    async fn update_cron(&self, cron: &CronWorkflow) -> Result<CronWorkflow, StoreError> {
        let mut stored = cron.clone();
        stored.metadata.revision += 1;
        let conn = self.conn.lock().await;
        update_named(&conn, CRONS, KIND_CRON, &stored.metadata, &stored)?;
        Ok(stored)
    }

    async fn delete_cron(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        delete_named(&conn, CRONS, KIND_CRON, namespace, name)
    }
}
