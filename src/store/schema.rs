//! Database schema for live objects and the archive

use rusqlite::Connection;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS workflows (
            uid TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            phase TEXT NOT NULL,
            revision INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            finished_at INTEGER,
            UNIQUE(namespace, name)
        );

        CREATE INDEX IF NOT EXISTS idx_workflows_namespace ON workflows(namespace);
        CREATE INDEX IF NOT EXISTS idx_workflows_phase ON workflows(phase);

        CREATE TABLE IF NOT EXISTS workflow_templates (
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            revision INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY(namespace, name)
        );

        CREATE TABLE IF NOT EXISTS cron_workflows (
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            revision INTEGER NOT NULL,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY(namespace, name)
        );

        CREATE TABLE IF NOT EXISTS archived_workflows (
            uid TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            phase TEXT NOT NULL,
            started_at INTEGER,
            finished_at INTEGER NOT NULL,
            snapshot TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_archived_namespace ON archived_workflows(namespace);
        CREATE INDEX IF NOT EXISTS idx_archived_finished ON archived_workflows(finished_at);

        CREATE TABLE IF NOT EXISTS archived_workflow_labels (
            uid TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY(uid, key),
            FOREIGN KEY(uid) REFERENCES archived_workflows(uid) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_archived_labels_kv ON archived_workflow_labels(key, value);
        "#,
    )
}
