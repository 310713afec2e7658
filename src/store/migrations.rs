//! Schema migrations for the libSQL backend.
//!
//! The applied version lives in SQLite's `user_version` pragma. Each pending
//! step runs in its own transaction together with the version bump, so a
//! failed step leaves the schema at the previous version.

use libsql::Connection;
use tracing::info;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Ordered; append only.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "mailboxes",
        sql: r#"
            CREATE TABLE IF NOT EXISTS mailboxes (
                email TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                account_id TEXT NOT NULL,
                access_token TEXT NOT NULL,
                history_cursor INTEGER,
                needs_reauth INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_mailboxes_account
                ON mailboxes(provider, account_id);
        "#,
    },
    Migration {
        version: 2,
        name: "job_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                mailbox_key TEXT NOT NULL,
                change_kind TEXT NOT NULL,
                change_token TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                enqueued_ms INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'ready',
                attempts INTEGER NOT NULL DEFAULT 0,
                available_at INTEGER NOT NULL,
                lease_id TEXT,
                lease_until INTEGER,
                last_error TEXT,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, available_at, enqueued_ms);
            CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(state, lease_until);
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let from = schema_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > from).collect();
    if pending.is_empty() {
        return Ok(());
    }

    for migration in pending {
        apply(conn, migration).await?;
    }
    info!(from, to = schema_version(conn).await?, "Schema migrated");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    info!(version = migration.version, name = migration.name, "Applying migration");
    let batch = format!(
        "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
        migration.sql, migration.version
    );
    if let Err(e) = conn.execute_batch(&batch).await {
        // The batch stops at the failing statement with the transaction open.
        let _ = conn.execute("ROLLBACK", ()).await;
        return Err(DatabaseError::Migration(format!(
            "V{} {}: {e}",
            migration.version, migration.name
        )));
    }
    Ok(())
}

async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("PRAGMA user_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read user_version: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("read user_version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read user_version: {e}"))),
    }
}
