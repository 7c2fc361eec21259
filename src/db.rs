//! Read model (C14's projection target) — a `SqlitePool`-backed materialized
//! view, separate from the per-space op store (C3/[`crate::storage`]).
//! Queries over object state go through here rather than replaying trees.

use std::collections::BTreeMap;

use serde_json::Value;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::error::CoreError;
use crate::state::ObjectState;
use crate::utm::SyncStatus;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("malformed view row: {0}")]
    Malformed(String),
}

impl From<DbError> for CoreError {
    fn from(e: DbError) -> Self {
        CoreError::Internal(e.to_string())
    }
}

/// Runs once per pool open. Idempotent `CREATE TABLE IF NOT EXISTS`, plus
/// additive `ALTER TABLE` migrations whose "duplicate column" failures are
/// swallowed on a re-run.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS objects (
            space_id        TEXT NOT NULL,
            object_id       TEXT NOT NULL,
            object_type     TEXT NOT NULL,
            version         INTEGER NOT NULL,
            head_id         TEXT NOT NULL,
            timestamp       INTEGER NOT NULL,
            owner_key       TEXT NOT NULL,
            fields_json     TEXT NOT NULL,
            PRIMARY KEY (space_id, object_id)
        );

        CREATE INDEX IF NOT EXISTS objects_by_type ON objects (space_id, object_type);

        CREATE TABLE IF NOT EXISTS tree_index (
            space_id        TEXT NOT NULL,
            tree_id         TEXT NOT NULL,
            change_type     TEXT NOT NULL,
            object_id       TEXT NOT NULL,
            object_type     TEXT NOT NULL,
            PRIMARY KEY (space_id, tree_id)
        );

        CREATE TABLE IF NOT EXISTS sync_status (
            space_id                TEXT PRIMARY KEY,
            trees_changed_locally   INTEGER NOT NULL DEFAULT 0,
            heads_received          INTEGER NOT NULL DEFAULT 0,
            heads_applied           INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Additive migrations (safe to re-run: "duplicate column" is swallowed).
    let _ = sqlx::query("ALTER TABLE objects ADD COLUMN deleted_at INTEGER")
        .execute(pool)
        .await;

    Ok(())
}

/// Opens an in-memory pool and runs migrations — used by tests and by any
/// caller that only needs a transient view store (spec's ambient test
/// tooling uses `sqlite::memory:`, see DESIGN.md).
pub async fn open_in_memory() -> Result<SqlitePool, DbError> {
    let pool = SqlitePool::connect("sqlite::memory:").await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Upserts the latest projection of an object (C14 writes this after every
/// applied change; C10's facades read through [`crate::utm::Utm`] directly
/// and never touch this table — it exists for cross-object queries).
pub async fn upsert_object(pool: &SqlitePool, space_id: &str, state: &ObjectState) -> Result<(), DbError> {
    let fields_json = serde_json::to_string(&state.fields).map_err(|e| DbError::Malformed(e.to_string()))?;
    sqlx::query(
        r#"
        INSERT INTO objects (space_id, object_id, object_type, version, head_id, timestamp, owner_key, fields_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(space_id, object_id) DO UPDATE SET
            object_type = excluded.object_type,
            version = excluded.version,
            head_id = excluded.head_id,
            timestamp = excluded.timestamp,
            owner_key = excluded.owner_key,
            fields_json = excluded.fields_json
        "#,
    )
    .bind(space_id)
    .bind(&state.object_id)
    .bind(&state.object_type)
    .bind(state.version)
    .bind(state.head_id.clone())
    .bind(state.timestamp as i64)
    .bind(state.owner_key.clone())
    .bind(fields_json)
    .execute(pool)
    .await?;
    Ok(())
}

fn row_to_state(row: &sqlx::sqlite::SqliteRow) -> Result<ObjectState, DbError> {
    let fields_json: String = row.get("fields_json");
    let fields: BTreeMap<String, Value> =
        serde_json::from_str(&fields_json).map_err(|e| DbError::Malformed(e.to_string()))?;
    Ok(ObjectState {
        object_id: row.get("object_id"),
        object_type: row.get("object_type"),
        fields,
        version: row.get::<i64, _>("version") as u32,
        head_id: row.get("head_id"),
        timestamp: row.get::<i64, _>("timestamp") as u64,
        owner_key: row.get("owner_key"),
    })
}

pub async fn get_object(pool: &SqlitePool, space_id: &str, object_id: &str) -> Result<Option<ObjectState>, DbError> {
    let row = sqlx::query("SELECT * FROM objects WHERE space_id = ? AND object_id = ?")
        .bind(space_id)
        .bind(object_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(row_to_state).transpose()
}

pub async fn list_objects_by_type(
    pool: &SqlitePool,
    space_id: &str,
    object_type: &str,
) -> Result<Vec<ObjectState>, DbError> {
    let rows = sqlx::query("SELECT * FROM objects WHERE space_id = ? AND object_type = ? ORDER BY timestamp ASC")
        .bind(space_id)
        .bind(object_type)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_state).collect()
}

pub async fn record_tree_index(
    pool: &SqlitePool,
    space_id: &str,
    tree_id: &str,
    change_type: &str,
    object_id: &str,
    object_type: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO tree_index (space_id, tree_id, change_type, object_id, object_type)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(space_id, tree_id) DO UPDATE SET
            change_type = excluded.change_type,
            object_id = excluded.object_id,
            object_type = excluded.object_type
        "#,
    )
    .bind(space_id)
    .bind(tree_id)
    .bind(change_type)
    .bind(object_id)
    .bind(object_type)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn save_sync_status(pool: &SqlitePool, space_id: &str, status: &SyncStatus) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO sync_status (space_id, trees_changed_locally, heads_received, heads_applied)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(space_id) DO UPDATE SET
            trees_changed_locally = excluded.trees_changed_locally,
            heads_received = excluded.heads_received,
            heads_applied = excluded.heads_applied
        "#,
    )
    .bind(space_id)
    .bind(status.trees_changed_locally as i64)
    .bind(status.heads_received as i64)
    .bind(status.heads_applied as i64)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(id: &str, ty: &str) -> ObjectState {
        ObjectState {
            object_id: id.to_string(),
            object_type: ty.to_string(),
            fields: [("title".to_string(), json!("hello"))].into_iter().collect(),
            version: 1,
            head_id: "head1".into(),
            timestamp: 1,
            owner_key: "owner1".into(),
        }
    }

    #[tokio::test]
    async fn upsert_then_get_roundtrips() {
        let pool = open_in_memory().await.unwrap();
        upsert_object(&pool, "space1", &state("obj1", "note")).await.unwrap();

        let fetched = get_object(&pool, "space1", "obj1").await.unwrap().unwrap();
        assert_eq!(fetched.fields.get("title"), Some(&json!("hello")));
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_object_id() {
        let pool = open_in_memory().await.unwrap();
        upsert_object(&pool, "space1", &state("obj1", "note")).await.unwrap();
        let mut updated = state("obj1", "note");
        updated.version = 2;
        updated.fields.insert("title".to_string(), json!("updated"));
        upsert_object(&pool, "space1", &updated).await.unwrap();

        let rows = list_objects_by_type(&pool, "space1", "note").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 2);
    }

    #[tokio::test]
    async fn sync_status_roundtrips() {
        let pool = open_in_memory().await.unwrap();
        let status = SyncStatus { trees_changed_locally: 3, heads_received: 5, heads_applied: 4 };
        save_sync_status(&pool, "space1", &status).await.unwrap();

        let row = sqlx::query("SELECT * FROM sync_status WHERE space_id = ?")
            .bind("space1")
            .fetch_one(&pool)
            .await
            .unwrap();
        let applied: i64 = row.get("heads_applied");
        assert_eq!(applied, 4);
    }
}
