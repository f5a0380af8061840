/// Durable record of storage sessions and the namespaces they created
///
/// Every storage manager writes its session and each namespace it is about to create
/// into a small SQLite database before issuing the DDL. A session that ends cleanly is
/// stamped with `closed_at`. At startup, every namespace of a session that never got
/// that stamp is a leftover of a crash and can be dropped without guessing from names.

use crate::error::StorageResult;
use crate::model::DataModel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::Row;
use std::path::Path;
use uuid::Uuid;

/// File name of the manifest inside the data directory
pub const MANIFEST_FILE: &str = "sessions.db";

/// A session as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// A namespace created on behalf of a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NamespaceRecord {
    pub session_id: Uuid,
    pub name: String,
    pub data_model: DataModel,
}

#[derive(Debug, Clone)]
pub struct SessionManifest {
    pool: SqlitePool,
}

impl SessionManifest {
    /// Open (or create) the manifest database at `path` and make sure its schema exists
    pub async fn open(path: &Path) -> StorageResult<Self> {
        tracing::info!("🗄️ Opening session manifest: {}", path.display());
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let manifest = Self { pool };
        manifest.init_schema().await?;
        Ok(manifest)
    }

    /// Open `sessions.db` inside a data directory, creating the directory if needed
    pub async fn open_in(data_dir: &Path) -> StorageResult<Self> {
        if let Err(e) = std::fs::create_dir_all(data_dir) {
            return Err(sqlx::Error::Io(e).into());
        }
        Self::open(&data_dir.join(MANIFEST_FILE)).await
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Safe to call multiple times
    pub async fn init_schema(&self) -> StorageResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS namespaces (
                session_id TEXT NOT NULL,
                name TEXT NOT NULL,
                data_model TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_open
            ON sessions(closed_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_session(&self, session_id: &Uuid) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, created_at, closed_at)
            VALUES (?, ?, NULL)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(session_id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_namespace(&self, session_id: &Uuid, name: &str, data_model: DataModel) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO namespaces (session_id, name, data_model, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, name) DO NOTHING
            "#,
        )
        .bind(session_id.to_string())
        .bind(name)
        .bind(model_to_str(data_model))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stamp `closed_at`; a session is only marked once
    pub async fn mark_closed(&self, session_id: &Uuid) -> StorageResult<()> {
        sqlx::query("UPDATE sessions SET closed_at = ? WHERE id = ? AND closed_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn session(&self, session_id: &Uuid) -> StorageResult<Option<SessionRecord>> {
        let row = sqlx::query("SELECT id, created_at, closed_at FROM sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| session_from_row(&row)).transpose()
    }

    /// Newest first
    pub async fn sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT id, created_at, closed_at FROM sessions ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Sessions that never reached `closed_at`
    pub async fn unclosed_sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT id, created_at, closed_at FROM sessions WHERE closed_at IS NULL ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    /// Namespaces in creation order
    pub async fn namespaces(&self, session_id: &Uuid) -> StorageResult<Vec<NamespaceRecord>> {
        let rows = sqlx::query(
            "SELECT session_id, name, data_model FROM namespaces WHERE session_id = ? ORDER BY created_at, name",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut namespaces = Vec::with_capacity(rows.len());
        for row in rows {
            let model: String = row.try_get("data_model")?;
            namespaces.push(NamespaceRecord {
                session_id: parse_uuid(&row.try_get::<String, _>("session_id")?)?,
                name: row.try_get("name")?,
                data_model: model_from_str(&model)?,
            });
        }
        Ok(namespaces)
    }
}

fn model_to_str(model: DataModel) -> &'static str {
    match model {
        DataModel::Relational => "relational",
        DataModel::Document => "document",
        DataModel::Graph => "graph",
    }
}

fn model_from_str(model: &str) -> Result<DataModel, sqlx::Error> {
    match model {
        "relational" => Ok(DataModel::Relational),
        "document" => Ok(DataModel::Document),
        "graph" => Ok(DataModel::Graph),
        other => Err(decode_error(format!("unknown data model '{}'", other))),
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(value).map_err(|e| decode_error(format!("invalid session id '{}': {}", value, e)))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| decode_error(format!("invalid timestamp '{}': {}", value, e)))
}

fn decode_error(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

fn session_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<SessionRecord> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let closed_at: Option<String> = row.try_get("closed_at")?;
    Ok(SessionRecord {
        id: parse_uuid(&id)?,
        created_at: parse_time(&created_at)?,
        closed_at: closed_at.as_deref().map(parse_time).transpose()?,
    })
}
