use async_trait::async_trait;
use chrono::{DateTime, Utc};
use presence_core::EncodedDescriptor;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("invalid timestamp in {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },
}

/// A user's registration row. At most one descriptor per user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub user_id: String,
    pub display_name: Option<String>,
    pub face_descriptor: Option<EncodedDescriptor>,
    pub updated_at: DateTime<Utc>,
}

/// Attendance event to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttendance {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    pub recorded_at: DateTime<Utc>,
}

/// Persistence for profiles and attendance.
///
/// Attendance is append-only: there is deliberately no update or delete.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn read_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError>;

    /// Insert or replace the descriptor and display name for `user_id`.
    async fn upsert_profile(
        &self,
        user_id: &str,
        descriptor: &EncodedDescriptor,
        display_name: &str,
    ) -> Result<Profile, StoreError>;

    async fn insert_attendance(&self, record: NewAttendance) -> Result<AttendanceRecord, StoreError>;

    /// Most recent first.
    async fn list_attendance(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;
}

/// SQLite-backed [`RecordStore`].
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Err(e) = ensure_parent_dir(db_path) {
            tracing::warn!(
                path = %db_path.display(),
                error = %e,
                "failed to create database directory"
            );
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS profiles (
                     user_id TEXT PRIMARY KEY,
                     display_name TEXT,
                     face_descriptor TEXT,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS attendance_records (
                     id TEXT PRIMARY KEY,
                     user_id TEXT NOT NULL,
                     display_name TEXT NOT NULL,
                     recorded_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_attendance_user
                     ON attendance_records(user_id, recorded_at);",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), "record store opened");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn read_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        let user_id = user_id.to_string();

        let row: Option<(String, Option<String>, Option<String>, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, display_name, face_descriptor, updated_at
                     FROM profiles WHERE user_id = ?1",
                )?;
                let mut rows = stmt.query_map(rusqlite::params![user_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await?;

        row.map(|(user_id, display_name, descriptor, updated_at)| {
            Ok(Profile {
                user_id,
                display_name,
                face_descriptor: descriptor.map(EncodedDescriptor::from),
                updated_at: parse_timestamp("updated_at", &updated_at)?,
            })
        })
        .transpose()
    }

    async fn upsert_profile(
        &self,
        user_id: &str,
        descriptor: &EncodedDescriptor,
        display_name: &str,
    ) -> Result<Profile, StoreError> {
        let profile = Profile {
            user_id: user_id.to_string(),
            display_name: Some(display_name.to_string()),
            face_descriptor: Some(descriptor.clone()),
            updated_at: Utc::now(),
        };

        let user_id = profile.user_id.clone();
        let name = display_name.to_string();
        let encoded = descriptor.as_str().to_string();
        let updated_at = profile.updated_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO profiles (user_id, display_name, face_descriptor, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user_id) DO UPDATE SET
                         display_name = excluded.display_name,
                         face_descriptor = excluded.face_descriptor,
                         updated_at = excluded.updated_at",
                    rusqlite::params![user_id, name, encoded, updated_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(user = %profile.user_id, "profile descriptor stored");
        Ok(profile)
    }

    async fn insert_attendance(&self, record: NewAttendance) -> Result<AttendanceRecord, StoreError> {
        let stored = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: record.user_id,
            display_name: record.display_name,
            recorded_at: Utc::now(),
        };

        let row = (
            stored.id.clone(),
            stored.user_id.clone(),
            stored.display_name.clone(),
            stored.recorded_at.to_rfc3339(),
        );

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance_records (id, user_id, display_name, recorded_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![row.0, row.1, row.2, row.3],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(user = %stored.user_id, id = %stored.id, "attendance recorded");
        Ok(stored)
    }

    async fn list_attendance(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let user_id = user_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<(String, String, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, display_name, recorded_at
                     FROM attendance_records
                     WHERE user_id = ?1
                     ORDER BY recorded_at DESC, rowid DESC
                     LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![user_id, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, user_id, display_name, recorded_at)| {
                Ok(AttendanceRecord {
                    id,
                    user_id,
                    display_name,
                    recorded_at: parse_timestamp("recorded_at", &recorded_at)?,
                })
            })
            .collect()
    }
}

/// Create the directory holding `db_path`. A no-op for in-memory databases.
fn ensure_parent_dir(db_path: &Path) -> std::io::Result<()> {
    if db_path == Path::new(":memory:") {
        return Ok(());
    }
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn parse_timestamp(column: &'static str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidTimestamp {
            column,
            value: value.to_string(),
        })
}
