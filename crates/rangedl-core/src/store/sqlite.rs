//! SQLite-based persistence for transfers and segments
//!
//! Segment rows reference their transfer with `ON DELETE CASCADE`, so a
//! worker that outlives a delete cannot resurrect orphaned rows.

use super::TransferStore;
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rangedl_types::{Segment, SegmentStatus, Settings, Transfer, TransferStats, TransferStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS transfers (
        id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        url TEXT NOT NULL,
        file_name TEXT NOT NULL,
        save_dir TEXT,
        total_size INTEGER,
        received INTEGER NOT NULL DEFAULT 0,
        range_supported INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        finished_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS segments (
        transfer_id TEXT NOT NULL REFERENCES transfers(id) ON DELETE CASCADE,
        segment_index INTEGER NOT NULL,
        start_byte INTEGER NOT NULL,
        end_byte INTEGER,
        received INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        PRIMARY KEY (transfer_id, segment_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        owner TEXT PRIMARY KEY,
        default_segments INTEGER NOT NULL,
        global_speed_limit_bps INTEGER NOT NULL,
        default_save_dir TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stats (
        transfer_id TEXT PRIMARY KEY REFERENCES transfers(id) ON DELETE CASCADE,
        avg_speed_bps REAL NOT NULL DEFAULT 0,
        max_speed_bps REAL NOT NULL DEFAULT 0,
        retries INTEGER NOT NULL DEFAULT 0,
        last_started_at TEXT,
        last_finished_at TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status)",
    "CREATE INDEX IF NOT EXISTS idx_transfers_owner ON transfers(owner)",
];

/// Database connection pool for transfer persistence
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file at `db_path`
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. One connection, so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl TransferStore for SqliteStore {
    async fn find_transfer(&self, id: Uuid) -> Result<Option<Transfer>> {
        let row = sqlx::query("SELECT * FROM transfers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_transfer).transpose()
    }

    async fn transfers_by_owner(&self, owner: Uuid) -> Result<Vec<Transfer>> {
        sqlx::query("SELECT * FROM transfers WHERE owner = ? ORDER BY created_at")
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(row_to_transfer)
            .collect()
    }

    async fn transfers_with_status(&self, status: TransferStatus) -> Result<Vec<Transfer>> {
        sqlx::query("SELECT * FROM transfers WHERE status = ? ORDER BY created_at")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(row_to_transfer)
            .collect()
    }

    async fn save_transfer(&self, transfer: &Transfer) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO transfers (
                id, owner, url, file_name, save_dir, total_size, received,
                range_supported, status, created_at, updated_at, finished_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                url = excluded.url,
                file_name = excluded.file_name,
                save_dir = excluded.save_dir,
                total_size = excluded.total_size,
                received = excluded.received,
                range_supported = excluded.range_supported,
                status = excluded.status,
                updated_at = excluded.updated_at,
                finished_at = excluded.finished_at
            "#,
        )
        .bind(transfer.id.to_string())
        .bind(transfer.owner.to_string())
        .bind(&transfer.url)
        .bind(&transfer.file_name)
        .bind(transfer.save_dir.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(transfer.total_size.map(|s| s as i64))
        .bind(transfer.received as i64)
        .bind(transfer.range_supported as i64)
        .bind(transfer.status.as_str())
        .bind(transfer.created_at.to_rfc3339())
        .bind(transfer.updated_at.to_rfc3339())
        .bind(transfer.finished_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_transfer(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM transfers WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_transfer_status(&self, id: Uuid, status: TransferStatus) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let finished = status.is_terminal().then(|| now.clone());
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET status = ?, updated_at = ?, finished_at = COALESCE(?, finished_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(finished)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_transfer_status_if(
        &self,
        id: Uuid,
        expected: TransferStatus,
        status: TransferStatus,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let finished = status.is_terminal().then(|| now.clone());
        let result = sqlx::query(
            r#"
            UPDATE transfers
            SET status = ?, updated_at = ?, finished_at = COALESCE(?, finished_at)
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(finished)
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_transfer_received(&self, id: Uuid, received: u64) -> Result<bool> {
        let result = sqlx::query("UPDATE transfers SET received = ?, updated_at = ? WHERE id = ?")
            .bind(received as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_transfer_target(&self, id: Uuid, file_name: &str, save_dir: &Path) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transfers SET file_name = ?, save_dir = ?, updated_at = ? WHERE id = ?",
        )
        .bind(file_name)
        .bind(save_dir.to_string_lossy().to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_transfer_probe(
        &self,
        id: Uuid,
        total_size: Option<u64>,
        range_supported: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE transfers SET total_size = ?, range_supported = ?, updated_at = ? WHERE id = ?",
        )
        .bind(total_size.map(|s| s as i64))
        .bind(range_supported as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn segments_for(&self, transfer_id: Uuid) -> Result<Vec<Segment>> {
        sqlx::query("SELECT * FROM segments WHERE transfer_id = ? ORDER BY segment_index")
            .bind(transfer_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(row_to_segment)
            .collect()
    }

    async fn find_segment(&self, transfer_id: Uuid, index: u32) -> Result<Option<Segment>> {
        let row = sqlx::query("SELECT * FROM segments WHERE transfer_id = ? AND segment_index = ?")
            .bind(transfer_id.to_string())
            .bind(index as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_segment).transpose()
    }

    async fn save_segment(&self, segment: &Segment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO segments (
                transfer_id, segment_index, start_byte, end_byte, received, status
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(transfer_id, segment_index) DO UPDATE SET
                start_byte = excluded.start_byte,
                end_byte = excluded.end_byte,
                received = excluded.received,
                status = excluded.status
            "#,
        )
        .bind(segment.transfer_id.to_string())
        .bind(segment.index as i64)
        .bind(segment.start as i64)
        .bind(segment.end.map(|e| e as i64))
        .bind(segment.received as i64)
        .bind(segment.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_segment(
        &self,
        transfer_id: Uuid,
        index: u32,
        received: u64,
        status: SegmentStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE segments
            SET received = ?, status = ?
            WHERE transfer_id = ? AND segment_index = ?
            "#,
        )
        .bind(received as i64)
        .bind(status.as_str())
        .bind(transfer_id.to_string())
        .bind(index as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_segments(&self, transfer_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM segments WHERE transfer_id = ?")
            .bind(transfer_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn settings_for(&self, owner: Uuid) -> Result<Settings> {
        let defaults = Settings::new(owner);
        sqlx::query(
            r#"
            INSERT INTO settings (owner, default_segments, global_speed_limit_bps, default_save_dir)
            VALUES (?, ?, ?, NULL)
            ON CONFLICT(owner) DO NOTHING
            "#,
        )
        .bind(owner.to_string())
        .bind(defaults.default_segments as i64)
        .bind(defaults.global_speed_limit_bps as i64)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM settings WHERE owner = ?")
            .bind(owner.to_string())
            .fetch_one(&self.pool)
            .await?;

        Ok(Settings {
            owner,
            default_segments: row.try_get::<i64, _>("default_segments")?.max(1) as u32,
            global_speed_limit_bps: row.try_get::<i64, _>("global_speed_limit_bps")?.max(0) as u64,
            default_save_dir: row
                .try_get::<Option<String>, _>("default_save_dir")?
                .map(PathBuf::from),
        })
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (owner, default_segments, global_speed_limit_bps, default_save_dir)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(owner) DO UPDATE SET
                default_segments = excluded.default_segments,
                global_speed_limit_bps = excluded.global_speed_limit_bps,
                default_save_dir = excluded.default_save_dir
            "#,
        )
        .bind(settings.owner.to_string())
        .bind(settings.default_segments as i64)
        .bind(settings.global_speed_limit_bps as i64)
        .bind(
            settings
                .default_save_dir
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_stats(&self, transfer_id: Uuid) -> Result<Option<TransferStats>> {
        let row = sqlx::query("SELECT * FROM stats WHERE transfer_id = ?")
            .bind(transfer_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(TransferStats {
            transfer_id,
            avg_speed_bps: row.try_get("avg_speed_bps")?,
            max_speed_bps: row.try_get("max_speed_bps")?,
            retries: row.try_get::<i64, _>("retries")? as u32,
            last_started_at: parse_optional_time(row.try_get("last_started_at")?),
            last_finished_at: parse_optional_time(row.try_get("last_finished_at")?),
        }))
    }

    async fn save_stats(&self, stats: &TransferStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stats (
                transfer_id, avg_speed_bps, max_speed_bps, retries, last_started_at, last_finished_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(transfer_id) DO UPDATE SET
                avg_speed_bps = excluded.avg_speed_bps,
                max_speed_bps = excluded.max_speed_bps,
                retries = excluded.retries,
                last_started_at = excluded.last_started_at,
                last_finished_at = excluded.last_finished_at
            "#,
        )
        .bind(stats.transfer_id.to_string())
        .bind(stats.avg_speed_bps)
        .bind(stats.max_speed_bps)
        .bind(stats.retries as i64)
        .bind(stats.last_started_at.map(|d| d.to_rfc3339()))
        .bind(stats.last_finished_at.map(|d| d.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_speed(&self, transfer_id: Uuid, avg: f64, peak: f64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE stats SET avg_speed_bps = ?, max_speed_bps = MAX(max_speed_bps, ?) WHERE transfer_id = ?",
        )
        .bind(avg)
        .bind(peak)
        .bind(transfer_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_stats(&self, transfer_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM stats WHERE transfer_id = ?")
            .bind(transfer_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| EngineError::Corrupt(format!("bad uuid {raw}: {e}")))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Corrupt(format!("bad timestamp {raw}: {e}")))
}

fn parse_optional_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert a database row to a Transfer
fn row_to_transfer(row: SqliteRow) -> Result<Transfer> {
    let status: String = row.try_get("status")?;
    let status = TransferStatus::parse(&status)
        .ok_or_else(|| EngineError::Corrupt(format!("unknown transfer status {status}")))?;

    Ok(Transfer {
        id: parse_uuid(row.try_get::<&str, _>("id")?)?,
        owner: parse_uuid(row.try_get::<&str, _>("owner")?)?,
        url: row.try_get("url")?,
        file_name: row.try_get("file_name")?,
        save_dir: row.try_get::<Option<String>, _>("save_dir")?.map(PathBuf::from),
        total_size: row.try_get::<Option<i64>, _>("total_size")?.map(|s| s as u64),
        received: row.try_get::<i64, _>("received")? as u64,
        range_supported: row.try_get::<i64, _>("range_supported")? != 0,
        status,
        created_at: parse_time(row.try_get::<&str, _>("created_at")?)?,
        updated_at: parse_time(row.try_get::<&str, _>("updated_at")?)?,
        finished_at: parse_optional_time(row.try_get("finished_at")?),
    })
}

/// Convert a database row to a Segment
fn row_to_segment(row: SqliteRow) -> Result<Segment> {
    let status: String = row.try_get("status")?;
    let status = SegmentStatus::parse(&status)
        .ok_or_else(|| EngineError::Corrupt(format!("unknown segment status {status}")))?;

    Ok(Segment {
        transfer_id: parse_uuid(row.try_get::<&str, _>("transfer_id")?)?,
        index: row.try_get::<i64, _>("segment_index")? as u32,
        start: row.try_get::<i64, _>("start_byte")? as u64,
        end: row.try_get::<Option<i64>, _>("end_byte")?.map(|e| e as u64),
        received: row.try_get::<i64, _>("received")? as u64,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_store_honours_contract() {
        let store = SqliteStore::in_memory().await.unwrap();
        super::super::contract::exercise(&store).await;
    }

    #[tokio::test]
    async fn open_creates_file_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rangedl.db");
        let mut transfer = Transfer::new(Uuid::nil(), "https://example.com/file".into());
        transfer.total_size = Some(10);

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.save_transfer(&transfer).await.unwrap();
            store
                .save_segment(&Segment::new(transfer.id, 0, 0, None))
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let loaded = store.find_transfer(transfer.id).await.unwrap().unwrap();
        assert_eq!(loaded.total_size, Some(10));
        let segments = store.segments_for(transfer.id).await.unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end, None);
    }
}
