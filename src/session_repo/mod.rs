// SQLite session artifact: one row per session, per series and per sample.
// Uses sqlx for async + connection pooling. Scalars are stored as their f64 bit pattern
// in an INTEGER column (REAL affinity turns -0.0 into 0); thread records as BLOBs
// (wincode) with a version prefix, see blob.rs. Host facts (core count, GPU inventory)
// live on the session row.
// Samples keep their append order through the AUTOINCREMENT id.

mod blob;
pub mod writer;

use crate::models::{
    GpuDevice, HostInfo, MetricKind, ProcessEntry, Sample, SeriesDescriptor, SeriesId,
    SessionInfo, SessionStatus, ThreadEntry, Value,
};
use crate::session::Session;
use crate::store::{StoreConfig, TimeSeriesStore};
use futures_util::TryStreamExt;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::instrument;

pub struct SessionRepo {
    pool: SqlitePool,
}

impl SessionRepo {
    /// Connect to SQLite at `path`, create parent dir and DB if missing, enable WAL + pragmas.
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new().connect_with(opts).await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                target_pid INTEGER NOT NULL,
                interval_ms INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                cpu_cores INTEGER NOT NULL DEFAULT 0,
                gpus BLOB,
                status TEXT NOT NULL,
                detail TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS series (
                session_id INTEGER NOT NULL,
                ordinal INTEGER NOT NULL,
                name TEXT NOT NULL,
                unit TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (session_id, ordinal)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                ordinal INTEGER NOT NULL,
                ts INTEGER NOT NULL,
                scalar_bits INTEGER,
                record BLOB
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_session ON samples(session_id, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts a running session and its series (ordinal = position in `series`).
    #[instrument(skip(self, host, series), fields(repo = "session", operation = "create_session", series_count = series.len()))]
    pub async fn create_session(
        &self,
        target_pid: u32,
        interval_ms: u64,
        started_at: i64,
        host: &HostInfo,
        series: &[SeriesDescriptor],
    ) -> anyhow::Result<i64> {
        let gpus = blob::with_version_prefix(
            blob::BLOB_VERSION_GPUS,
            wincode::serialize(&host.gpus).map_err(|e| anyhow::anyhow!("wincode: {}", e))?,
        );
        let mut tx = self.pool.begin().await?;
        let (status, detail) = SessionStatus::Running.to_columns();
        let id = sqlx::query(
            "INSERT INTO session (target_pid, interval_ms, started_at, cpu_cores, gpus, status, detail) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(target_pid as i64)
        .bind(interval_ms as i64)
        .bind(started_at)
        .bind(host.cpu_cores as i64)
        .bind(gpus)
        .bind(status)
        .bind(detail)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for (ordinal, d) in series.iter().enumerate() {
            sqlx::query(
                "INSERT INTO series (session_id, ordinal, name, unit, kind) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(id)
            .bind(ordinal as i64)
            .bind(&d.name)
            .bind(&d.unit)
            .bind(d.kind.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    #[instrument(skip(self, samples), fields(repo = "session", operation = "save_samples", samples_count = samples.len()))]
    pub async fn save_samples(
        &self,
        session_id: i64,
        samples: &[(SeriesId, Sample)],
    ) -> anyhow::Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (series, sample) in samples {
            let (scalar, record) = match &sample.value {
                Value::Scalar(v) => (Some(v.to_bits() as i64), None),
                Value::Threads(threads) => (
                    None,
                    Some(blob::with_version_prefix(
                        blob::BLOB_VERSION_THREADS,
                        wincode::serialize(threads)
                            .map_err(|e| anyhow::anyhow!("wincode: {}", e))?,
                    )),
                ),
                Value::Processes(processes) => (
                    None,
                    Some(blob::with_version_prefix(
                        blob::BLOB_VERSION_PROCESSES,
                        wincode::serialize(processes)
                            .map_err(|e| anyhow::anyhow!("wincode: {}", e))?,
                    )),
                ),
            };
            sqlx::query(
                "INSERT INTO samples (session_id, ordinal, ts, scalar_bits, record) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(session_id)
            .bind(series.0 as i64)
            .bind(sample.timestamp as i64)
            .bind(scalar)
            .bind(record)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "session", operation = "finish_session"))]
    pub async fn finish_session(
        &self,
        session_id: i64,
        status: &SessionStatus,
        ended_at: i64,
    ) -> anyhow::Result<()> {
        let (status, detail) = status.to_columns();
        sqlx::query("UPDATE session SET status = $1, detail = $2, ended_at = $3 WHERE id = $4")
            .bind(status)
            .bind(detail)
            .bind(ended_at)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All stored sessions, oldest first.
    pub async fn list_sessions(&self) -> anyhow::Result<Vec<SessionInfo>> {
        let rows = sqlx::query(
            "SELECT id, target_pid, interval_ms, started_at, cpu_cores, gpus, status, detail FROM session ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::parse_session_row).collect()
    }

    pub async fn get_session(&self, session_id: i64) -> anyhow::Result<Option<SessionInfo>> {
        let row = sqlx::query(
            "SELECT id, target_pid, interval_ms, started_at, cpu_cores, gpus, status, detail FROM session WHERE id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::parse_session_row).transpose()
    }

    /// Series descriptors in ordinal order.
    pub async fn load_series(&self, session_id: i64) -> anyhow::Result<Vec<SeriesDescriptor>> {
        let rows = sqlx::query(
            "SELECT name, unit, kind FROM series WHERE session_id = $1 ORDER BY ordinal ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let kind = MetricKind::parse(&kind)
                .ok_or_else(|| anyhow::anyhow!("unknown metric kind {:?}", kind))?;
            out.push(SeriesDescriptor {
                name: row.try_get("name")?,
                unit: row.try_get("unit")?,
                kind,
            });
        }
        Ok(out)
    }

    /// Rebuilds a finalized (or in-progress) session: same series order, every sample,
    /// aggregate ladders rebuilt by replaying appends.
    #[instrument(skip(self, config), fields(repo = "session", operation = "load_session"))]
    pub async fn load_session(
        &self,
        session_id: i64,
        config: StoreConfig,
    ) -> anyhow::Result<Session> {
        let info = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {} not found", session_id))?;
        let store = TimeSeriesStore::with_series(config, self.load_series(session_id).await?);

        let mut rows = sqlx::query(
            "SELECT ordinal, ts, scalar_bits, record FROM samples WHERE session_id = $1 ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let ordinal: i64 = row.try_get("ordinal")?;
            let sample = Self::parse_sample_row(&row)?;
            store.append(SeriesId(ordinal as u32), sample)?;
        }
        drop(rows);

        Ok(Session::new(info, Arc::new(store)))
    }

    /// Removes a session and everything recorded for it.
    #[instrument(skip(self), fields(repo = "session", operation = "delete_session"))]
    pub async fn delete_session(&self, session_id: i64) -> anyhow::Result<u64> {
        let mut tx = self.pool.begin().await?;
        let r = sqlx::query("DELETE FROM samples WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM series WHERE session_id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM session WHERE id = $1")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(r.rows_affected())
    }

    fn parse_session_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<SessionInfo> {
        let status: String = row.try_get("status")?;
        let detail: Option<String> = row.try_get("detail")?;
        let gpus: Option<Vec<u8>> = row.try_get("gpus")?;
        let gpus = match gpus.as_deref().map(blob::split_version) {
            None => Vec::new(),
            Some((blob::BLOB_VERSION_GPUS, payload)) => {
                let devices: Vec<GpuDevice> = wincode::deserialize(payload)
                    .map_err(|e| anyhow::anyhow!("wincode deserialize gpus: {}", e))?;
                devices
            }
            Some((version, _)) => anyhow::bail!("unsupported gpus blob version {}", version),
        };
        Ok(SessionInfo {
            id: row.try_get("id")?,
            target_pid: row.try_get::<i64, _>("target_pid")? as u32,
            interval_ms: row.try_get::<i64, _>("interval_ms")? as u64,
            started_at: row.try_get("started_at")?,
            host: HostInfo {
                cpu_cores: row.try_get::<i64, _>("cpu_cores")? as u32,
                gpus,
            },
            status: SessionStatus::from_columns(&status, detail.as_deref()),
        })
    }

    fn parse_sample_row(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Sample> {
        let ts: i64 = row.try_get("ts")?;
        let scalar_bits: Option<i64> = row.try_get("scalar_bits")?;
        let record: Option<Vec<u8>> = row.try_get("record")?;
        let value = match (scalar_bits, record) {
            (_, Some(bytes)) => match blob::split_version(&bytes) {
                (blob::BLOB_VERSION_THREADS, payload) => {
                    let threads: Vec<ThreadEntry> = wincode::deserialize(payload)
                        .map_err(|e| anyhow::anyhow!("wincode deserialize threads: {}", e))?;
                    Value::Threads(threads)
                }
                (blob::BLOB_VERSION_PROCESSES, payload) => {
                    let processes: Vec<ProcessEntry> = wincode::deserialize(payload)
                        .map_err(|e| anyhow::anyhow!("wincode deserialize processes: {}", e))?;
                    Value::Processes(processes)
                }
                (version, _) => anyhow::bail!("unsupported record blob version {}", version),
            },
            (Some(bits), None) => Value::Scalar(f64::from_bits(bits as u64)),
            (None, None) => anyhow::bail!("sample row without a value"),
        };
        Ok(Sample {
            timestamp: ts as u64,
            value,
        })
    }
}
