//! Posting lifecycle store and run recorder backed by SQLite.
//!
//! The store is the single source of truth for which postings exist and in
//! which lifecycle state. Writes are serialized through one in-process lock
//! and each batch runs inside one transaction; readers use separate pooled
//! connections and see committed snapshots thanks to WAL journaling.

mod schema;

pub use schema::SCHEMA_SQL;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use jobwatch_core::{
    derive_status, Enrichment, JobHash, JobPosting, PostingCandidate, PostingStatus, RunStatus,
    RunSummary, UpsertOutcome,
};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-storage";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Primary result codes: PERM, READONLY, IOERR, CORRUPT, FULL, CANTOPEN, NOTADB.
const FATAL_SQLITE_CODES: [i64; 7] = [3, 8, 10, 11, 13, 14, 26];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    #[error("store transaction failed and was rolled back: {0}")]
    Transaction(#[source] sqlx::Error),
    #[error("unknown enrichment field `{0}`")]
    UnknownField(String),
    #[error("invalid value for enrichment field `{field}`: {reason}")]
    InvalidFieldValue { field: String, reason: String },
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("creating database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Connection-level failures and SQLite codes that no retry can fix are
    /// fatal for the caller; everything else happened inside a statement and
    /// left the store unchanged.
    fn from_sqlx(err: sqlx::Error) -> Self {
        let fatal = match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Configuration(_)
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .is_some_and(|code| FATAL_SQLITE_CODES.contains(&(code & 0xff))),
            _ => false,
        };
        if fatal {
            StoreError::Unavailable(err)
        } else {
            StoreError::Transaction(err)
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Directory { .. })
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub new_to_active_days: i64,
    pub max_connections: u32,
    pub busy_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            new_to_active_days: 5,
            max_connections: 4,
            busy_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_new_to_active_days(mut self, days: i64) -> Self {
        self.new_to_active_days = days;
        self
    }
}

/// Read-side filter used by downstream collaborators.
#[derive(Debug, Clone, Default)]
pub struct PostingFilter {
    pub status: Option<PostingStatus>,
    pub company: Option<String>,
    pub seen_since: Option<NaiveDate>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Flag,
    Integer,
    Text,
}

/// Columns that enrichment collaborators may patch.
const ENRICHMENT_FIELDS: &[(&str, FieldKind)] = &[
    ("is_relevant", FieldKind::Flag),
    ("is_user_fit", FieldKind::Flag),
    ("seniority_estimate", FieldKind::Text),
    ("ai_comment", FieldKind::Text),
    ("score_total", FieldKind::Integer),
    ("fit_category", FieldKind::Text),
    ("processed_at", FieldKind::Text),
    ("last_reviewed", FieldKind::Text),
    ("reviewed_flag", FieldKind::Flag),
    ("tags", FieldKind::Text),
];

fn enrichment_kind(field: &str) -> Result<FieldKind, StoreError> {
    ENRICHMENT_FIELDS
        .iter()
        .find(|(column, _)| *column == field)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| StoreError::UnknownField(field.to_string()))
}

/// Converts command-line text into the JSON value `field` expects. An empty
/// string clears the field.
pub fn enrichment_value_from_text(field: &str, raw: &str) -> Result<JsonValue, StoreError> {
    let kind = enrichment_kind(field)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(JsonValue::Null);
    }
    let invalid = |reason: &str| StoreError::InvalidFieldValue {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    match kind {
        FieldKind::Text => Ok(JsonValue::String(raw.to_string())),
        FieldKind::Integer => raw
            .parse::<i64>()
            .map(JsonValue::from)
            .map_err(|_| invalid("expected an integer")),
        FieldKind::Flag => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(JsonValue::Bool(true)),
            "false" | "0" | "no" => Ok(JsonValue::Bool(false)),
            _ => Err(invalid("flags accept true/false, yes/no or 1/0")),
        },
    }
}

enum BoundValue {
    Null,
    Int(i64),
    Text(String),
}

fn bound_value(field: &str, kind: FieldKind, value: &JsonValue) -> Result<BoundValue, StoreError> {
    let invalid = |reason: &str| StoreError::InvalidFieldValue {
        field: field.to_string(),
        reason: reason.to_string(),
    };
    match (kind, value) {
        (_, JsonValue::Null) => Ok(BoundValue::Null),
        (FieldKind::Flag, JsonValue::Bool(b)) => Ok(BoundValue::Int(i64::from(*b))),
        (FieldKind::Flag, JsonValue::Number(n)) => match n.as_i64() {
            Some(v @ (0 | 1)) => Ok(BoundValue::Int(v)),
            _ => Err(invalid("flags accept true/false or 0/1")),
        },
        (FieldKind::Integer, JsonValue::Number(n)) => n
            .as_i64()
            .map(BoundValue::Int)
            .ok_or_else(|| invalid("expected an integer")),
        (FieldKind::Text, JsonValue::String(s)) => Ok(BoundValue::Text(s.clone())),
        (FieldKind::Text, JsonValue::Array(_) | JsonValue::Object(_)) => {
            Ok(BoundValue::Text(value.to_string()))
        }
        (FieldKind::Flag, _) => Err(invalid("expected a flag")),
        (FieldKind::Integer, _) => Err(invalid("expected an integer")),
        (FieldKind::Text, _) => Err(invalid("expected text")),
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("{column}={value:?}: {e}")))
}

fn parse_date(column: &str, value: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| StoreError::CorruptRow(format!("{column}={value:?}: {e}")))
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| StoreError::CorruptRow(format!("{name}: {e}")))
}

fn flag_col(row: &SqliteRow, name: &str) -> Result<Option<bool>, StoreError> {
    Ok(col::<Option<i64>>(row, name)?.map(|v| v != 0))
}

fn posting_from_row(row: &SqliteRow) -> Result<JobPosting, StoreError> {
    let status: String = col(row, "status")?;
    let status = PostingStatus::from_str(&status).map_err(StoreError::CorruptRow)?;
    let posted_date = col::<Option<String>>(row, "posted_date")?
        .map(|d| parse_date("posted_date", &d))
        .transpose()?;
    let updated_at = col::<Option<String>>(row, "updated_at")?
        .map(|ts| parse_timestamp("updated_at", &ts))
        .transpose()?;

    Ok(JobPosting {
        job_hash: JobHash::from_stored(col::<String>(row, "job_hash")?),
        site_name: col(row, "site_name")?,
        query_title: col(row, "query_title")?,
        query_location: col(row, "query_location")?,
        title: col(row, "title")?,
        company: col(row, "company")?,
        location: col(row, "location")?,
        posted_date,
        description_raw: col(row, "description_raw")?,
        description_normalized: col(row, "description_normalized")?,
        link: col(row, "link")?,
        work_mode: col(row, "work_mode")?,
        contract_type: col(row, "contract_type")?,
        salary_estimate: col(row, "salary_estimate")?,
        scraped_at: parse_timestamp("scraped_at", &col::<String>(row, "scraped_at")?)?,
        last_seen_on: parse_date("last_seen_on", &col::<String>(row, "last_seen_on")?)?,
        status,
        updated_at,
        enrichment: Enrichment {
            is_relevant: flag_col(row, "is_relevant")?,
            is_user_fit: flag_col(row, "is_user_fit")?,
            seniority_estimate: col(row, "seniority_estimate")?,
            ai_comment: col(row, "ai_comment")?,
            score_total: col(row, "score_total")?,
            fit_category: col(row, "fit_category")?,
            processed_at: col(row, "processed_at")?,
            last_reviewed: col(row, "last_reviewed")?,
            reviewed_flag: flag_col(row, "reviewed_flag")?,
            tags: col(row, "tags")?,
        },
    })
}

/// Keeps the last occurrence of every job hash, in first-appearance order.
fn collapse_duplicates(candidates: &[PostingCandidate]) -> (Vec<&PostingCandidate>, usize) {
    let mut slots: HashMap<&JobHash, usize> = HashMap::new();
    let mut batch: Vec<&PostingCandidate> = Vec::with_capacity(candidates.len());
    let mut collapsed = 0usize;
    for candidate in candidates {
        match slots.get(&candidate.job_hash) {
            Some(&idx) => {
                batch[idx] = candidate;
                collapsed += 1;
            }
            None => {
                slots.insert(&candidate.job_hash, batch.len());
                batch.push(candidate);
            }
        }
    }
    (batch, collapsed)
}

#[derive(Debug, Clone)]
pub struct LifecycleStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
    new_to_active_days: i64,
}

impl LifecycleStore {
    /// Opens (creating if needed) the database file and bootstraps the schema.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::Directory {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout);

        debug!(path = %config.database_path.display(), "connecting to posting store");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StoreError::Unavailable)?;

        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            new_to_active_days: config.new_to_active_days,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn new_to_active_days(&self) -> i64 {
        self.new_to_active_days
    }

    pub fn recorder(&self) -> RunRecorder {
        RunRecorder {
            pool: self.pool.clone(),
            write_lock: self.write_lock.clone(),
        }
    }

    /// Inserts unseen postings and re-sights known ones, all in one
    /// transaction.
    ///
    /// Known rows only get `last_seen_on` and `status` rewritten; identity,
    /// provenance and content columns keep their first-sighting values.
    pub async fn upsert_batch(
        &self,
        candidates: &[PostingCandidate],
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let (batch, collapsed) = collapse_duplicates(candidates);
        let mut outcome = UpsertOutcome {
            collapsed,
            ..UpsertOutcome::default()
        };
        if batch.is_empty() {
            return Ok(outcome);
        }

        let seen_on = seen_at.date_naive();
        let seen_on_text = seen_on.format(DATE_FORMAT).to_string();
        let scraped_at_text = format_timestamp(seen_at);

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(StoreError::from_sqlx)?;

        for candidate in batch {
            let existing = sqlx::query("SELECT scraped_at, status FROM job_postings WHERE job_hash = ?")
                .bind(candidate.job_hash.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(StoreError::from_sqlx)?;

            match existing {
                None => {
                    sqlx::query(
                        r#"
                        INSERT INTO job_postings (
                            job_hash, site_name, query_title, query_location, title, company,
                            location, posted_date, description_raw, description_normalized, link,
                            work_mode, contract_type, salary_estimate, scraped_at, last_seen_on,
                            status, reviewed_flag
                        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
                        "#,
                    )
                    .bind(candidate.job_hash.as_str())
                    .bind(&candidate.site_name)
                    .bind(&candidate.query_title)
                    .bind(&candidate.query_location)
                    .bind(&candidate.title)
                    .bind(&candidate.company)
                    .bind(&candidate.location)
                    .bind(candidate.posted_date.map(|d| d.format(DATE_FORMAT).to_string()))
                    .bind(&candidate.description_raw)
                    .bind(&candidate.description_normalized)
                    .bind(&candidate.link)
                    .bind(&candidate.work_mode)
                    .bind(&candidate.contract_type)
                    .bind(&candidate.salary_estimate)
                    .bind(&scraped_at_text)
                    .bind(&seen_on_text)
                    .bind(PostingStatus::New.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::from_sqlx)?;
                    outcome.inserted += 1;
                }
                Some(row) => {
                    let scraped_at = parse_timestamp("scraped_at", &col::<String>(&row, "scraped_at")?)?;
                    let previous: String = col(&row, "status")?;
                    let status = derive_status(scraped_at.date_naive(), seen_on, self.new_to_active_days);

                    sqlx::query(
                        "UPDATE job_postings SET last_seen_on = MAX(last_seen_on, ?), status = ? WHERE job_hash = ?",
                    )
                    .bind(&seen_on_text)
                    .bind(status.as_str())
                    .bind(candidate.job_hash.as_str())
                    .execute(&mut *tx)
                    .await
                    .map_err(StoreError::from_sqlx)?;

                    if previous == PostingStatus::Closed.as_str() {
                        debug!(job_hash = %candidate.job_hash, %status, "reopening closed posting");
                        outcome.reopened += 1;
                    }
                    outcome.updated += 1;
                }
            }
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        Ok(outcome)
    }

    /// Closes every open posting last seen before `today - staleness_window_days`.
    /// A negative window counts as zero; configuration rejects it earlier.
    pub async fn finalize_run(
        &self,
        staleness_window_days: i64,
        today: NaiveDate,
    ) -> Result<usize, StoreError> {
        let cutoff = today - chrono::Duration::days(staleness_window_days.max(0));
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE job_postings
            SET status = 'closed'
            WHERE status IN ('new', 'active')
              AND last_seen_on < ?
            "#,
        )
        .bind(cutoff.format(DATE_FORMAT).to_string())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        let closed = result.rows_affected() as usize;
        info!(%cutoff, closed, "finalized posting lifecycle");
        Ok(closed)
    }

    /// Partial update of enrichment columns. Returns whether the posting
    /// exists. An empty map is a no-op.
    pub async fn patch_fields(
        &self,
        job_hash: &JobHash,
        fields: &BTreeMap<String, JsonValue>,
    ) -> Result<bool, StoreError> {
        if fields.is_empty() {
            return Ok(false);
        }

        let mut assignments = Vec::with_capacity(fields.len());
        let mut values = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let kind = enrichment_kind(name)?;
            assignments.push(format!("{name} = ?"));
            values.push(bound_value(name, kind, value)?);
        }

        let sql = format!(
            "UPDATE job_postings SET {}, updated_at = ? WHERE job_hash = ?",
            assignments.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for value in values {
            query = match value {
                BoundValue::Null => query.bind(None::<String>),
                BoundValue::Int(v) => query.bind(v),
                BoundValue::Text(v) => query.bind(v),
            };
        }

        let _guard = self.write_lock.lock().await;
        let result = query
            .bind(format_timestamp(Utc::now()))
            .bind(job_hash.as_str())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_posting(&self, job_hash: &JobHash) -> Result<Option<JobPosting>, StoreError> {
        let row = sqlx::query("SELECT * FROM job_postings WHERE job_hash = ?")
            .bind(job_hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        row.as_ref().map(posting_from_row).transpose()
    }

    pub async fn list_postings(&self, filter: &PostingFilter) -> Result<Vec<JobPosting>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM job_postings WHERE 1 = 1");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(company) = &filter.company {
            qb.push(" AND company = ")
                .push_bind(company.clone())
                .push(" COLLATE NOCASE");
        }
        if let Some(since) = filter.seen_since {
            qb.push(" AND last_seen_on >= ")
                .push_bind(since.format(DATE_FORMAT).to_string());
        }
        qb.push(" ORDER BY scraped_at DESC, job_hash ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        rows.iter().map(posting_from_row).collect()
    }

    pub async fn count_postings(&self) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM job_postings")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(count as usize)
    }

    pub async fn count_by_status(&self) -> Result<Vec<(PostingStatus, usize)>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job_postings GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::from_sqlx)?;
        rows.into_iter()
            .map(|(status, count)| {
                PostingStatus::from_str(&status)
                    .map(|s| (s, count as usize))
                    .map_err(StoreError::CorruptRow)
            })
            .collect()
    }
}

/// Append-only writer for the `run_log` table.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl RunRecorder {
    pub async fn record(&self, summary: &RunSummary) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO run_log (
                run_id, started_at, finished_at, status, duration_total_ms, duration_scrape_ms,
                duration_finalize_ms, tuples_planned, tuples_completed, rows_received,
                rows_dropped, new_postings, updated_postings, reopened_postings,
                closed_postings, total_postings, source_timeouts, source_errors, failed_flushes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(summary.run_id.to_string())
        .bind(format_timestamp(summary.started_at))
        .bind(format_timestamp(summary.finished_at))
        .bind(summary.status.as_str())
        .bind(summary.duration_total_ms as i64)
        .bind(summary.duration_scrape_ms as i64)
        .bind(summary.duration_finalize_ms as i64)
        .bind(summary.tuples_planned as i64)
        .bind(summary.tuples_completed as i64)
        .bind(summary.rows_received as i64)
        .bind(summary.rows_dropped as i64)
        .bind(summary.new_postings as i64)
        .bind(summary.updated_postings as i64)
        .bind(summary.reopened_postings as i64)
        .bind(summary.closed_postings as i64)
        .bind(summary.total_postings as i64)
        .bind(summary.source_timeouts as i64)
        .bind(summary.source_errors as i64)
        .bind(summary.failed_flushes as i64)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;

        info!(run_id = %summary.run_id, status = summary.status.as_str(), "recorded run summary");
        Ok(())
    }

    pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query("SELECT * FROM run_log ORDER BY started_at DESC, run_id ASC LIMIT ?")
            .bind(limit.max(1) as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        rows.iter().map(run_from_row).collect()
    }
}

fn count_col(row: &SqliteRow, name: &str) -> Result<usize, StoreError> {
    Ok(col::<i64>(row, name)?.max(0) as usize)
}

fn run_from_row(row: &SqliteRow) -> Result<RunSummary, StoreError> {
    let run_id: String = col(row, "run_id")?;
    let status: String = col(row, "status")?;
    Ok(RunSummary {
        run_id: Uuid::parse_str(&run_id).map_err(|e| StoreError::CorruptRow(format!("run_id: {e}")))?,
        started_at: parse_timestamp("started_at", &col::<String>(row, "started_at")?)?,
        finished_at: parse_timestamp("finished_at", &col::<String>(row, "finished_at")?)?,
        status: RunStatus::from_str(&status).map_err(StoreError::CorruptRow)?,
        duration_total_ms: count_col(row, "duration_total_ms")? as u64,
        duration_scrape_ms: count_col(row, "duration_scrape_ms")? as u64,
        duration_finalize_ms: count_col(row, "duration_finalize_ms")? as u64,
        tuples_planned: count_col(row, "tuples_planned")?,
        tuples_completed: count_col(row, "tuples_completed")?,
        rows_received: count_col(row, "rows_received")?,
        rows_dropped: count_col(row, "rows_dropped")?,
        new_postings: count_col(row, "new_postings")?,
        updated_postings: count_col(row, "updated_postings")?,
        reopened_postings: count_col(row, "reopened_postings")?,
        closed_postings: count_col(row, "closed_postings")?,
        total_postings: count_col(row, "total_postings")?,
        source_timeouts: count_col(row, "source_timeouts")?,
        source_errors: count_col(row, "source_errors")?,
        failed_flushes: count_col(row, "failed_flushes")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobwatch_core::job_hash_for_link;
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    async fn open_store() -> (TempDir, LifecycleStore) {
        let dir = tempdir().expect("tempdir");
        let store = LifecycleStore::connect(&StoreConfig::new(dir.path().join("db/jobwatch.db")))
            .await
            .expect("connect");
        (dir, store)
    }

    fn day(n: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap() + chrono::Duration::days(n as i64)
    }

    fn candidate(link: &str, title: &str) -> PostingCandidate {
        PostingCandidate {
            job_hash: job_hash_for_link(link),
            link: link.to_string(),
            site_name: "linkedin".into(),
            query_title: "Buyer Senior".into(),
            query_location: "Monterrey, Mexico".into(),
            title: title.to_string(),
            company: Some("Acme".into()),
            location: Some("Monterrey".into()),
            posted_date: NaiveDate::from_ymd_opt(2026, 2, 27),
            description_raw: "<p>Buy things</p>".into(),
            description_normalized: "Buy things".into(),
            work_mode: Some("not remote".into()),
            contract_type: None,
            salary_estimate: None,
        }
    }

    async fn fetch(store: &LifecycleStore, link: &str) -> JobPosting {
        store
            .get_posting(&job_hash_for_link(link))
            .await
            .expect("get")
            .expect("posting exists")
    }

    const A: &str = "https://www.linkedin.com/jobs/view/100";
    const B: &str = "https://www.linkedin.com/jobs/view/200";
    const C: &str = "https://mx.indeed.com/viewjob?jk=300";

    #[tokio::test]
    async fn first_sighting_inserts_new_rows() {
        let (_dir, store) = open_store().await;
        let outcome = store
            .upsert_batch(&[candidate(A, "Buyer"), candidate(B, "Senior Buyer")], day(0))
            .await
            .expect("upsert");

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.updated, 0);
        let a = fetch(&store, A).await;
        assert_eq!(a.status, PostingStatus::New);
        assert_eq!(a.scraped_at, day(0));
        assert_eq!(a.last_seen_on, day(0).date_naive());
        assert_eq!(a.enrichment.reviewed_flag, Some(false));
    }

    #[tokio::test]
    async fn resighting_keeps_content_and_advances_last_seen() {
        let (_dir, store) = open_store().await;
        store.upsert_batch(&[candidate(A, "Buyer")], day(0)).await.expect("first");
        let before = fetch(&store, A).await;

        let mut mutated = candidate(A, "Buyer (edited by source)");
        mutated.company = Some("Other Corp".into());
        mutated.description_raw = "changed".into();
        let outcome = store.upsert_batch(&[mutated], day(2)).await.expect("second");

        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 1);
        assert_eq!(store.count_postings().await.expect("count"), 1);
        let after = fetch(&store, A).await;
        assert_eq!(after.title, before.title);
        assert_eq!(after.company, before.company);
        assert_eq!(after.description_raw, before.description_raw);
        assert_eq!(after.scraped_at, before.scraped_at);
        assert_eq!(after.last_seen_on, day(2).date_naive());
        assert_eq!(after.status, PostingStatus::New);
    }

    #[tokio::test]
    async fn duplicates_within_a_batch_resolve_last_write_wins() {
        let (_dir, store) = open_store().await;
        let outcome = store
            .upsert_batch(
                &[candidate(A, "first"), candidate(B, "other"), candidate(A, "last")],
                day(0),
            )
            .await
            .expect("upsert");

        assert_eq!(outcome.inserted, 2);
        assert_eq!(outcome.collapsed, 1);
        assert_eq!(fetch(&store, A).await.title, "last");
    }

    #[tokio::test]
    async fn status_becomes_active_once_threshold_is_exceeded() {
        let (_dir, store) = open_store().await;
        store.upsert_batch(&[candidate(A, "Buyer")], day(0)).await.expect("d0");
        store.upsert_batch(&[candidate(A, "Buyer")], day(5)).await.expect("d5");
        assert_eq!(fetch(&store, A).await.status, PostingStatus::New);
        store.upsert_batch(&[candidate(A, "Buyer")], day(6)).await.expect("d6");
        assert_eq!(fetch(&store, A).await.status, PostingStatus::Active);
    }

    #[tokio::test]
    async fn threshold_comes_from_store_config() {
        let dir = tempdir().expect("tempdir");
        let config = StoreConfig::new(dir.path().join("jobwatch.db")).with_new_to_active_days(1);
        let store = LifecycleStore::connect(&config).await.expect("connect");
        store.upsert_batch(&[candidate(A, "Buyer")], day(0)).await.expect("d0");
        store.upsert_batch(&[candidate(A, "Buyer")], day(2)).await.expect("d2");
        assert_eq!(fetch(&store, A).await.status, PostingStatus::Active);
    }

    #[tokio::test]
    async fn finalize_closes_only_stale_open_rows() {
        let (_dir, store) = open_store().await;
        store
            .upsert_batch(&[candidate(A, "a"), candidate(B, "b"), candidate(C, "c")], day(0))
            .await
            .expect("d0");
        // B turns active, C stays recent.
        store.upsert_batch(&[candidate(B, "b")], day(6)).await.expect("d6");
        store.upsert_batch(&[candidate(C, "c")], day(8)).await.expect("d8");

        let closed = store.finalize_run(2, day(9).date_naive()).await.expect("finalize");
        assert_eq!(closed, 2);
        assert_eq!(fetch(&store, A).await.status, PostingStatus::Closed);
        assert_eq!(fetch(&store, B).await.status, PostingStatus::Closed);
        let c = fetch(&store, C).await;
        assert_eq!(c.status, PostingStatus::New);

        // Closed rows are never touched again by finalize.
        let again = store.finalize_run(0, day(30).date_naive()).await.expect("finalize");
        assert_eq!(again, 1);
        assert_eq!(fetch(&store, A).await.last_seen_on, day(0).date_naive());
    }

    #[tokio::test]
    async fn resighting_a_closed_posting_reopens_it_in_place() {
        let (_dir, store) = open_store().await;
        store.upsert_batch(&[candidate(A, "a")], day(0)).await.expect("d0");
        store.finalize_run(1, day(4).date_naive()).await.expect("finalize");
        assert_eq!(fetch(&store, A).await.status, PostingStatus::Closed);

        let outcome = store.upsert_batch(&[candidate(A, "a")], day(10)).await.expect("d10");
        assert_eq!(outcome.reopened, 1);
        let a = fetch(&store, A).await;
        assert_eq!(a.status, PostingStatus::Active);
        assert_eq!(a.scraped_at, day(0));
        assert_eq!(a.last_seen_on, day(10).date_naive());
    }

    #[tokio::test]
    async fn failed_batch_leaves_store_untouched() {
        let (_dir, store) = open_store().await;
        store.upsert_batch(&[candidate(A, "a")], day(0)).await.expect("seed");
        let before = store.list_postings(&PostingFilter::default()).await.expect("list");

        let mut corrupt = candidate("https://example.com/jobs/bad", "bad");
        corrupt.job_hash = JobHash::from_stored("not-a-sha256");
        let err = store
            .upsert_batch(&[candidate(B, "b"), candidate(A, "a"), corrupt], day(3))
            .await
            .expect_err("check constraint must abort the batch");
        assert!(matches!(err, StoreError::Transaction(_)), "{err:?}");

        let after = store.list_postings(&PostingFilter::default()).await.expect("list");
        assert_eq!(before, after);
        assert_eq!(store.count_postings().await.expect("count"), 1);
    }

    #[test]
    fn text_values_follow_the_column_type() {
        assert_eq!(enrichment_value_from_text("ai_comment", "42").expect("text"), json!("42"));
        assert_eq!(enrichment_value_from_text("tags", "true").expect("text"), json!("true"));
        assert_eq!(enrichment_value_from_text("score_total", " 87 ").expect("int"), json!(87));
        assert_eq!(enrichment_value_from_text("is_relevant", "Yes").expect("flag"), json!(true));
        assert_eq!(enrichment_value_from_text("reviewed_flag", "0").expect("flag"), json!(false));
        assert_eq!(enrichment_value_from_text("fit_category", "").expect("clear"), JsonValue::Null);
        assert!(matches!(
            enrichment_value_from_text("score_total", "high"),
            Err(StoreError::InvalidFieldValue { .. })
        ));
        assert!(matches!(
            enrichment_value_from_text("title", "x"),
            Err(StoreError::UnknownField(_))
        ));
    }

    #[tokio::test]
    async fn read_only_database_is_unavailable_not_retryable() {
        let dir = tempdir().expect("tempdir");
        let mut config = StoreConfig::new(dir.path().join("jobwatch.db"));
        config.max_connections = 1;
        let store = LifecycleStore::connect(&config).await.expect("connect");
        sqlx::query("PRAGMA query_only = ON")
            .execute(store.pool())
            .await
            .expect("pragma");

        let err = store
            .upsert_batch(&[candidate(A, "a")], day(0))
            .await
            .expect_err("writes must fail");
        assert!(err.is_unavailable(), "{err:?}");
    }

    #[tokio::test]
    async fn patch_fields_touches_only_enrichment_columns() {
        let (_dir, store) = open_store().await;
        store.upsert_batch(&[candidate(A, "a")], day(0)).await.expect("seed");
        let hash = job_hash_for_link(A);

        assert!(!store.patch_fields(&hash, &BTreeMap::new()).await.expect("noop"));
        assert!(fetch(&store, A).await.updated_at.is_none());

        let fields = BTreeMap::from([
            ("is_relevant".to_string(), json!(true)),
            ("score_total".to_string(), json!(87)),
            ("fit_category".to_string(), json!("strong")),
        ]);
        assert!(store.patch_fields(&hash, &fields).await.expect("patch"));
        let a = fetch(&store, A).await;
        assert_eq!(a.enrichment.is_relevant, Some(true));
        assert_eq!(a.enrichment.score_total, Some(87));
        assert_eq!(a.enrichment.fit_category.as_deref(), Some("strong"));
        assert!(a.updated_at.is_some());
        assert_eq!(a.title, "a");

        let forbidden = BTreeMap::from([("title".to_string(), json!("hijacked"))]);
        let err = store.patch_fields(&hash, &forbidden).await.expect_err("unknown");
        assert!(matches!(err, StoreError::UnknownField(f) if f == "title"));

        let wrong_type = BTreeMap::from([("score_total".to_string(), json!("high"))]);
        assert!(matches!(
            store.patch_fields(&hash, &wrong_type).await,
            Err(StoreError::InvalidFieldValue { .. })
        ));

        let missing = job_hash_for_link(B);
        assert!(!store.patch_fields(&missing, &fields).await.expect("missing row"));
    }

    #[tokio::test]
    async fn list_postings_applies_filters() {
        let (_dir, store) = open_store().await;
        let mut other = candidate(C, "c");
        other.company = Some("Globex".into());
        store
            .upsert_batch(&[candidate(A, "a"), candidate(B, "b"), other], day(0))
            .await
            .expect("seed");
        store.upsert_batch(&[candidate(A, "a")], day(7)).await.expect("d7");

        let active = store
            .list_postings(&PostingFilter {
                status: Some(PostingStatus::Active),
                ..Default::default()
            })
            .await
            .expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].job_hash, job_hash_for_link(A));

        let globex = store
            .list_postings(&PostingFilter {
                company: Some("globex".into()),
                ..Default::default()
            })
            .await
            .expect("company");
        assert_eq!(globex.len(), 1);

        let recent = store
            .list_postings(&PostingFilter {
                seen_since: Some(day(5).date_naive()),
                limit: Some(10),
                ..Default::default()
            })
            .await
            .expect("recent");
        assert_eq!(recent.len(), 1);

        let counts = store.count_by_status().await.expect("counts");
        assert_eq!(counts, vec![(PostingStatus::Active, 1), (PostingStatus::New, 2)]);
    }

    #[tokio::test]
    async fn run_log_is_append_only() {
        let (_dir, store) = open_store().await;
        let recorder = store.recorder();
        let mut summary = RunSummary::started(Uuid::new_v4(), day(0), 4);
        summary.finished_at = day(0) + chrono::Duration::minutes(3);
        summary.new_postings = 12;
        summary.source_timeouts = 1;
        recorder.record(&summary).await.expect("record");

        let runs = recorder.recent_runs(5).await.expect("runs");
        assert_eq!(runs, vec![summary.clone()]);

        assert!(recorder.record(&summary).await.is_err(), "run ids are unique");
        let update = sqlx::query("UPDATE run_log SET new_postings = 0")
            .execute(store.pool())
            .await;
        assert!(update.is_err());
        let delete = sqlx::query("DELETE FROM run_log").execute(store.pool()).await;
        assert!(delete.is_err());
    }
}
