//! Core domain model, posting identity, and worker protocol types for jobwatch.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-core";

/// Stored in place of a description when the source returned none.
pub const NO_DESCRIPTION_SENTINEL: &str = "[[NO DESCRIPTION RETURNED]]";

/// Hosts whose posting identity lives entirely in the URL path. Their query
/// strings carry tracking/session parameters and are dropped.
pub const PATH_IDENTITY_HOSTS: &[&str] = &["linkedin."];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("link is empty")]
    EmptyLink,
    #[error("link `{0}` is not an absolute URL")]
    Unparsable(String),
}

/// Normalized form of a posting link, used as the hashing input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// The sentinel key produced for empty or unparsable links.
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn job_hash(&self) -> JobHash {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        JobHash(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex SHA-256 of a canonical key; primary key of a posting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHash(String);

impl JobHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an already-computed hash read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty_identity(&self) -> bool {
        *self == CanonicalKey::empty().job_hash()
    }
}

impl fmt::Display for JobHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps a raw link to its canonical key.
///
/// Path-identity hosts keep scheme, host (with port) and path only; every
/// other host keeps the trimmed link verbatim because its query string may be
/// part of the identity. Empty or unparsable input yields
/// [`CanonicalKey::empty`].
pub fn normalize_link(raw: &str) -> CanonicalKey {
    match try_normalize_link(raw) {
        Ok(key) => key,
        Err(_) => CanonicalKey::empty(),
    }
}

/// Like [`normalize_link`] but reports why a link has no identity.
pub fn try_normalize_link(raw: &str) -> Result<CanonicalKey, NormalizationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizationError::EmptyLink);
    }
    let parsed =
        Url::parse(trimmed).map_err(|_| NormalizationError::Unparsable(trimmed.to_string()))?;
    let Some(host) = parsed.host_str() else {
        return Err(NormalizationError::Unparsable(trimmed.to_string()));
    };

    let host = host.to_ascii_lowercase();
    if PATH_IDENTITY_HOSTS.iter().any(|marker| host.contains(marker)) {
        let authority = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        return Ok(CanonicalKey(format!(
            "{}://{}{}",
            parsed.scheme(),
            authority,
            parsed.path()
        )));
    }

    Ok(CanonicalKey(trimmed.to_string()))
}

/// Convenience: `normalize_link(raw).job_hash()`.
pub fn job_hash_for_link(raw: &str) -> JobHash {
    normalize_link(raw).job_hash()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostingStatus {
    New,
    Active,
    Closed,
}

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostingStatus::New => "new",
            PostingStatus::Active => "active",
            PostingStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for PostingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(PostingStatus::New),
            "active" => Ok(PostingStatus::Active),
            "closed" => Ok(PostingStatus::Closed),
            other => Err(format!("unknown posting status `{other}`")),
        }
    }
}

/// Status of a posting re-sighted on `seen_on` that was first seen on
/// `first_seen`: `new` while the age in days is at most `new_to_active_days`,
/// `active` afterwards.
pub fn derive_status(first_seen: NaiveDate, seen_on: NaiveDate, new_to_active_days: i64) -> PostingStatus {
    let age = (seen_on - first_seen).num_days();
    if age <= new_to_active_days {
        PostingStatus::New
    } else {
        PostingStatus::Active
    }
}

/// One (role, function, location) combination of the query space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTuple {
    pub role: String,
    pub function: String,
    pub location: String,
    pub country: String,
}

impl QueryTuple {
    pub fn new(role: &str, function: &str, location: &str) -> Self {
        Self {
            role: role.to_string(),
            function: function.to_string(),
            location: location.to_string(),
            country: country_for_location(location),
        }
    }

    pub fn query_term(&self) -> String {
        format!("{} {}", self.role.trim(), self.function.trim())
            .trim()
            .to_string()
    }
}

impl fmt::Display for QueryTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.query_term(), self.location)
    }
}

/// `"Monterrey, Mexico"` -> `"Mexico"`; a location without a comma is
/// already a country.
pub fn country_for_location(location: &str) -> String {
    match location.rsplit_once(',') {
        Some((_, country)) => country.trim().to_string(),
        None => location.trim().to_string(),
    }
}

/// Loosely-typed row as returned by a scrape backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawPostingRow(pub JsonMap<String, JsonValue>);

impl RawPostingRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    /// Non-empty trimmed string value; numbers are rendered as text.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            JsonValue::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
            JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Validated record handed to the store; produced at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingCandidate {
    pub job_hash: JobHash,
    pub link: String,
    pub site_name: String,
    pub query_title: String,
    pub query_location: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub description_raw: String,
    pub description_normalized: String,
    pub work_mode: Option<String>,
    pub contract_type: Option<String>,
    pub salary_estimate: Option<String>,
}

/// Fields owned by downstream enrichment collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub is_relevant: Option<bool>,
    pub is_user_fit: Option<bool>,
    pub seniority_estimate: Option<String>,
    pub ai_comment: Option<String>,
    pub score_total: Option<i64>,
    pub fit_category: Option<String>,
    pub processed_at: Option<String>,
    pub last_reviewed: Option<String>,
    pub reviewed_flag: Option<bool>,
    pub tags: Option<String>,
}

/// A persisted posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub job_hash: JobHash,
    pub site_name: String,
    pub query_title: String,
    pub query_location: String,
    pub title: String,
    pub company: Option<String>,
    pub location: Option<String>,
    pub posted_date: Option<NaiveDate>,
    pub description_raw: String,
    pub description_normalized: String,
    pub link: String,
    pub work_mode: Option<String>,
    pub contract_type: Option<String>,
    pub salary_estimate: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub last_seen_on: NaiveDate,
    pub status: PostingStatus,
    pub updated_at: Option<DateTime<Utc>>,
    pub enrichment: Enrichment,
}

/// Counts returned by a batch upsert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub inserted: usize,
    pub updated: usize,
    /// Subset of `updated` whose row was `closed` before the sighting.
    pub reopened: usize,
    /// Candidates folded into a later duplicate of the same batch.
    pub collapsed: usize,
}

impl UpsertOutcome {
    pub fn absorb(&mut self, other: UpsertOutcome) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.reopened += other.reopened;
        self.collapsed += other.collapsed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Built-in LinkedIn public guest search.
    LinkedinPublic,
    /// Rows read from a JSON file.
    Fixture,
    /// External program speaking the worker protocol.
    Command,
}

/// One configured external source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    /// Overrides the run-wide per-source timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_pages")]
    pub pages: u32,
    #[serde(default)]
    pub fetch_detail: bool,
}

fn default_pages() -> u32 {
    2
}

impl SourceSpec {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            command: Vec::new(),
            fixture_path: None,
            timeout_secs: None,
            pages: default_pages(),
            fetch_detail: false,
        }
    }
}

/// Input of one isolated source call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub source: SourceSpec,
    pub query_term: String,
    pub location: String,
    pub country: String,
    pub results_wanted: u32,
    pub hours_old: u32,
}

impl WorkerRequest {
    pub fn for_tuple(source: &SourceSpec, tuple: &QueryTuple, results_wanted: u32, hours_old: u32) -> Self {
        Self {
            source: source.clone(),
            query_term: tuple.query_term(),
            location: tuple.location.clone(),
            country: tuple.country.clone(),
            results_wanted,
            hours_old,
        }
    }
}

/// Output of one isolated source call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerResponse {
    Rows { rows: Vec<RawPostingRow> },
    Throttled {
        #[serde(default)]
        retry_after_secs: Option<u64>,
        message: String,
    },
    Failed { message: String },
}

impl WorkerResponse {
    /// Process exit code used by the built-in worker for this response.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerResponse::Rows { .. } => 0,
            WorkerResponse::Throttled { .. } => THROTTLED_EXIT_CODE,
            WorkerResponse::Failed { .. } => 1,
        }
    }
}

/// `EX_TEMPFAIL`; a worker exiting with this code was throttled by its source.
pub const THROTTLED_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Budget overrun or operator stop; finalization still ran.
    StoppedEarly,
    /// The store became unavailable; the run aborted.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::StoppedEarly => "stopped_early",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunStatus::Completed),
            "stopped_early" => Ok(RunStatus::StoppedEarly),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

/// One row of the append-only run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub duration_total_ms: u64,
    pub duration_scrape_ms: u64,
    pub duration_finalize_ms: u64,
    pub tuples_planned: usize,
    pub tuples_completed: usize,
    pub rows_received: usize,
    pub rows_dropped: usize,
    pub new_postings: usize,
    pub updated_postings: usize,
    pub reopened_postings: usize,
    pub closed_postings: usize,
    pub total_postings: usize,
    pub source_timeouts: usize,
    pub source_errors: usize,
    pub failed_flushes: usize,
}

impl RunSummary {
    pub fn started(run_id: Uuid, started_at: DateTime<Utc>, tuples_planned: usize) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            duration_total_ms: 0,
            duration_scrape_ms: 0,
            duration_finalize_ms: 0,
            tuples_planned,
            tuples_completed: 0,
            rows_received: 0,
            rows_dropped: 0,
            new_postings: 0,
            updated_postings: 0,
            reopened_postings: 0,
            closed_postings: 0,
            total_postings: 0,
            source_timeouts: 0,
            source_errors: 0,
            failed_flushes: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}
