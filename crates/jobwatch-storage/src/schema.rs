//! SQLite schema for the posting lifecycle store.

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_postings (
    job_hash TEXT PRIMARY KEY CHECK (length(job_hash) = 64),
    site_name TEXT NOT NULL,
    query_title TEXT NOT NULL,
    query_location TEXT NOT NULL,
    title TEXT NOT NULL,
    company TEXT,
    location TEXT,
    posted_date TEXT,
    description_raw TEXT NOT NULL,
    description_normalized TEXT NOT NULL,
    link TEXT NOT NULL,
    work_mode TEXT,
    contract_type TEXT,
    salary_estimate TEXT,
    scraped_at TEXT NOT NULL,
    last_seen_on TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('new', 'active', 'closed')),
    updated_at TEXT,
    -- enrichment, written only through patch_fields
    is_relevant INTEGER,
    is_user_fit INTEGER,
    seniority_estimate TEXT,
    ai_comment TEXT,
    score_total INTEGER,
    fit_category TEXT,
    processed_at TEXT,
    last_reviewed TEXT,
    reviewed_flag INTEGER,
    tags TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_postings_status ON job_postings(status);
CREATE INDEX IF NOT EXISTS idx_job_postings_company ON job_postings(company);
CREATE INDEX IF NOT EXISTS idx_job_postings_scraped_at ON job_postings(scraped_at);
CREATE INDEX IF NOT EXISTS idx_job_postings_last_seen_on ON job_postings(last_seen_on);

CREATE TABLE IF NOT EXISTS run_log (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    status TEXT NOT NULL,
    duration_total_ms INTEGER NOT NULL,
    duration_scrape_ms INTEGER NOT NULL,
    duration_finalize_ms INTEGER NOT NULL,
    tuples_planned INTEGER NOT NULL,
    tuples_completed INTEGER NOT NULL,
    rows_received INTEGER NOT NULL,
    rows_dropped INTEGER NOT NULL,
    new_postings INTEGER NOT NULL,
    updated_postings INTEGER NOT NULL,
    reopened_postings INTEGER NOT NULL,
    closed_postings INTEGER NOT NULL,
    total_postings INTEGER NOT NULL,
    source_timeouts INTEGER NOT NULL,
    source_errors INTEGER NOT NULL,
    failed_flushes INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_log_started_at ON run_log(started_at);

CREATE TRIGGER IF NOT EXISTS run_log_no_update
BEFORE UPDATE ON run_log
BEGIN
    SELECT RAISE(ABORT, 'run_log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS run_log_no_delete
BEFORE DELETE ON run_log
BEGIN
    SELECT RAISE(ABORT, 'run_log is append-only');
END;
"#;
