//! Source adapters, the worker entry point, and the ingestion boundary that
//! turns loosely-typed source rows into validated posting candidates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use jobwatch_core::{
    try_normalize_link, NormalizationError, PostingCandidate, RawPostingRow, SourceKind,
    SourceSpec, WorkerRequest, WorkerResponse, NO_DESCRIPTION_SENTINEL,
};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

mod http;

pub use http::{
    classify_reqwest_error, classify_status, FetchError, HttpClientConfig, HttpFetcher,
    RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};

pub const CRATE_NAME: &str = "jobwatch-adapters";

pub const LINKEDIN_BASE_URL: &str = "https://www.linkedin.com";
const LINKEDIN_SEARCH_PATH: &str = "/jobs-guest/jobs/api/seeMoreJobPostings/search";
const LINKEDIN_PAGE_SIZE: u32 = 25;
pub const LINKEDIN_SITE_NAME: &str = "linkedin_public";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("source throttled: {message}")]
    Throttled {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Throttled { url, retry_after } => AdapterError::Throttled {
                retry_after,
                message: format!("HTTP 429 from {url}"),
            },
            other => AdapterError::Anyhow(anyhow::Error::new(other)),
        }
    }
}

/// A backend that answers one search query with raw rows.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &str;

    async fn search(&self, request: &WorkerRequest) -> Result<Vec<RawPostingRow>, AdapterError>;
}

/// Builds the in-process adapter for a configured source.
///
/// Command sources have no in-process form; they only run behind the process
/// launcher.
pub fn adapter_for_source(
    spec: &SourceSpec,
    http: &HttpClientConfig,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    match spec.kind {
        SourceKind::LinkedinPublic => Ok(Box::new(LinkedinPublicAdapter::new(spec, http)?)),
        SourceKind::Fixture => {
            let path = spec.fixture_path.clone().ok_or_else(|| {
                AdapterError::Message(format!("fixture source `{}` has no fixture_path", spec.name))
            })?;
            Ok(Box::new(FixtureAdapter::new(&spec.name, path)))
        }
        SourceKind::Command => Err(AdapterError::Message(format!(
            "command source `{}` cannot run in-process",
            spec.name
        ))),
    }
}

/// Runs one request to completion and folds the result into the wire
/// response. This is the body of the `worker` subcommand.
pub async fn run_worker(request: &WorkerRequest, http: &HttpClientConfig) -> WorkerResponse {
    let span = info_span!(
        "worker",
        source = %request.source.name,
        query_term = %request.query_term,
        location = %request.location
    );
    async move {
        let adapter = match adapter_for_source(&request.source, http) {
            Ok(adapter) => adapter,
            Err(err) => return response_from_result(Err(err)),
        };
        response_from_result(adapter.search(request).await)
    }
    .instrument(span)
    .await
}

pub fn response_from_result(result: Result<Vec<RawPostingRow>, AdapterError>) -> WorkerResponse {
    match result {
        Ok(rows) => WorkerResponse::Rows { rows },
        Err(AdapterError::Throttled {
            retry_after,
            message,
        }) => WorkerResponse::Throttled {
            retry_after_secs: retry_after.map(|d| d.as_secs()),
            message,
        },
        Err(err) => WorkerResponse::Failed {
            message: format!("{err:#}"),
        },
    }
}

// ---------------------------------------------------------------------------
// LinkedIn public guest search
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct LinkedinPublicAdapter {
    name: String,
    fetcher: HttpFetcher,
    base_url: String,
    pages: u32,
    fetch_detail: bool,
}

impl LinkedinPublicAdapter {
    pub fn new(spec: &SourceSpec, http: &HttpClientConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            name: spec.name.clone(),
            fetcher: HttpFetcher::new(http)?,
            base_url: LINKEDIN_BASE_URL.to_string(),
            pages: spec.pages.max(1),
            fetch_detail: spec.fetch_detail,
        })
    }

    /// Points the adapter at another host; used against mock servers.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn search_url(&self, request: &WorkerRequest, page: u32) -> Result<Url, AdapterError> {
        let mut params = vec![
            ("keywords", request.query_term.clone()),
            ("location", request.location.clone()),
            ("start", page.saturating_mul(LINKEDIN_PAGE_SIZE).to_string()),
        ];
        if request.hours_old > 0 {
            params.push(("f_TPR", format!("r{}", u64::from(request.hours_old) * 3600)));
        }
        Url::parse_with_params(&format!("{}{}", self.base_url, LINKEDIN_SEARCH_PATH), &params)
            .map_err(|e| AdapterError::Message(format!("invalid search url: {e}")))
    }

    async fn attach_description(&self, row: &mut RawPostingRow) -> Result<(), AdapterError> {
        let Some(job_url) = row.text("job_url") else {
            return Ok(());
        };
        match self.fetcher.fetch_text(&job_url).await {
            Ok(html) => {
                if let Some(description) = parse_detail_description(&html)? {
                    row.0.insert("description".to_string(), JsonValue::String(description));
                }
                Ok(())
            }
            Err(err @ FetchError::Throttled { .. }) => Err(err.into()),
            Err(err) => {
                debug!(job_url = %job_url, error = %err, "detail page unavailable");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for LinkedinPublicAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn search(&self, request: &WorkerRequest) -> Result<Vec<RawPostingRow>, AdapterError> {
        let wanted = request.results_wanted as usize;
        let mut rows = Vec::new();

        for page in 0..self.pages {
            let url = self.search_url(request, page)?;
            let html = self.fetcher.fetch_text(url.as_str()).await?;
            let cards = parse_listing_cards(&html)?;
            debug!(page, cards = cards.len(), "parsed listing page");
            if cards.is_empty() {
                break;
            }
            rows.extend(cards);
            if wanted > 0 && rows.len() >= wanted {
                break;
            }
        }

        if wanted > 0 {
            rows.truncate(wanted);
        }

        if self.fetch_detail {
            for row in &mut rows {
                self.attach_description(row).await?;
            }
        }

        info!(rows = rows.len(), "linkedin search finished");
        Ok(rows)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector `{css}`: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn select_first_text(node: ElementRef<'_>, sel: &Selector) -> Option<String> {
    node.select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_first_attr(node: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    node.select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Drops query and fragment from a card link.
pub fn clean_listing_url(href: &str) -> Option<String> {
    let parsed = Url::parse(href.trim()).ok()?;
    let host = parsed.host_str()?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Some(format!("{}://{}{}", parsed.scheme(), authority, parsed.path()))
}

/// Parses one page of guest search results into raw rows. Cards without a
/// usable link are skipped.
pub fn parse_listing_cards(html: &str) -> Result<Vec<RawPostingRow>, AdapterError> {
    let document = Html::parse_fragment(html);
    let item_sel = selector("li")?;
    let card_sel = selector(".base-card")?;
    let link_sel = selector("a.base-card__full-link")?;
    let title_sel = selector("h3.base-search-card__title")?;
    let company_sel = selector("h4.base-search-card__subtitle a")?;
    let location_sel = selector("span.job-search-card__location")?;
    let time_sel = selector("time")?;

    let mut rows = Vec::new();
    for item in document.select(&item_sel) {
        let Some(card) = item.select(&card_sel).next() else {
            continue;
        };
        let Some(job_url) = select_first_attr(card, &link_sel, "href")
            .as_deref()
            .and_then(clean_listing_url)
        else {
            debug!("skipping card without link");
            continue;
        };

        let posted = select_first_attr(card, &time_sel, "datetime")
            .and_then(|dt| parse_posted_date(&dt))
            .map(|d| JsonValue::String(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(JsonValue::Null);

        let opt = |v: Option<String>| v.map(JsonValue::String).unwrap_or(JsonValue::Null);
        rows.push(
            RawPostingRow::new()
                .with("site", LINKEDIN_SITE_NAME)
                .with("job_url", job_url)
                .with("title", opt(select_first_text(card, &title_sel)))
                .with("company", opt(select_first_text(card, &company_sel)))
                .with("location", opt(select_first_text(card, &location_sel)))
                .with("date_posted", posted)
                .with("description", JsonValue::Null),
        );
    }
    Ok(rows)
}

/// Description text of a public posting page, if the page has one.
pub fn parse_detail_description(html: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();
    for css in [".show-more-less-html__markup", ".description__text"] {
        let sel = selector(css)?;
        if let Some(node) = root.select(&sel).next() {
            return Ok(text_or_none(node.text().collect::<Vec<_>>().join(" ")));
        }
    }
    Ok(None)
}

fn parse_posted_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    let head = value.get(..10).unwrap_or(value);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

// ---------------------------------------------------------------------------
// Fixture source
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixtureFile {
    Rows(Vec<RawPostingRow>),
    Wrapped { rows: Vec<RawPostingRow> },
}

/// Returns the rows stored in a JSON file, either a bare array or
/// `{"rows": [...]}`.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    name: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
        }
    }
}

pub async fn load_fixture_rows(path: &Path) -> anyhow::Result<Vec<RawPostingRow>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: FixtureFile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(match file {
        FixtureFile::Rows(rows) | FixtureFile::Wrapped { rows } => rows,
    })
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn search(&self, request: &WorkerRequest) -> Result<Vec<RawPostingRow>, AdapterError> {
        let mut rows = load_fixture_rows(&self.path).await?;
        if request.results_wanted > 0 {
            rows.truncate(request.results_wanted as usize);
        }
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Ingestion boundary
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum CandidateError {
    #[error("row has no usable identity: {0}")]
    Identity(#[from] NormalizationError),
    #[error("row is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` should be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
}

/// Query that produced a batch of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryContext {
    pub query_title: String,
    pub query_location: String,
}

fn required_text(row: &RawPostingRow, field: &'static str) -> Result<String, CandidateError> {
    match row.get(field) {
        None => Err(CandidateError::MissingField(field)),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Err(CandidateError::MissingField(field)),
        Some(JsonValue::String(s)) => Ok(s.trim().to_string()),
        Some(_) => Err(CandidateError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

/// Strips markup and collapses whitespace.
pub fn normalize_description(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    let text = fragment.root_element().text().collect::<String>();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn salary_estimate(row: &RawPostingRow) -> Option<String> {
    let min = row.text("min_amount");
    let max = row.text("max_amount");
    let currency = row.text("currency");
    let interval = row.text("interval");
    if min.is_none() && max.is_none() && currency.is_none() && interval.is_none() {
        return None;
    }
    let joined = format!(
        "{} to {} {} {}",
        min.unwrap_or_default(),
        max.unwrap_or_default(),
        currency.unwrap_or_default(),
        interval.unwrap_or_default()
    );
    Some(joined.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Validates one raw row and maps it to a candidate.
///
/// The row must carry a parsable `job_url` and a non-empty `title`; anything
/// else is optional. `fallback_site` names the source when the row has no
/// `site` of its own.
pub fn candidate_from_row(
    row: &RawPostingRow,
    ctx: &QueryContext,
    fallback_site: &str,
) -> Result<PostingCandidate, CandidateError> {
    let job_url = required_text(row, "job_url")?;
    let key = try_normalize_link(&job_url)?;
    let title = required_text(row, "title")?;

    let (description_raw, description_normalized) = match row.get("description") {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => (s.clone(), normalize_description(s)),
        _ => (
            NO_DESCRIPTION_SENTINEL.to_string(),
            NO_DESCRIPTION_SENTINEL.to_string(),
        ),
    };

    let remote = row.flag("is_remote") == Some(true) || row.flag("work_from_home_type") == Some(true);

    Ok(PostingCandidate {
        job_hash: key.job_hash(),
        link: key.as_str().to_string(),
        site_name: row.text("site").unwrap_or_else(|| fallback_site.to_string()),
        query_title: ctx.query_title.clone(),
        query_location: ctx.query_location.clone(),
        title,
        company: row.text("company"),
        location: row.text("location"),
        posted_date: row.text("date_posted").and_then(|d| parse_posted_date(&d)),
        description_raw,
        description_normalized,
        work_mode: Some(if remote { "remote" } else { "not remote" }.to_string()),
        contract_type: row.text("job_type"),
        salary_estimate: salary_estimate(row),
    })
}

/// Result of pushing a batch of rows through [`candidate_from_row`].
#[derive(Debug, Default)]
pub struct CandidateBatch {
    pub candidates: Vec<PostingCandidate>,
    pub dropped: usize,
}

/// Converts every row, dropping invalid ones with a debug log each and one
/// warning for the batch.
pub fn candidates_from_rows(rows: &[RawPostingRow], ctx: &QueryContext, fallback_site: &str) -> CandidateBatch {
    let mut batch = CandidateBatch::default();
    for row in rows {
        match candidate_from_row(row, ctx, fallback_site) {
            Ok(candidate) => batch.candidates.push(candidate),
            Err(err) => {
                debug!(error = %err, "dropping row");
                batch.dropped += 1;
            }
        }
    }
    if batch.dropped > 0 {
        warn!(
            dropped = batch.dropped,
            kept = batch.candidates.len(),
            query_title = %ctx.query_title,
            "rows dropped at ingestion boundary"
        );
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_core::{job_hash_for_link, QueryTuple};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const LISTING_PAGE: &str = r#"
<li>
  <div class="base-card">
    <a class="base-card__full-link" href="https://mx.linkedin.com/jobs/view/buyer-senior-at-acme-100?refId=abc&trackingId=xyz"></a>
    <h3 class="base-search-card__title">
        Buyer Senior
    </h3>
    <h4 class="base-search-card__subtitle"><a href="https://mx.linkedin.com/company/acme">Acme Manufacturing</a></h4>
    <span class="job-search-card__location">Monterrey, Nuevo León, México</span>
    <time class="job-search-card__listdate" datetime="2026-03-02">2 days ago</time>
  </div>
</li>
<li>
  <div class="base-card">
    <a class="base-card__full-link" href="https://mx.linkedin.com/jobs/view/purchasing-lead-200?position=2"></a>
    <h3 class="base-search-card__title">Purchasing Lead</h3>
    <span class="job-search-card__location">Apodaca, Nuevo León, México</span>
  </div>
</li>
<li>
  <div class="base-card">
    <h3 class="base-search-card__title">No link here</h3>
  </div>
</li>
"#;

    fn ctx() -> QueryContext {
        QueryContext {
            query_title: "Buyer Senior".to_string(),
            query_location: "Monterrey, Mexico".to_string(),
        }
    }

    fn request(source: SourceSpec, results_wanted: u32) -> WorkerRequest {
        WorkerRequest::for_tuple(
            &source,
            &QueryTuple::new("Buyer", "Senior", "Monterrey, Mexico"),
            results_wanted,
            72,
        )
    }

    fn fast_http() -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: jobwatch_core::BackoffPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(10),
            },
            token_bucket: None,
        }
    }

    #[test]
    fn listing_cards_parse_with_clean_links() {
        let rows = parse_listing_cards(LISTING_PAGE).unwrap();
        assert_eq!(rows.len(), 2);

        let first = &rows[0];
        assert_eq!(
            first.text("job_url").as_deref(),
            Some("https://mx.linkedin.com/jobs/view/buyer-senior-at-acme-100")
        );
        assert_eq!(first.text("title").as_deref(), Some("Buyer Senior"));
        assert_eq!(first.text("company").as_deref(), Some("Acme Manufacturing"));
        assert_eq!(first.text("date_posted").as_deref(), Some("2026-03-02"));
        assert_eq!(first.text("site").as_deref(), Some(LINKEDIN_SITE_NAME));

        let second = &rows[1];
        assert_eq!(second.text("company"), None);
        assert_eq!(second.text("date_posted"), None);
    }

    #[test]
    fn detail_description_prefers_markup_block() {
        let html = r#"<html><body>
            <div class="description__text">fallback</div>
            <div class="show-more-less-html__markup"><p>Negotiate with <b>suppliers</b>.</p>
            <ul><li>SAP</li></ul></div></body></html>"#;
        assert_eq!(
            parse_detail_description(html).unwrap().as_deref(),
            Some("Negotiate with suppliers . SAP")
        );
        assert_eq!(parse_detail_description("<html><body></body></html>").unwrap(), None);
    }

    #[test]
    fn candidate_maps_rich_content() {
        let row = RawPostingRow::new()
            .with("site", "indeed")
            .with("job_url", "https://mx.indeed.com/viewjob?jk=abc123")
            .with("title", "Comprador Senior")
            .with("company", "Acme")
            .with("date_posted", "2026-03-01T00:00:00")
            .with("description", "<p>Buy   <b>steel</b></p>\n<p>now</p>")
            .with("is_remote", true)
            .with("job_type", "fulltime")
            .with("min_amount", 30000)
            .with("max_amount", 40000)
            .with("currency", "MXN")
            .with("interval", "monthly");

        let candidate = candidate_from_row(&row, &ctx(), "fallback").unwrap();
        assert_eq!(candidate.job_hash, job_hash_for_link("https://mx.indeed.com/viewjob?jk=abc123"));
        assert_eq!(candidate.site_name, "indeed");
        assert_eq!(candidate.query_title, "Buyer Senior");
        assert_eq!(candidate.posted_date, NaiveDate::from_ymd_opt(2026, 3, 1));
        assert_eq!(candidate.description_normalized, "Buy steel now");
        assert_eq!(candidate.work_mode.as_deref(), Some("remote"));
        assert_eq!(candidate.contract_type.as_deref(), Some("fulltime"));
        assert_eq!(candidate.salary_estimate.as_deref(), Some("30000 to 40000 MXN monthly"));
    }

    #[test]
    fn candidate_without_description_uses_sentinel() {
        let row = RawPostingRow::new()
            .with("job_url", "https://www.linkedin.com/jobs/view/1?trk=x")
            .with("title", "Buyer");
        let candidate = candidate_from_row(&row, &ctx(), LINKEDIN_SITE_NAME).unwrap();
        assert_eq!(candidate.description_raw, NO_DESCRIPTION_SENTINEL);
        assert_eq!(candidate.description_normalized, NO_DESCRIPTION_SENTINEL);
        assert_eq!(candidate.link, "https://www.linkedin.com/jobs/view/1");
        assert_eq!(candidate.site_name, LINKEDIN_SITE_NAME);
        assert_eq!(candidate.work_mode.as_deref(), Some("not remote"));
        assert_eq!(candidate.salary_estimate, None);
    }

    #[test]
    fn invalid_rows_are_rejected_and_counted() {
        let rows = vec![
            RawPostingRow::new().with("title", "No link"),
            RawPostingRow::new().with("job_url", "").with("title", "Empty link"),
            RawPostingRow::new().with("job_url", "/relative/path").with("title", "Relative"),
            RawPostingRow::new().with("job_url", 42).with("title", "Numeric link"),
            RawPostingRow::new().with("job_url", "https://www.linkedin.com/jobs/view/9"),
            RawPostingRow::new()
                .with("job_url", "https://www.linkedin.com/jobs/view/10")
                .with("title", "Valid"),
        ];

        assert_eq!(
            candidate_from_row(&rows[0], &ctx(), "x"),
            Err(CandidateError::MissingField("job_url"))
        );
        assert!(matches!(
            candidate_from_row(&rows[2], &ctx(), "x"),
            Err(CandidateError::Identity(NormalizationError::Unparsable(_)))
        ));
        assert!(matches!(
            candidate_from_row(&rows[3], &ctx(), "x"),
            Err(CandidateError::WrongType { field: "job_url", .. })
        ));
        assert_eq!(
            candidate_from_row(&rows[4], &ctx(), "x"),
            Err(CandidateError::MissingField("title"))
        );

        let batch = candidates_from_rows(&rows, &ctx(), "x");
        assert_eq!(batch.dropped, 5);
        assert_eq!(batch.candidates.len(), 1);
        assert_eq!(batch.candidates[0].title, "Valid");
    }

    #[tokio::test]
    async fn fixture_adapter_reads_bare_and_wrapped_files() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("bare.json");
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &bare,
            r#"[{"job_url": "https://www.linkedin.com/jobs/view/1", "title": "A"},
                {"job_url": "https://www.linkedin.com/jobs/view/2", "title": "B"},
                {"job_url": "https://www.linkedin.com/jobs/view/3", "title": "C"}]"#,
        )
        .unwrap();
        std::fs::write(
            &wrapped,
            r#"{"rows": [{"job_url": "https://www.linkedin.com/jobs/view/4", "title": "D"}]}"#,
        )
        .unwrap();

        let mut spec = SourceSpec::new("fixture", SourceKind::Fixture);
        spec.fixture_path = Some(bare.clone());
        let adapter = adapter_for_source(&spec, &fast_http()).unwrap();
        let rows = adapter.search(&request(spec.clone(), 2)).await.unwrap();
        assert_eq!(rows.len(), 2);

        let rows = FixtureAdapter::new("wrapped", &wrapped)
            .search(&request(spec, 0))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("title").as_deref(), Some("D"));
    }

    #[tokio::test]
    async fn worker_reports_failures_instead_of_erroring() {
        let mut spec = SourceSpec::new("missing", SourceKind::Fixture);
        spec.fixture_path = Some(PathBuf::from("/definitely/not/here.json"));
        let response = run_worker(&request(spec, 10), &fast_http()).await;
        assert!(matches!(response, WorkerResponse::Failed { ref message } if message.contains("reading")));

        let spec = SourceSpec::new("external", SourceKind::Command);
        let response = run_worker(&request(spec, 10), &fast_http()).await;
        assert!(matches!(response, WorkerResponse::Failed { .. }));
        assert_eq!(response.exit_code(), 1);
    }

    #[test]
    fn search_offset_saturates_on_huge_page_numbers() {
        let spec = SourceSpec::new("linkedin", SourceKind::LinkedinPublic);
        let adapter = LinkedinPublicAdapter::new(&spec, &fast_http()).unwrap();
        let url = adapter.search_url(&request(spec, 10), u32::MAX).unwrap();
        let start = url
            .query_pairs()
            .find(|(k, _)| k == "start")
            .map(|(_, v)| v.into_owned());
        assert_eq!(start.as_deref(), Some(u32::MAX.to_string().as_str()));
    }

    #[tokio::test]
    async fn linkedin_adapter_pages_until_empty_and_truncates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LINKEDIN_SEARCH_PATH))
            .and(query_param("start", "0"))
            .and(query_param("keywords", "Buyer Senior"))
            .and(query_param("f_TPR", "r259200"))
            .respond_with(ResponseTemplate::new(200).set_body_string(LISTING_PAGE))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(LINKEDIN_SEARCH_PATH))
            .and(query_param("start", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .expect(1)
            .mount(&server)
            .await;

        let mut spec = SourceSpec::new("linkedin", SourceKind::LinkedinPublic);
        spec.pages = 3;
        let adapter = LinkedinPublicAdapter::new(&spec, &fast_http())
            .unwrap()
            .with_base_url(server.uri());

        let rows = adapter.search(&request(spec.clone(), 0)).await.unwrap();
        assert_eq!(rows.len(), 2);

        let batch = candidates_from_rows(&rows, &ctx(), "linkedin");
        assert_eq!(batch.dropped, 0);
        assert_eq!(
            batch.candidates[0].job_hash,
            job_hash_for_link("https://mx.linkedin.com/jobs/view/buyer-senior-at-acme-100?trk=other")
        );
    }

    #[tokio::test]
    async fn linkedin_throttle_becomes_throttled_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
            .mount(&server)
            .await;

        let spec = SourceSpec::new("linkedin", SourceKind::LinkedinPublic);
        let adapter = LinkedinPublicAdapter::new(&spec, &fast_http())
            .unwrap()
            .with_base_url(server.uri());
        let response = response_from_result(adapter.search(&request(spec, 10)).await);
        assert!(matches!(
            response,
            WorkerResponse::Throttled { retry_after_secs: Some(120), ref message } if message.starts_with("HTTP 429")
        ));
        assert_eq!(response.exit_code(), jobwatch_core::THROTTLED_EXIT_CODE);
    }

    #[tokio::test]
    async fn linkedin_detail_fetch_fills_description() {
        let server = MockServer::start().await;
        let listing = format!(
            r#"<li><div class="base-card">
                <a class="base-card__full-link" href="{}/jobs/view/300?trk=1"></a>
                <h3 class="base-search-card__title">Buyer</h3></div></li>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path(LINKEDIN_SEARCH_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/jobs/view/300"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<html><body><div class="show-more-less-html__markup">Own the supplier base.</div></body></html>"#,
            ))
            .mount(&server)
            .await;

        let mut spec = SourceSpec::new("linkedin", SourceKind::LinkedinPublic);
        spec.pages = 1;
        spec.fetch_detail = true;
        let adapter = LinkedinPublicAdapter::new(&spec, &fast_http())
            .unwrap()
            .with_base_url(server.uri());
        let rows = adapter.search(&request(spec, 5)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text("description").as_deref(), Some("Own the supplier base."));
    }
}
