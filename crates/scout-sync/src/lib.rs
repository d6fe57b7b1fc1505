//! Scan orchestration: recency gate, dedup, concurrent validation, reduction, reports.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use scout_adapters::ValidationRules;
use scout_core::{Posting, RawCandidate, RejectedPosting, Rejection, ValidationStatus};
use scout_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, OverlayLedger, PageFetcher, SeenLedger,
    SqliteLedger, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dedup;
pub mod reduce;
pub mod report;
pub mod validate;

pub use dedup::{DedupFilter, DedupOutcome};
pub use reduce::{OutcomeReducer, Reduced};
pub use report::{report_markdown, write_run_reports};
pub use validate::{PostingValidator, ValidationPipeline};

pub const CRATE_NAME: &str = "scout-sync";

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub database_url: String,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub candidates_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub workers: usize,
    pub per_host_limit: usize,
    /// Per-host pacing interval; 0 disables the token bucket.
    pub host_refill_ms: u64,
    pub retries: usize,
    pub run_timeout_secs: u64,
    pub recency_days: i64,
    pub near_miss_limit: usize,
    pub scheduler_enabled: bool,
    pub scan_cron: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("SCOUT_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://scout.db".to_string()),
            reports_dir: std::env::var("SCOUT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            workspace_root: PathBuf::from("."),
            candidates_path: std::env::var("SCOUT_CANDIDATES").ok().map(PathBuf::from),
            user_agent: std::env::var("SCOUT_USER_AGENT")
                .unwrap_or_else(|_| "internship-scout/0.1".to_string()),
            http_timeout_secs: env_or("SCOUT_HTTP_TIMEOUT_SECS", 10),
            workers: env_or("SCOUT_WORKERS", 8),
            per_host_limit: env_or("SCOUT_PER_HOST_LIMIT", 2),
            host_refill_ms: env_or("SCOUT_HOST_REFILL_MS", 250),
            retries: env_or("SCOUT_RETRIES", 2),
            run_timeout_secs: env_or("SCOUT_RUN_TIMEOUT_SECS", 300),
            recency_days: env_or("SCOUT_RECENCY_DAYS", 7),
            near_miss_limit: env_or("SCOUT_NEAR_MISS_LIMIT", 10),
            scheduler_enabled: std::env::var("SCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scan_cron: std::env::var("SCOUT_SCAN_CRON")
                .unwrap_or_else(|_| "0 0 7 * * *".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.workers.max(1),
            per_host_concurrency: self.per_host_limit.max(1),
            backoff: BackoffPolicy {
                max_retries: self.retries,
                ..Default::default()
            },
            token_bucket: (self.host_refill_ms > 0).then(|| TokenBucketConfig {
                capacity: self.per_host_limit.max(1) as u32,
                refill_every: Duration::from_millis(self.host_refill_ms),
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub force: bool,
    pub dry_run: bool,
    pub max_results: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub candidates: usize,
    pub validated: usize,
    pub notified: usize,
    pub rejected: usize,
    /// Rejections caused by unusable input or unreachable pages rather than a verdict.
    pub errored: usize,
    pub suspicious: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub options: RunOptions,
    pub counts: RunCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOutcome {
    pub summary: RunSummary,
    pub notify: Vec<Posting>,
    pub rejected: Vec<RejectedPosting>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CandidateFile {
    List(Vec<RawCandidate>),
    Wrapped { candidates: Vec<RawCandidate> },
}

/// Reads a candidate batch; `.json` files as JSON, anything else as YAML. Accepts a bare list
/// or `{ candidates: [...] }`.
pub async fn load_candidates(path: impl AsRef<Path>) -> Result<Vec<RawCandidate>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let file: CandidateFile = if is_json {
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    };
    Ok(match file {
        CandidateFile::List(candidates) | CandidateFile::Wrapped { candidates } => candidates,
    })
}

/// Drops postings whose `posted_at` lies more than `recency_days` before `now`. Independent of
/// the ledger: nothing is read or written. Undated postings pass.
pub fn recency_gate(
    postings: Vec<Posting>,
    recency_days: i64,
    now: DateTime<Utc>,
) -> (Vec<Posting>, Vec<RejectedPosting>) {
    // A window too large to represent keeps everything.
    let cutoff = chrono::Duration::try_days(recency_days.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let (kept, stale): (Vec<_>, Vec<_>) = postings
        .into_iter()
        .partition(|p| p.posted_at.map_or(true, |posted| posted >= cutoff));
    let rejected = stale
        .into_iter()
        .map(|posting| RejectedPosting {
            posting,
            rejection: Rejection::intake(format!(
                "stale: posted more than {recency_days} days ago"
            )),
        })
        .collect();
    (kept, rejected)
}

fn count(
    candidates: usize,
    validated: usize,
    notify: &[Posting],
    rejected: &[RejectedPosting],
) -> RunCounts {
    let errored = rejected
        .iter()
        .filter(|r| match &r.rejection {
            Rejection::Intake { reason } => reason == dedup::UNPARSEABLE_URL,
            Rejection::Validation { status, .. } => *status == ValidationStatus::Unreachable,
            Rejection::AlreadyDelivered => false,
        })
        .count();
    RunCounts {
        candidates,
        validated,
        notified: notify.len(),
        rejected: rejected.len(),
        errored,
        suspicious: rejected
            .iter()
            .filter(|r| r.rejection.status() == Some(ValidationStatus::Suspicious))
            .count(),
    }
}

pub struct ScanPipeline {
    config: ScanConfig,
    http: Arc<dyn PageFetcher>,
    ledger: Arc<dyn SeenLedger>,
    rules: ValidationRules,
    in_flight: AtomicBool,
}

impl ScanPipeline {
    /// Opens the durable ledger and HTTP client described by `config`.
    pub async fn connect(config: ScanConfig) -> Result<Self> {
        let ledger = SqliteLedger::connect(&config.database_url)
            .await
            .with_context(|| format!("opening ledger {}", config.database_url))?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let rules = ValidationRules::from_workspace_root(&config.workspace_root)?;
        Ok(Self::with_parts(config, Arc::new(http), Arc::new(ledger), rules))
    }

    pub fn with_parts(
        config: ScanConfig,
        http: Arc<dyn PageFetcher>,
        ledger: Arc<dyn SeenLedger>,
        rules: ValidationRules,
    ) -> Self {
        Self {
            config,
            http,
            ledger,
            rules,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<dyn SeenLedger> {
        &self.ledger
    }

    /// One full pass over `candidates`. Per-posting failures become rejections; only ledger
    /// failures abort the run.
    pub async fn run_once(
        &self,
        candidates: Vec<RawCandidate>,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<ScanOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scan", %run_id, force = options.force, dry_run = options.dry_run);
        self.run_inner(run_id, candidates, options, now).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        mut candidates: Vec<RawCandidate>,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<ScanOutcome> {
        let started_at = Utc::now();
        if let Some(max) = options.max_results {
            candidates.truncate(max);
        }
        let total = candidates.len();
        info!(candidates = total, "scan started");

        let postings = candidates
            .into_iter()
            .map(|candidate| Posting::from_candidate(candidate, now))
            .collect::<Vec<_>>();
        let (fresh, mut rejected) = recency_gate(postings, self.config.recency_days, now);

        let ledger: Arc<dyn SeenLedger> = if options.dry_run {
            Arc::new(OverlayLedger::new(self.ledger.clone()))
        } else {
            self.ledger.clone()
        };

        let deduped = DedupFilter::new(ledger.as_ref())
            .filter(fresh, options.force, now)
            .await
            .context("dedup against seen ledger")?;
        rejected.extend(deduped.rejected);

        let validator = PostingValidator::new(self.http.clone(), self.rules.clone(), run_id, now);
        let pipeline = ValidationPipeline::new(
            validator,
            self.config.workers,
            Duration::from_secs(self.config.run_timeout_secs),
        );
        let validated = deduped.survivors.len();
        let outcomes = pipeline.validate_all(&deduped.survivors).await;

        let reduced = OutcomeReducer::new(ledger.as_ref())
            .reduce(deduped.survivors, outcomes, now)
            .await
            .context("recording deliveries in seen ledger")?;
        rejected.extend(reduced.rejected);

        let counts = count(total, validated, &reduced.notify, &rejected);
        info!(
            notified = counts.notified,
            rejected = counts.rejected,
            errored = counts.errored,
            suspicious = counts.suspicious,
            "scan finished"
        );

        Ok(ScanOutcome {
            summary: RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                options,
                counts,
            },
            notify: reduced.notify,
            rejected,
        })
    }

    /// `run_once` plus the report directory for it.
    pub async fn run_and_report(
        &self,
        candidates: Vec<RawCandidate>,
        options: RunOptions,
        now: DateTime<Utc>,
    ) -> Result<(ScanOutcome, PathBuf)> {
        let outcome = self.run_once(candidates, options, now).await?;
        let dir =
            write_run_reports(&self.config.reports_dir, &outcome, self.config.near_miss_limit)
                .await?;
        Ok((outcome, dir))
    }

    /// Skips (returns `None`) when another scan on this pipeline is still running.
    pub async fn run_from_path_exclusive(
        &self,
        path: &Path,
        options: RunOptions,
    ) -> Result<Option<PathBuf>> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            warn!("previous scan still running, skipping tick");
            return Ok(None);
        }
        let result = async {
            let candidates = load_candidates(path).await?;
            let (_, dir) = self.run_and_report(candidates, options, Utc::now()).await?;
            Ok(dir)
        }
        .await;
        self.in_flight.store(false, Ordering::Release);
        result.map(Some)
    }

    pub async fn maybe_build_scheduler(
        self: Arc<Self>,
        candidates_path: PathBuf,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.scan_cron.clone();
        let pipeline = self;
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let path = candidates_path.clone();
            Box::pin(async move {
                match pipeline.run_from_path_exclusive(&path, RunOptions::default()).await {
                    Ok(Some(dir)) => info!(reports = %dir.display(), "scheduled scan complete"),
                    Ok(None) => {}
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled scan failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scout_core::SourceKind;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 7, 0, 0).single().unwrap()
    }

    #[test]
    fn recency_gate_drops_only_dated_stale_postings() {
        let mut old = RawCandidate::new("https://acme.com/jobs/1001", SourceKind::LlmSearch);
        old.posted_at = Some(now() - chrono::Duration::days(10));
        let mut recent = RawCandidate::new("https://acme.com/jobs/1002", SourceKind::LlmSearch);
        recent.posted_at = Some(now() - chrono::Duration::days(2));
        let undated = RawCandidate::new("https://acme.com/jobs/1003", SourceKind::LlmSearch);

        let postings = [old, recent, undated]
            .into_iter()
            .map(|c| Posting::from_candidate(c, now()))
            .collect();
        let (kept, rejected) = recency_gate(postings, 7, now());
        assert_eq!(kept.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert_eq!(
            rejected[0].rejection.reasons(),
            vec!["stale: posted more than 7 days ago".to_string()]
        );
    }

    #[test]
    fn oversized_recency_window_keeps_everything() {
        let mut ancient = RawCandidate::new("https://acme.com/jobs/1001", SourceKind::LlmSearch);
        ancient.posted_at = Some(now() - chrono::Duration::days(3650));
        let postings = vec![Posting::from_candidate(ancient, now())];
        let (kept, rejected) = recency_gate(postings, i64::MAX, now());
        assert_eq!(kept.len(), 1);
        assert!(rejected.is_empty());
    }

    #[tokio::test]
    async fn candidates_load_from_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("batch.json");
        std::fs::write(
            &json,
            r#"[{"url":"https://boards.greenhouse.io/acme/jobs/555","source_kind":"direct_ats","platform_hint":"greenhouse"}]"#,
        )
        .unwrap();
        let yaml = dir.path().join("batch.yaml");
        std::fs::write(
            &yaml,
            "candidates:\n  - url: https://acme.com/jobs/1\n    source_kind: llm_search\n    company: Acme\n",
        )
        .unwrap();

        let from_json = load_candidates(&json).await.unwrap();
        assert_eq!(from_json[0].source_kind, SourceKind::DirectAts);
        let from_yaml = load_candidates(&yaml).await.unwrap();
        assert_eq!(from_yaml[0].company.as_deref(), Some("Acme"));
    }

    #[test]
    fn client_config_follows_scan_limits() {
        let mut config = ScanConfig::from_env();
        config.workers = 4;
        config.per_host_limit = 3;
        config.retries = 1;
        config.host_refill_ms = 0;
        let http = config.http_client_config();
        assert_eq!(http.global_concurrency, 4);
        assert_eq!(http.per_host_concurrency, 3);
        assert_eq!(http.backoff.max_retries, 1);
        assert!(http.token_bucket.is_none());
    }
}
