//! Validation Pipeline: layered liveness checks run over a bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use scout_adapters::{inspect_page, probe_for, Availability, ValidationRules};
use scout_core::canonical::{canonicalize, job_token_in_path, parse_web_url};
use scout_core::{Posting, SourceKind, ValidationOutcome};
use scout_storage::{FetchError, FetchedResponse, PageFetcher};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const GENERIC_LISTING: &str = "resolved to generic listing page";
pub const HOST_CHANGED: &str = "redirected to different host";
pub const NO_APPLY: &str = "no apply mechanism found";
pub const RUN_TIMEOUT: &str = "run timeout reached before validation finished";

/// Checks one posting. Every path yields a definite outcome; nothing here returns an error.
pub struct PostingValidator {
    http: Arc<dyn PageFetcher>,
    rules: ValidationRules,
    run_id: Uuid,
    now: DateTime<Utc>,
}

impl PostingValidator {
    pub fn new(
        http: Arc<dyn PageFetcher>,
        rules: ValidationRules,
        run_id: Uuid,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            http,
            rules,
            run_id,
            now,
        }
    }

    pub async fn validate(&self, posting: &Posting) -> ValidationOutcome {
        let Some(url) = posting.canonical_url.as_deref() else {
            return ValidationOutcome::suspicious(vec![crate::dedup::UNPARSEABLE_URL.to_string()]);
        };

        // 1. reachability
        let resp = match self.http.fetch(self.run_id, url).await {
            Ok(resp) => resp,
            Err(err) => return ValidationOutcome::unreachable(unreachable_reason(&err)),
        };

        // 2. redirect-chain integrity for search-sourced URLs
        if posting.source_kind == SourceKind::LlmSearch {
            let reasons = self.integrity_reasons(posting, &resp);
            if !reasons.is_empty() {
                return ValidationOutcome::suspicious(reasons);
            }
        }

        // 3. structured platform signal
        let mut platform_evidence = None;
        if let Some(probe) = probe_for(posting.platform) {
            match probe.probe(self.http.as_ref(), self.run_id, posting).await {
                Availability::Unlisted(reason) => return ValidationOutcome::closed(reason),
                Availability::Listed {
                    accepts_applications: false,
                } => {
                    return ValidationOutcome::closed(format!(
                        "{} reports applications closed",
                        posting.platform
                    ))
                }
                Availability::Listed {
                    accepts_applications: true,
                } => {
                    platform_evidence =
                        Some(format!("{} api lists posting as open", posting.platform))
                }
                Availability::Unknown(reason) => {
                    debug!(
                        fingerprint = %posting.fingerprint,
                        %reason,
                        "no structured availability"
                    )
                }
            }
        }

        // 4. content heuristics
        let signals = match inspect_page(&resp.text(), &self.rules) {
            Ok(signals) => signals,
            Err(err) => {
                return ValidationOutcome::unreachable(format!("page inspection failed: {err}"))
            }
        };
        if let Some(phrase) = &signals.closure_phrase {
            return ValidationOutcome::closed(format!("closure phrase \"{phrase}\""));
        }
        if let Some(through) = signals.expired_at(self.now) {
            return ValidationOutcome::closed(format!(
                "posting expired (validThrough {})",
                through.format("%Y-%m-%d")
            ));
        }

        // 5. aggregate listing pages, before the apply gate since they carry apply links too
        if posting.source_kind == SourceKind::LlmSearch && signals.looks_like_listing() {
            return ValidationOutcome::suspicious(vec![format!(
                "generic listing page indicators: {}",
                signals.listing_indicators.join(", ")
            )]);
        }

        // 6. positive apply evidence
        let evidence = signals
            .apply_evidence
            .map(|found| format!("apply evidence: {found}"))
            .or(platform_evidence);
        match evidence {
            Some(evidence) => ValidationOutcome::open(vec![
                format!("reachable ({})", resp.status.as_u16()),
                evidence,
            ]),
            None => ValidationOutcome::closed(NO_APPLY),
        }
    }

    fn integrity_reasons(&self, posting: &Posting, resp: &FetchedResponse) -> Vec<String> {
        let mut reasons = Vec::new();
        let (Some(requested), Some(resolved)) = (
            parse_web_url(&resp.requested_url),
            parse_web_url(&resp.final_url),
        ) else {
            return reasons;
        };

        let token = posting
            .job
            .as_ref()
            .map(|job| job.job_id.clone())
            .or_else(|| job_token_in_path(&requested));
        let lost_token = match &token {
            Some(token) => {
                let resolved_job = canonicalize(&resp.final_url).job.map(|job| job.job_id);
                resolved_job.as_deref() != Some(token.as_str())
                    && !resp.final_url.to_lowercase().contains(token.as_str())
            }
            None => false,
        };
        let requested_segments = path_segments(&requested);
        let resolved_segments = path_segments(&resolved);
        let truncated = resolved_segments.len() < requested_segments.len()
            && requested_segments.starts_with(&resolved_segments);
        let collapsed_to_listing = truncated
            || (self.rules.is_listing_path(resolved.path())
                && !self.rules.is_listing_path(requested.path()));
        if lost_token || collapsed_to_listing {
            reasons.push(GENERIC_LISTING.to_string());
        }

        if site_of(&requested) != site_of(&resolved) {
            reasons.push(HOST_CHANGED.to_string());
        }
        reasons
    }
}

fn unreachable_reason(err: &FetchError) -> String {
    match err {
        FetchError::HttpStatus { status, .. } => format!("http status {status}"),
        FetchError::Timeout { .. } => "request timed out".to_string(),
        FetchError::Connect { message, .. } => format!("connection failed: {message}"),
        FetchError::Redirect { message, .. } => format!("unresolvable redirect: {message}"),
        FetchError::Transport { message, .. } => format!("request failed: {message}"),
        FetchError::InvalidUrl { .. } => crate::dedup::UNPARSEABLE_URL.to_string(),
    }
}

fn path_segments(url: &Url) -> Vec<String> {
    url.path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Registrable-domain approximation: last two labels, three under two-letter country
/// second-level zones such as `co.uk`.
const SECOND_LEVEL: &[&str] = &["co", "com", "ac", "org", "net", "gov", "edu"];

fn site_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let labels = host.split('.').collect::<Vec<_>>();
    let keep = match labels.as_slice() {
        [.., second, tld] if tld.len() == 2 && SECOND_LEVEL.contains(second) => 3,
        _ => 2,
    };
    labels[labels.len().saturating_sub(keep)..].join(".")
}

pub struct ValidationPipeline {
    validator: Arc<PostingValidator>,
    workers: usize,
    run_timeout: Duration,
}

impl ValidationPipeline {
    pub fn new(validator: PostingValidator, workers: usize, run_timeout: Duration) -> Self {
        Self {
            validator: Arc::new(validator),
            workers: workers.max(1),
            run_timeout,
        }
    }

    /// Validates all survivors concurrently. Outcomes come back in input order regardless of
    /// completion order. Work still outstanding at the run deadline is aborted and reported
    /// `Unreachable`.
    pub async fn validate_all(&self, postings: &[Posting]) -> Vec<ValidationOutcome> {
        let deadline = tokio::time::Instant::now() + self.run_timeout;
        let workers = Arc::new(Semaphore::new(self.workers));
        let mut slots: Vec<Option<ValidationOutcome>> = vec![None; postings.len()];
        let mut tasks = JoinSet::new();

        for (index, posting) in postings.iter().cloned().enumerate() {
            let validator = self.validator.clone();
            let workers = workers.clone();
            let span = info_span!(
                "validate",
                fingerprint = %posting.fingerprint,
                platform = %posting.platform
            );
            tasks.spawn(
                async move {
                    let outcome = match workers.acquire_owned().await {
                        Ok(_permit) => validator.validate(&posting).await,
                        Err(_) => ValidationOutcome::unreachable("validation worker pool closed"),
                    };
                    (index, outcome)
                }
                .instrument(span),
            );
        }

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, outcome)) => slots[index] = Some(outcome),
                    Err(err) => warn!(error = %err, "validation task failed"),
                }
            }
        })
        .await;

        let unresolved_reason = if drained.is_err() {
            warn!(
                outstanding = tasks.len(),
                "run timeout reached, aborting outstanding validation"
            );
            tasks.abort_all();
            RUN_TIMEOUT
        } else {
            "validation task did not complete"
        };

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| ValidationOutcome::unreachable(unresolved_reason)))
            .collect()
    }
}
