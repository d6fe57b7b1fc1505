//! Platform availability probes + page inspection used by posting validation.
//!
//! Each ATS that exposes a structured "is this posting still listed" signal gets one
//! [`AvailabilityProbe`] implementation; [`probe_for`] is the registry. Platforms without
//! a probe fall through to content inspection only.

use async_trait::async_trait;
use scout_core::{Platform, Posting};
use scout_storage::{FetchError, PageFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub mod inspect;
pub mod rules;

pub use inspect::{inspect_page, PageSignals};
pub use rules::ValidationRules;

pub const CRATE_NAME: &str = "scout-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("no probe endpoint for {0}")]
    NoEndpoint(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid json from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What a platform's own API says about a posting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Listed { accepts_applications: bool },
    Unlisted(String),
    /// No structured signal; validation continues with content checks.
    Unknown(String),
}

#[async_trait]
pub trait AvailabilityProbe: Send + Sync {
    fn platform(&self) -> Platform;

    /// Detail endpoint for `posting`, when its URL carries enough to address one.
    fn endpoint(&self, posting: &Posting) -> Option<String>;

    fn interpret(&self, posting: &Posting, body: &JsonValue) -> Availability;

    async fn probe(&self, http: &dyn PageFetcher, run_id: Uuid, posting: &Posting) -> Availability {
        match self.try_probe(http, run_id, posting).await {
            Ok(availability) => availability,
            Err(AdapterError::Fetch(FetchError::HttpStatus { status: 404 | 410, .. })) => {
                Availability::Unlisted(format!("no longer listed on {}", self.platform()))
            }
            Err(err) => {
                debug!(
                    fingerprint = %posting.fingerprint,
                    error = %err,
                    "availability probe inconclusive"
                );
                Availability::Unknown(err.to_string())
            }
        }
    }

    async fn try_probe(
        &self,
        http: &dyn PageFetcher,
        run_id: Uuid,
        posting: &Posting,
    ) -> Result<Availability, AdapterError> {
        let url = self
            .endpoint(posting)
            .ok_or_else(|| AdapterError::NoEndpoint(posting.fingerprint.to_string()))?;
        let resp = http.fetch(run_id, &url).await?;
        let body: JsonValue = serde_json::from_slice(&resp.body)
            .map_err(|source| AdapterError::Json { url, source })?;
        Ok(self.interpret(posting, &body))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GreenhouseProbe;

#[async_trait]
impl AvailabilityProbe for GreenhouseProbe {
    fn platform(&self) -> Platform {
        Platform::Greenhouse
    }

    fn endpoint(&self, posting: &Posting) -> Option<String> {
        let job = posting.job.as_ref()?;
        Some(format!(
            "https://boards-api.greenhouse.io/v1/boards/{}/jobs/{}",
            job.company, job.job_id
        ))
    }

    fn interpret(&self, _posting: &Posting, body: &JsonValue) -> Availability {
        // The board API only serves live postings; closed ones 404.
        if body.get("id").is_some() {
            Availability::Listed { accepts_applications: true }
        } else {
            Availability::Unknown("greenhouse response without id".to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LeverProbe;

#[async_trait]
impl AvailabilityProbe for LeverProbe {
    fn platform(&self) -> Platform {
        Platform::Lever
    }

    fn endpoint(&self, posting: &Posting) -> Option<String> {
        let job = posting.job.as_ref()?;
        Some(format!("https://api.lever.co/v0/postings/{}/{}", job.company, job.job_id))
    }

    fn interpret(&self, _posting: &Posting, body: &JsonValue) -> Availability {
        match body.get("state").and_then(JsonValue::as_str) {
            Some("published") => Availability::Listed { accepts_applications: true },
            Some(state) => Availability::Unlisted(format!("lever posting state is {state}")),
            None if body.get("id").is_some() => Availability::Listed { accepts_applications: true },
            None => Availability::Unknown("lever response without id".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AshbyProbe;

#[async_trait]
impl AvailabilityProbe for AshbyProbe {
    fn platform(&self) -> Platform {
        Platform::Ashby
    }

    fn endpoint(&self, posting: &Posting) -> Option<String> {
        let job = posting.job.as_ref()?;
        Some(format!("https://api.ashbyhq.com/posting-api/job-board/{}", job.company))
    }

    fn interpret(&self, posting: &Posting, body: &JsonValue) -> Availability {
        let Some(job) = posting.job.as_ref() else {
            return Availability::Unknown("ashby posting without job id".to_string());
        };
        let Some(jobs) = body.get("jobs").and_then(JsonValue::as_array) else {
            return Availability::Unknown("ashby board response without jobs".to_string());
        };
        let found = jobs.iter().find(|entry| {
            entry
                .get("id")
                .and_then(JsonValue::as_str)
                .is_some_and(|id| id.eq_ignore_ascii_case(&job.job_id))
        });
        match found {
            None => Availability::Unlisted("no longer on ashby job board".to_string()),
            Some(entry) if entry.get("isListed").and_then(JsonValue::as_bool) == Some(false) => {
                Availability::Unlisted("ashby posting is unlisted".to_string())
            }
            Some(entry) => Availability::Listed {
                accepts_applications: entry.get("applyUrl").and_then(JsonValue::as_str).is_some()
                    || entry.get("jobUrl").and_then(JsonValue::as_str).is_some(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkdayProbe;

fn is_locale_segment(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    match bytes.len() {
        2 => bytes.iter().all(u8::is_ascii_lowercase),
        5 => {
            bytes[2] == b'-'
                && bytes[..2].iter().all(u8::is_ascii_alphabetic)
                && bytes[3..].iter().all(u8::is_ascii_alphabetic)
        }
        _ => false,
    }
}

#[async_trait]
impl AvailabilityProbe for WorkdayProbe {
    fn platform(&self) -> Platform {
        Platform::Workday
    }

    /// `https://{tenant}.wdN.myworkdayjobs.com/{locale?}/{site}/job/...` maps onto the CXS
    /// endpoint `https://{host}/wday/cxs/{tenant}/{site}/job/...`.
    fn endpoint(&self, posting: &Posting) -> Option<String> {
        let job = posting.job.as_ref()?;
        let url = Url::parse(posting.canonical_url.as_deref()?).ok()?;
        let host = url.host_str()?;
        let mut segments = url.path_segments()?.filter(|s| !s.is_empty()).collect::<Vec<_>>();
        if segments.first().is_some_and(|s| is_locale_segment(s)) {
            segments.remove(0);
        }
        let site = segments.first()?;
        let job_pos = segments.iter().position(|s| *s == "job")?;
        let rest = segments.get(job_pos..)?.join("/");
        Some(format!("https://{host}/wday/cxs/{}/{site}/{rest}", job.company))
    }

    fn interpret(&self, _posting: &Posting, body: &JsonValue) -> Availability {
        let Some(info) = body.get("jobPostingInfo") else {
            return Availability::Unknown("workday response without jobPostingInfo".to_string());
        };
        match info.get("canApply").and_then(JsonValue::as_bool) {
            Some(can_apply) => Availability::Listed {
                accepts_applications: can_apply,
            },
            None => Availability::Unknown("workday response without canApply".to_string()),
        }
    }
}

pub fn probe_for(platform: Platform) -> Option<Box<dyn AvailabilityProbe>> {
    match platform {
        Platform::Greenhouse => Some(Box::new(GreenhouseProbe)),
        Platform::Lever => Some(Box::new(LeverProbe)),
        Platform::Ashby => Some(Box::new(AshbyProbe)),
        Platform::Workday => Some(Box::new(WorkdayProbe)),
        Platform::Generic | Platform::Unknown => None,
    }
}
