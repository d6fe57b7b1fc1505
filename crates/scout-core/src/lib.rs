//! Core domain model for the posting lifecycle: candidates, postings, ledger records and
//! validation outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod canonical;

pub use canonical::{canonicalize, Canonical, JobRef};

pub const CRATE_NAME: &str = "scout-core";

/// Where a candidate came from; decides which validation gates apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    DirectAts,
    LlmSearch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Greenhouse,
    Lever,
    Ashby,
    Workday,
    Generic,
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Greenhouse => "greenhouse",
            Platform::Lever => "lever",
            Platform::Ashby => "ashby",
            Platform::Workday => "workday",
            Platform::Generic => "generic",
            Platform::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a posting, derived from its canonical URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handoff record produced by source adapters (ATS fetchers, LLM search providers).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub url: String,
    pub source_kind: SourceKind,
    #[serde(default)]
    pub platform_hint: Option<Platform>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

impl RawCandidate {
    pub fn new(url: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            url: url.into(),
            source_kind,
            platform_hint: None,
            company: None,
            title: None,
            posted_at: None,
        }
    }
}

/// A candidate opportunity for this run. Built fresh every run and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub fingerprint: Fingerprint,
    pub source_url: String,
    /// `None` when the source URL could not be parsed.
    pub canonical_url: Option<String>,
    pub source_kind: SourceKind,
    pub platform: Platform,
    pub job: Option<JobRef>,
    pub discovered_at: DateTime<Utc>,
    pub company: Option<String>,
    pub title: Option<String>,
    pub posted_at: Option<DateTime<Utc>>,
}

impl Posting {
    pub fn from_candidate(candidate: RawCandidate, discovered_at: DateTime<Utc>) -> Self {
        let canonical = canonicalize(&candidate.url);
        let platform = match (canonical.platform, candidate.platform_hint) {
            (Platform::Generic, Some(hint)) if hint != Platform::Unknown => hint,
            (detected, _) => detected,
        };
        Self {
            fingerprint: canonical.fingerprint,
            source_url: candidate.url,
            canonical_url: canonical.canonical_url,
            source_kind: candidate.source_kind,
            platform,
            job: canonical.job,
            discovered_at,
            company: candidate.company,
            title: candidate.title,
            posted_at: candidate.posted_at,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.canonical_url.is_none()
    }

    /// Short human label for logs and reports.
    pub fn label(&self) -> String {
        match (&self.company, &self.title) {
            (Some(company), Some(title)) => format!("{company} - {title}"),
            (None, Some(title)) => title.clone(),
            (Some(company), None) => company.clone(),
            (None, None) => self.fingerprint.to_string(),
        }
    }
}

/// Dedup ledger entry, one per fingerprint. The only entity that outlives a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenRecord {
    pub fingerprint: Fingerprint,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Append-only: once set it is never cleared or overwritten.
    pub emailed_at: Option<DateTime<Utc>>,
}

impl SeenRecord {
    pub fn first_sighting(fingerprint: Fingerprint, at: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            first_seen_at: at,
            last_seen_at: at,
            emailed_at: None,
        }
    }

    pub fn was_emailed(&self) -> bool {
        self.emailed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Open,
    Closed,
    Unreachable,
    Suspicious,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Open => "open",
            ValidationStatus::Closed => "closed",
            ValidationStatus::Unreachable => "unreachable",
            ValidationStatus::Suspicious => "suspicious",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run verdict for one posting. `Open` is the only status that permits notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub status: ValidationStatus,
    pub reasons: Vec<String>,
}

impl ValidationOutcome {
    pub fn open(reasons: Vec<String>) -> Self {
        Self {
            status: ValidationStatus::Open,
            reasons,
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::single(ValidationStatus::Closed, reason)
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::single(ValidationStatus::Unreachable, reason)
    }

    pub fn suspicious(reasons: Vec<String>) -> Self {
        Self {
            status: ValidationStatus::Suspicious,
            reasons,
        }
    }

    fn single(status: ValidationStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reasons: vec![reason.into()],
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ValidationStatus::Open
    }
}

/// Why a posting was kept out of the notify set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Rejection {
    /// Dropped before validation (malformed, stale, duplicate, already seen or emailed).
    Intake { reason: String },
    /// Validated and found not `Open`.
    Validation {
        status: ValidationStatus,
        reasons: Vec<String>,
    },
    /// Found `Open` but another writer had already recorded the delivery.
    AlreadyDelivered,
}

impl Rejection {
    pub fn intake(reason: impl Into<String>) -> Self {
        Rejection::Intake {
            reason: reason.into(),
        }
    }

    pub fn reasons(&self) -> Vec<String> {
        match self {
            Rejection::Intake { reason } => vec![reason.clone()],
            Rejection::Validation { reasons, .. } => reasons.clone(),
            Rejection::AlreadyDelivered => vec!["already emailed".to_string()],
        }
    }

    pub fn status(&self) -> Option<ValidationStatus> {
        match self {
            Rejection::Validation { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPosting {
    pub posting: Posting,
    pub rejection: Rejection,
}
