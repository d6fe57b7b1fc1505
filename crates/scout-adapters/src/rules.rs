//! Phrase and marker tables driving page inspection.
//!
//! Defaults are compiled in; `rules/validation.yaml` overrides them when present.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const CLOSURE_PHRASES: &[&str] = &[
    "this position has been filled",
    "this job is no longer available",
    "job no longer exists",
    "position is closed",
    "position closed",
    "no longer accepting applications",
    "this posting has expired",
    "job has expired",
    "posting has expired",
    "job has been removed",
    "position has been closed",
    "no longer open",
];

const APPLY_PHRASES: &[&str] = &[
    "apply now",
    "apply for this job",
    "submit application",
    "apply to this position",
    "apply for job",
    "class=\"apply",
    "id=\"apply",
    "apply-button",
    "btn-apply",
];

const JOB_COUNT_NOUNS: &[&str] = &[
    "jobs",
    "open jobs",
    "open positions",
    "open roles",
    "positions",
    "openings",
    "roles",
    "results",
    "opportunities",
];

const FILTER_PHRASES: &[&str] = &[
    "filter by",
    "all departments",
    "all locations",
    "all teams",
    "clear filters",
    "search jobs",
];

/// Words that, next to "expired", turn it into a closure notice ("this job posting is expired").
const EXPIRY_NOUNS: &[&str] = &[
    "job",
    "posting",
    "listing",
    "position",
    "role",
    "opening",
    "vacancy",
    "requisition",
];

const LISTING_PATHS: &[&str] = &[
    "careers",
    "jobs",
    "openings",
    "positions",
    "join-us",
    "join",
    "work-with-us",
];

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ValidationRules {
    /// Visible-text phrases that mark a posting as closed.
    pub closure_phrases: Vec<String>,
    /// Nouns within three words of a standalone "expired" that mark the posting as closed.
    pub expiry_nouns: Vec<String>,
    /// Markup or text fragments that count as an apply mechanism.
    pub apply_phrases: Vec<String>,
    /// Nouns that, preceded by a number ("42 open positions"), indicate an aggregate listing.
    pub job_count_nouns: Vec<String>,
    pub filter_phrases: Vec<String>,
    /// Distinct job-detail links at or above which a page reads as a listing.
    pub listing_link_threshold: usize,
    /// Path segments that, as the whole path, name a generic careers page.
    pub listing_paths: Vec<String>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            closure_phrases: owned(CLOSURE_PHRASES),
            expiry_nouns: owned(EXPIRY_NOUNS),
            apply_phrases: owned(APPLY_PHRASES),
            job_count_nouns: owned(JOB_COUNT_NOUNS),
            filter_phrases: owned(FILTER_PHRASES),
            listing_link_threshold: 5,
            listing_paths: owned(LISTING_PATHS),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ValidationRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(flatten)]
    rules: ValidationRules,
}

impl ValidationRules {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let file: ValidationRulesFile =
            serde_yaml::from_str(text).context("parsing validation rules")?;
        Ok(file.rules.lowercased())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// `rules/validation.yaml` under `root` when present, built-in defaults otherwise.
    pub fn from_workspace_root(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join("rules").join("validation.yaml");
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn lowercased(mut self) -> Self {
        for list in [
            &mut self.closure_phrases,
            &mut self.expiry_nouns,
            &mut self.apply_phrases,
            &mut self.job_count_nouns,
            &mut self.filter_phrases,
            &mut self.listing_paths,
        ] {
            for item in list.iter_mut() {
                *item = item.trim().to_lowercase();
            }
            list.retain(|item| !item.is_empty());
        }
        self.listing_link_threshold = self.listing_link_threshold.max(2);
        self
    }

    pub fn is_listing_path(&self, path: &str) -> bool {
        let trimmed = path.trim_matches('/').to_lowercase();
        if trimmed.is_empty() {
            return true;
        }
        let segments = trimmed.split('/').collect::<Vec<_>>();
        // "/careers", "/en/jobs", "/company/careers/openings"; anything after the listing word
        // names a specific posting.
        segments.len() <= 3
            && segments
                .last()
                .is_some_and(|last| self.listing_paths.iter().any(|p| p == last))
    }
}
