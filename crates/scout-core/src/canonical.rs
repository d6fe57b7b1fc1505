//! URL canonicalization and fingerprint derivation.
//!
//! `canonicalize` is pure and deterministic. Recognized ATS URL shapes collapse to a
//! `{platform}/{company}/{job_id}` fingerprint; everything else is identified by its
//! normalized URL. Unparseable input never errors: it gets a `suspicious:` fingerprint
//! and no canonical URL.

use serde::{Deserialize, Serialize};
use url::{form_urlencoded, Url};

use crate::{Fingerprint, Platform};

/// Query parameters that only carry tracking/session noise.
const TRACKING_PARAMS: &[&str] = &[
    "ref",
    "source",
    "src",
    "fbclid",
    "gclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "gh_src",
    "lever_source",
    "lever_origin",
    "ashby_jid",
    "_ga",
    "_gl",
    "_hsenc",
    "_hsmi",
    "trk",
    "trkinfo",
    "sessionid",
    "session_id",
];

pub const MALFORMED_PREFIX: &str = "suspicious:";

/// Company + posting identifier recovered from a recognized ATS URL shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    pub company: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canonical {
    pub fingerprint: Fingerprint,
    pub canonical_url: Option<String>,
    pub platform: Platform,
    pub job: Option<JobRef>,
}

impl Canonical {
    pub fn is_malformed(&self) -> bool {
        self.canonical_url.is_none()
    }
}

pub fn canonicalize(raw_url: &str) -> Canonical {
    let trimmed = raw_url.trim();
    let Some(url) = parse_web_url(trimmed) else {
        return Canonical {
            fingerprint: Fingerprint::new(format!("{MALFORMED_PREFIX}{trimmed}")),
            canonical_url: None,
            platform: Platform::Unknown,
            job: None,
        };
    };

    let canonical_url = normalized_url(&url, false);
    let platform = detect_platform(url.host_str().unwrap_or_default());
    let job = recognize_job(platform, &url);
    let fingerprint = match &job {
        Some(job) => Fingerprint::new(format!("{}/{}/{}", platform, job.company, job.job_id)),
        None => Fingerprint::new(normalized_url(&url, true)),
    };

    Canonical {
        fingerprint,
        canonical_url: Some(canonical_url),
        platform,
        job,
    }
}

/// Parses `raw` as an absolute http(s) URL with a host.
pub fn parse_web_url(raw: &str) -> Option<Url> {
    let url = Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Some(url),
        _ => None,
    }
}

pub fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// `drop_www` is for identity only; the fetchable URL keeps the host as given.
fn normalized_url(url: &Url, drop_www: bool) -> String {
    let mut host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    if drop_www {
        if let Some(bare) = host.strip_prefix("www.") {
            host = bare.to_string();
        }
    }
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = url.path().trim_end_matches('/');

    let mut kept = url
        .query_pairs()
        .filter(|(k, v)| !v.is_empty() && !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect::<Vec<_>>();
    kept.sort();

    let mut out = format!("{}://{}{}{}", url.scheme(), host, port, path);
    if !kept.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept.iter())
            .finish();
        out.push('?');
        out.push_str(&query);
    }
    out
}

pub fn detect_platform(host: &str) -> Platform {
    let host = host.to_ascii_lowercase();
    if host == "greenhouse.io" || host.ends_with(".greenhouse.io") {
        Platform::Greenhouse
    } else if host.ends_with(".lever.co") {
        Platform::Lever
    } else if host.ends_with(".ashbyhq.com") {
        Platform::Ashby
    } else if host.ends_with(".myworkdayjobs.com") {
        Platform::Workday
    } else {
        Platform::Generic
    }
}

fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn recognize_job(platform: Platform, url: &Url) -> Option<JobRef> {
    let host = url.host_str().unwrap_or_default();
    let segments = path_segments(url);
    let (company, job_id) = match platform {
        Platform::Greenhouse => greenhouse_job(url, &segments)?,
        Platform::Lever => match segments.as_slice() {
            ["v0", "postings", company, id, ..] if host.starts_with("api.") => {
                (company.to_string(), id.to_string())
            }
            [company, id, ..] if is_posting_uuid(id) => (company.to_string(), id.to_string()),
            _ => return None,
        },
        Platform::Ashby => match segments.as_slice() {
            [company, id, ..] if is_posting_uuid(id) => (company.to_string(), id.to_string()),
            _ => return None,
        },
        Platform::Workday => return workday_job(host, &segments),
        Platform::Generic | Platform::Unknown => return None,
    };
    Some(JobRef {
        company: company.to_ascii_lowercase(),
        job_id: job_id.to_ascii_lowercase(),
    })
}

fn greenhouse_job(url: &Url, segments: &[&str]) -> Option<(String, String)> {
    match segments {
        ["v1", "boards", company, "jobs", id, ..] if is_numeric(id) => {
            Some((company.to_string(), id.to_string()))
        }
        // Embedded application iframes: /embed/job_app?for=<board>&token=<job id>
        ["embed", "job_app", ..] => {
            let mut board = None;
            let mut token = None;
            for (key, value) in url.query_pairs() {
                match key.as_ref() {
                    "for" => board = Some(value.into_owned()),
                    "token" => token = Some(value.into_owned()),
                    _ => {}
                }
            }
            let token = token.filter(|t| is_numeric(t))?;
            Some((board?, token))
        }
        [company, "jobs", id, ..] if is_numeric(id) => Some((company.to_string(), id.to_string())),
        _ => None,
    }
}

fn workday_job(host: &str, segments: &[&str]) -> Option<JobRef> {
    let tenant = host.split('.').next()?.to_ascii_lowercase();
    let job_pos = segments.iter().position(|s| *s == "job")?;
    let slug: &str = segments.get(job_pos + 1..)?.last()?;
    let requisition = match slug.rsplit_once('_') {
        Some((_, req)) if req.chars().any(|c| c.is_ascii_digit()) => req,
        _ => slug,
    };
    Some(JobRef {
        company: tenant,
        job_id: requisition.to_ascii_lowercase(),
    })
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

fn is_posting_uuid(s: &str) -> bool {
    s.len() >= 8 && s.contains('-') && s.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

/// Best-effort job identifier embedded in an arbitrary URL path: the last segment that
/// looks like a posting id (a numeric run of 3+ digits, a uuid, or an ATS-style slug ending
/// in a requisition number).
pub fn job_token_in_path(url: &Url) -> Option<String> {
    path_segments(url).into_iter().rev().find_map(|segment| {
        let lower = segment.to_ascii_lowercase();
        if is_posting_uuid(&lower) {
            return Some(lower);
        }
        let digits = lower.chars().filter(|c| c.is_ascii_digit()).count();
        if digits >= 3 {
            let token = match lower.rsplit_once(|c| c == '_' || c == '-') {
                Some((_, tail)) if tail.chars().filter(|c| c.is_ascii_digit()).count() >= 3 => tail,
                _ => lower.as_str(),
            };
            return Some(token.to_string());
        }
        None
    })
}
