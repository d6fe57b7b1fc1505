//! Content inspection of a fetched posting page.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;

use crate::rules::ValidationRules;
use crate::AdapterError;

/// Everything the validation gates need to know about one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSignals {
    pub closure_phrase: Option<String>,
    /// `validThrough` of an embedded schema.org `JobPosting`, when present and parseable.
    pub valid_through: Option<DateTime<Utc>>,
    pub has_job_posting_schema: bool,
    pub has_posting_description: bool,
    pub apply_evidence: Option<String>,
    pub listing_indicators: Vec<String>,
}

impl PageSignals {
    pub fn expired_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.valid_through.filter(|through| *through < now)
    }

    pub fn has_single_posting_content(&self) -> bool {
        self.has_job_posting_schema || self.has_posting_description
    }

    /// Aggregate-listing markers with no sign of a single posting.
    pub fn looks_like_listing(&self) -> bool {
        !self.listing_indicators.is_empty() && !self.has_single_posting_content()
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css:?}: {e}")))
}

fn collapsed_text(document: &Html) -> String {
    document
        .root_element()
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

const DESCRIPTION_SELECTOR: &str = concat!(
    "[class*=\"job-description\"], [id*=\"job-description\"], ",
    "[class*=\"posting-description\"], [itemprop=\"description\"], ",
    "[data-automation-id=\"jobPostingDescription\"]",
);

pub fn inspect_page(html: &str, rules: &ValidationRules) -> Result<PageSignals, AdapterError> {
    let document = Html::parse_document(html);
    let text = collapsed_text(&document);
    let markup = html.to_lowercase();

    let closure_phrase = rules
        .closure_phrases
        .iter()
        .find(|phrase| text.contains(phrase.as_str()))
        .cloned()
        .or_else(|| expiry_notice(&text, &rules.expiry_nouns));

    let postings = job_postings(&document)?;
    let valid_through = postings
        .iter()
        .filter_map(|posting| posting.get("validThrough").and_then(JsonValue::as_str))
        .filter_map(parse_valid_through)
        .min();

    let has_posting_description = document
        .select(&selector(DESCRIPTION_SELECTOR)?)
        .next()
        .is_some();

    Ok(PageSignals {
        closure_phrase,
        valid_through,
        has_job_posting_schema: !postings.is_empty(),
        has_posting_description,
        apply_evidence: apply_evidence(&document, &markup, rules)?,
        listing_indicators: listing_indicators(&document, &text, rules)?,
    })
}

fn job_postings(document: &Html) -> Result<Vec<JsonValue>, AdapterError> {
    let mut out = Vec::new();
    for script in document.select(&selector("script[type=\"application/ld+json\"]")?) {
        let raw = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(raw.trim()) else {
            continue;
        };
        collect_job_postings(value, &mut out);
    }
    Ok(out)
}

fn collect_job_postings(value: JsonValue, out: &mut Vec<JsonValue>) {
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .for_each(|item| collect_job_postings(item, out)),
        JsonValue::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                collect_job_postings(graph, out);
            }
            let is_posting = match map.get("@type") {
                Some(JsonValue::String(t)) => t == "JobPosting",
                Some(JsonValue::Array(types)) => {
                    types.iter().any(|t| t.as_str() == Some("JobPosting"))
                }
                _ => false,
            };
            if is_posting {
                out.push(JsonValue::Object(map));
            }
        }
        _ => {}
    }
}

fn parse_valid_through(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    // A bare date stays valid through the end of that day.
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .map(|naive| naive.and_utc())
}

/// A standalone "expired" with a posting noun close by, e.g. "this job posting is expired" or
/// "listing expired". Returns the surrounding words.
fn expiry_notice(text: &str, nouns: &[String]) -> Option<String> {
    let words = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    for (i, word) in words.iter().enumerate() {
        if *word != "expired" || (i > 0 && matches!(words[i - 1], "not" | "never")) {
            continue;
        }
        let window = &words[i.saturating_sub(3)..(i + 4).min(words.len())];
        if window.iter().any(|w| nouns.iter().any(|n| n == w)) {
            return Some(window.join(" "));
        }
    }
    None
}

fn mentions_apply(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower.contains("apply") && !lower.contains("applied")
}

fn element_apply_evidence(el: ElementRef<'_>) -> Option<String> {
    let name = el.value().name();
    let label = el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ");
    if mentions_apply(&label) {
        return Some(format!("{name} \"{label}\""));
    }
    for attr in ["href", "action", "value", "aria-label", "data-qa"] {
        if let Some(value) = el.value().attr(attr) {
            if mentions_apply(value) {
                return Some(format!("{name} {attr}={value}"));
            }
        }
    }
    None
}

fn apply_evidence(
    document: &Html,
    markup: &str,
    rules: &ValidationRules,
) -> Result<Option<String>, AdapterError> {
    let controls = selector("a, button, form, input[type=\"submit\"], input[type=\"button\"]")?;
    if let Some(found) = document.select(&controls).find_map(element_apply_evidence) {
        return Ok(Some(found));
    }
    Ok(rules
        .apply_phrases
        .iter()
        .find(|phrase| markup.contains(phrase.as_str()))
        .map(|phrase| format!("markup \"{phrase}\"")))
}

fn job_count_mention(text: &str, nouns: &[String]) -> Option<String> {
    let words = text
        .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    for (i, word) in words.iter().enumerate() {
        let digits = word.trim_end_matches('+').replace(',', "");
        let Ok(count) = digits.parse::<u32>() else {
            continue;
        };
        if count < 2 {
            continue;
        }
        for noun in nouns {
            let noun_words = noun.split_whitespace().collect::<Vec<_>>();
            let follows = words
                .get(i + 1..i + 1 + noun_words.len())
                .is_some_and(|next| {
                    next.iter()
                        .zip(&noun_words)
                        .all(|(w, n)| w.trim_end_matches(is_trailing_punct) == *n)
                });
            if follows {
                return Some(format!("{count} {noun}"));
            }
        }
    }
    None
}

fn is_trailing_punct(c: char) -> bool {
    matches!(c, ':' | '.' | ',')
}

fn listing_indicators(
    document: &Html,
    text: &str,
    rules: &ValidationRules,
) -> Result<Vec<String>, AdapterError> {
    let mut indicators = Vec::new();

    if let Some(mention) = job_count_mention(text, &rules.job_count_nouns) {
        indicators.push(format!("job count \"{mention}\""));
    }

    let filter_controls = document
        .select(&selector("select, [class*=\"filter\"], [id*=\"filter\"]")?)
        .count();
    if filter_controls > 0 || rules.filter_phrases.iter().any(|p| text.contains(p.as_str())) {
        indicators.push("filter controls".to_string());
    }

    let job_links = document
        .select(&selector("a[href]")?)
        .filter_map(|a| a.value().attr("href"))
        .map(str::to_lowercase)
        .filter(|href| {
            ["/job/", "/jobs/", "/positions/", "/openings/", "/careers/"]
                .iter()
                .any(|marker| href.contains(marker))
        })
        .collect::<BTreeSet<_>>();
    if job_links.len() >= rules.listing_link_threshold {
        indicators.push(format!("{} job links", job_links.len()));
    }

    Ok(indicators)
}
