use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use scout_adapters::ValidationRules;
use scout_core::{
    canonicalize, Fingerprint, RawCandidate, Rejection, SeenRecord, SourceKind, ValidationStatus,
};
use scout_storage::{
    EmailMark, FetchError, LedgerError, LedgerStats, MemoryLedger, SeenLedger, SqliteLedger,
    StubFetcher,
};
use scout_sync::{RunOptions, ScanConfig, ScanOutcome, ScanPipeline};

const OPEN_PAGE: &str = r#"<html><body><h1>Software Engineering Intern</h1>
<div class="job-description">Summer 2027 internship.</div>
<a class="apply-button" href="/apply">Apply now</a></body></html>"#;

const CAREERS_INDEX: &str = r#"<html><body><h1>Careers at Acme</h1><p>42 open positions</p>
<select name="team"><option>All teams</option></select>
<a href="/careers/eng">Engineering</a><a href="/apply">Apply now</a></body></html>"#;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 7, 0, 0).single().unwrap()
}

fn config() -> ScanConfig {
    let mut config = ScanConfig::from_env();
    config.workers = 4;
    config.run_timeout_secs = 10;
    config.recency_days = 7;
    config
}

fn pipeline(stub: &StubFetcher, ledger: Arc<dyn SeenLedger>) -> ScanPipeline {
    ScanPipeline::with_parts(config(), Arc::new(stub.clone()), ledger, ValidationRules::default())
}

fn direct(url: &str) -> RawCandidate {
    RawCandidate::new(url, SourceKind::DirectAts)
}

fn search(url: &str) -> RawCandidate {
    RawCandidate::new(url, SourceKind::LlmSearch)
}

fn notified(outcome: &ScanOutcome) -> Vec<&str> {
    outcome.notify.iter().map(|p| p.source_url.as_str()).collect()
}

fn reasons_for(outcome: &ScanOutcome, url: &str) -> Vec<String> {
    outcome
        .rejected
        .iter()
        .filter(|r| r.posting.source_url == url)
        .flat_map(|r| r.rejection.reasons())
        .collect()
}

fn options(force: bool) -> RunOptions {
    RunOptions {
        force,
        ..Default::default()
    }
}

/// Counts writes per fingerprint on top of a [`MemoryLedger`].
#[derive(Default)]
struct CountingLedger {
    inner: MemoryLedger,
    upserts: Mutex<HashMap<String, usize>>,
}

impl CountingLedger {
    fn upserts_for(&self, fingerprint: &str) -> usize {
        self.upserts.lock().unwrap().get(fingerprint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SeenLedger for CountingLedger {
    async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<SeenRecord>, LedgerError> {
        self.inner.lookup(fingerprint).await
    }

    async fn upsert_seen(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        *self.upserts.lock().unwrap().entry(fingerprint.to_string()).or_default() += 1;
        self.inner.upsert_seen(fingerprint, at).await
    }

    async fn mark_emailed(
        &self,
        fingerprint: &Fingerprint,
        at: DateTime<Utc>,
    ) -> Result<EmailMark, LedgerError> {
        self.inner.mark_emailed(fingerprint, at).await
    }

    async fn recent(&self, since: DateTime<Utc>) -> Result<Vec<SeenRecord>, LedgerError> {
        self.inner.recent(since).await
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<LedgerStats, LedgerError> {
        self.inner.stats(since).await
    }
}

struct UnavailableLedger;

#[async_trait]
impl SeenLedger for UnavailableLedger {
    async fn lookup(&self, _fingerprint: &Fingerprint) -> Result<Option<SeenRecord>, LedgerError> {
        Err(LedgerError::Unavailable("disk gone".into()))
    }

    async fn upsert_seen(
        &self,
        _fingerprint: &Fingerprint,
        _at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        Err(LedgerError::Unavailable("disk gone".into()))
    }

    async fn mark_emailed(
        &self,
        _fingerprint: &Fingerprint,
        _at: DateTime<Utc>,
    ) -> Result<EmailMark, LedgerError> {
        Err(LedgerError::Unavailable("disk gone".into()))
    }

    async fn recent(&self, _since: DateTime<Utc>) -> Result<Vec<SeenRecord>, LedgerError> {
        Err(LedgerError::Unavailable("disk gone".into()))
    }

    async fn stats(&self, _since: DateTime<Utc>) -> Result<LedgerStats, LedgerError> {
        Err(LedgerError::Unavailable("disk gone".into()))
    }
}

#[tokio::test]
async fn second_identical_run_notifies_nothing() {
    let stub = StubFetcher::new()
        .with_page("https://careers.acme.com/jobs/48213", OPEN_PAGE)
        .with_page("https://globex.com/careers/intern-7731", OPEN_PAGE);
    let ledger: Arc<dyn SeenLedger> = Arc::new(SqliteLedger::in_memory().await.unwrap());
    let scan = pipeline(&stub, ledger);
    let batch = vec![
        direct("https://careers.acme.com/jobs/48213?utm_source=newsletter"),
        search("https://globex.com/careers/intern-7731"),
    ];

    let first = scan.run_once(batch.clone(), options(false), now()).await.unwrap();
    assert_eq!(first.notify.len(), 2);

    let second = scan.run_once(batch, options(false), now()).await.unwrap();
    assert!(second.notify.is_empty());
    assert!(second
        .rejected
        .iter()
        .all(|r| r.rejection == Rejection::intake("already seen, not forced")));
}

#[tokio::test]
async fn emailed_postings_stay_excluded_even_when_forced() {
    let url = "https://careers.acme.com/jobs/48213";
    let stub = StubFetcher::new().with_page(url, OPEN_PAGE);
    let ledger = Arc::new(MemoryLedger::new());
    let scan = pipeline(&stub, ledger.clone());

    let first = scan.run_once(vec![direct(url)], options(false), now()).await.unwrap();
    assert_eq!(notified(&first), vec![url]);
    let emailed_at = ledger
        .lookup(&canonicalize(url).fingerprint)
        .await
        .unwrap()
        .unwrap()
        .emailed_at;

    let later = now() + Duration::days(1);
    let forced = scan.run_once(vec![direct(url)], options(true), later).await.unwrap();
    assert!(forced.notify.is_empty());
    assert_eq!(reasons_for(&forced, url), vec!["already emailed".to_string()]);

    let record = ledger.lookup(&canonicalize(url).fingerprint).await.unwrap().unwrap();
    assert_eq!(record.emailed_at, emailed_at);
    assert_eq!(record.last_seen_at, later);
    assert_eq!(stub.calls_to(url), 1, "emailed posting is never re-validated");
}

#[tokio::test]
async fn force_revalidates_seen_but_unemailed_postings() {
    let url = "https://careers.acme.com/jobs/48213";
    let stub = StubFetcher::new().with_page(url, "<h1>Intern</h1><p>Applications open soon.</p>");
    let ledger = Arc::new(MemoryLedger::new());
    let scan = pipeline(&stub, ledger.clone());

    let first = scan.run_once(vec![direct(url)], options(false), now()).await.unwrap();
    assert!(first.notify.is_empty());
    assert_eq!(reasons_for(&first, url), vec!["no apply mechanism found".to_string()]);

    // The page now carries an apply button.
    let _ = stub.clone().with_page(url, OPEN_PAGE);

    let unforced = scan.run_once(vec![direct(url)], options(false), now()).await.unwrap();
    assert!(unforced.notify.is_empty());
    assert_eq!(reasons_for(&unforced, url), vec!["already seen, not forced".to_string()]);

    let forced = scan.run_once(vec![direct(url)], options(true), now()).await.unwrap();
    assert_eq!(notified(&forced), vec![url]);
}

#[tokio::test]
async fn search_result_redirected_to_careers_page_is_suspicious() {
    let url = "https://boards.greenhouse.io/acme/jobs/555";
    let stub = StubFetcher::new().with_redirect(url, "https://acme.com/careers", CAREERS_INDEX);
    let ledger = Arc::new(MemoryLedger::new());
    let scan = pipeline(&stub, ledger.clone());

    let outcome = scan.run_once(vec![search(url)], options(false), now()).await.unwrap();
    assert!(outcome.notify.is_empty());
    assert_eq!(outcome.summary.counts.suspicious, 1);
    let rejection = &outcome.rejected[0].rejection;
    assert_eq!(rejection.status(), Some(ValidationStatus::Suspicious));
    assert_eq!(rejection.reasons()[0], "resolved to generic listing page");

    let record = ledger.lookup(&canonicalize(url).fingerprint).await.unwrap().unwrap();
    assert!(record.emailed_at.is_none());
}

#[tokio::test]
async fn batch_duplicates_upsert_once_and_validate_once() {
    let canonical = "https://boards.greenhouse.io/acme/jobs/555";
    let stub = StubFetcher::new()
        .with_page(canonical, OPEN_PAGE)
        .with_page("https://boards-api.greenhouse.io/v1/boards/acme/jobs/555", r#"{"id":555}"#);
    let ledger = Arc::new(CountingLedger::default());
    let scan = pipeline(&stub, ledger.clone());

    let outcome = scan
        .run_once(
            vec![
                direct("https://boards.greenhouse.io/acme/jobs/555?gh_src=linkedin"),
                search("https://job-boards.greenhouse.io/acme/jobs/555?utm_medium=feed"),
            ],
            options(false),
            now(),
        )
        .await
        .unwrap();

    assert_eq!(ledger.upserts_for("greenhouse/acme/555"), 1);
    assert_eq!(stub.calls_to(canonical), 1);
    assert_eq!(outcome.notify.len(), 1);
    assert_eq!(
        reasons_for(&outcome, "https://job-boards.greenhouse.io/acme/jobs/555?utm_medium=feed"),
        vec!["duplicate within batch".to_string()]
    );
}

#[tokio::test]
async fn posting_seen_ten_days_ago_is_dropped_as_already_seen() {
    let url = "https://careers.acme.com/jobs/48213";
    let stub = StubFetcher::new().with_page(url, OPEN_PAGE);
    let ledger = Arc::new(MemoryLedger::new());
    ledger
        .upsert_seen(&canonicalize(url).fingerprint, now() - Duration::days(10))
        .await
        .unwrap();
    let scan = pipeline(&stub, ledger);

    let outcome = scan.run_once(vec![search(url)], options(false), now()).await.unwrap();
    assert!(outcome.notify.is_empty());
    assert_eq!(reasons_for(&outcome, url), vec!["already seen, not forced".to_string()]);
    assert_eq!(stub.call_count(), 0);
}

#[tokio::test]
async fn stale_postings_never_touch_the_ledger() {
    let url = "https://careers.acme.com/jobs/48213";
    let stub = StubFetcher::new().with_page(url, OPEN_PAGE);
    let ledger = Arc::new(MemoryLedger::new());
    let scan = pipeline(&stub, ledger.clone());

    let mut candidate = search(url);
    candidate.posted_at = Some(now() - Duration::days(9));
    let outcome = scan.run_once(vec![candidate], options(true), now()).await.unwrap();
    assert_eq!(reasons_for(&outcome, url), vec!["stale: posted more than 7 days ago".to_string()]);
    assert!(ledger.lookup(&canonicalize(url).fingerprint).await.unwrap().is_none());
}

#[tokio::test]
async fn ambiguous_evidence_never_yields_open() {
    let urls = [
        "https://a.example.com/jobs/1001",
        "https://b.example.com/jobs/1002",
        "https://c.example.com/jobs/1003",
        "https://d.example.com/jobs/1004",
        "not even a url",
    ];
    let stub = StubFetcher::new()
        .with_status(urls[0], 403)
        .with_error(urls[1], FetchError::Timeout { url: urls[1].into() })
        .with_page(urls[2], "<h1>Intern</h1><p>Nothing to click.</p>")
        .with_error(
            urls[3],
            FetchError::Redirect {
                url: urls[3].into(),
                message: "redirect loop".into(),
            },
        );
    let ledger = Arc::new(MemoryLedger::new());
    let scan = pipeline(&stub, ledger.clone());

    let outcome = scan
        .run_once(urls.iter().map(|u| direct(u)).collect(), options(false), now())
        .await
        .unwrap();
    assert!(outcome.notify.is_empty());
    assert_eq!(outcome.rejected.len(), urls.len());
    assert_eq!(outcome.summary.counts.errored, 4);
    assert_eq!(reasons_for(&outcome, urls[4]), vec!["unparseable URL".to_string()]);
    assert_eq!(ledger.stats(now()).await.unwrap().emailed, 0);
}

#[tokio::test]
async fn dry_run_reports_without_writing_the_durable_ledger() {
    let url = "https://careers.acme.com/jobs/48213";
    let stub = StubFetcher::new().with_page(url, OPEN_PAGE);
    let ledger = Arc::new(MemoryLedger::new());
    let scan = pipeline(&stub, ledger.clone());

    let dry = RunOptions {
        dry_run: true,
        ..Default::default()
    };
    let preview = scan.run_once(vec![direct(url)], dry, now()).await.unwrap();
    assert_eq!(notified(&preview), vec![url]);
    assert_eq!(ledger.stats(now()).await.unwrap().total, 0);

    let real = scan.run_once(vec![direct(url)], options(false), now()).await.unwrap();
    assert_eq!(notified(&real), vec![url]);
}

#[tokio::test]
async fn max_results_truncates_the_batch() {
    let stub = StubFetcher::new()
        .with_page("https://acme.com/jobs/1001", OPEN_PAGE)
        .with_page("https://acme.com/jobs/1002", OPEN_PAGE);
    let scan = pipeline(&stub, Arc::new(MemoryLedger::new()));
    let limited = RunOptions {
        max_results: Some(1),
        ..Default::default()
    };
    let outcome = scan
        .run_once(
            vec![direct("https://acme.com/jobs/1001"), direct("https://acme.com/jobs/1002")],
            limited,
            now(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.summary.counts.candidates, 1);
    assert_eq!(notified(&outcome), vec!["https://acme.com/jobs/1001"]);
}

#[tokio::test]
async fn unavailable_ledger_aborts_the_run() {
    let stub = StubFetcher::new().with_page("https://acme.com/jobs/1001", OPEN_PAGE);
    let scan = pipeline(&stub, Arc::new(UnavailableLedger));
    let result = scan
        .run_once(vec![direct("https://acme.com/jobs/1001")], options(false), now())
        .await;
    assert!(result.is_err());
    assert_eq!(stub.call_count(), 0);
}

#[tokio::test]
async fn sqlite_run_writes_report_directory() {
    let dir = tempfile::tempdir().unwrap();
    let db = format!("sqlite://{}", dir.path().join("scout.db").display());
    let mut config = config();
    config.reports_dir = dir.path().join("reports");

    let stub = StubFetcher::new().with_page("https://acme.com/jobs/1001", OPEN_PAGE);
    let ledger = Arc::new(SqliteLedger::connect(&db).await.unwrap());
    let scan = ScanPipeline::with_parts(config, Arc::new(stub), ledger, ValidationRules::default());

    let (outcome, report_dir) = scan
        .run_and_report(vec![direct("https://acme.com/jobs/1001")], options(false), now())
        .await
        .unwrap();
    assert_eq!(outcome.notify.len(), 1);
    for name in ["digest.md", "run.json", "manifest.json"] {
        assert!(report_dir.join(name).is_file(), "{name} missing");
    }
    let digest = std::fs::read_to_string(report_dir.join("digest.md")).unwrap();
    assert!(digest.contains("https://acme.com/jobs/1001"));
}
