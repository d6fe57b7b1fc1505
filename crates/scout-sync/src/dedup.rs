//! Dedup Filter: decides which postings are new enough to validate.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use scout_core::{Posting, RejectedPosting, Rejection};
use scout_storage::{LedgerError, SeenLedger};
use tracing::debug;

pub const UNPARSEABLE_URL: &str = "unparseable URL";
pub const DUPLICATE_IN_BATCH: &str = "duplicate within batch";
pub const ALREADY_EMAILED: &str = "already emailed";
pub const ALREADY_SEEN: &str = "already seen, not forced";

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub survivors: Vec<Posting>,
    pub rejected: Vec<RejectedPosting>,
}

impl DedupOutcome {
    fn reject(&mut self, posting: Posting, reason: &str) {
        debug!(fingerprint = %posting.fingerprint, reason, "dropped at dedup");
        self.rejected.push(RejectedPosting {
            posting,
            rejection: Rejection::intake(reason),
        });
    }
}

pub struct DedupFilter<'a> {
    ledger: &'a dyn SeenLedger,
}

impl<'a> DedupFilter<'a> {
    pub fn new(ledger: &'a dyn SeenLedger) -> Self {
        Self { ledger }
    }

    /// Runs single-threaded over the batch in input order. Every distinct, parseable fingerprint
    /// gets exactly one `upsert_seen(f, now)`; the record is read before that write so decisions
    /// reflect history prior to this run. Already-emailed postings are dropped even under `force`.
    pub async fn filter(
        &self,
        postings: Vec<Posting>,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<DedupOutcome, LedgerError> {
        let mut out = DedupOutcome::default();
        let mut batch = HashSet::new();

        for posting in postings {
            if posting.is_malformed() {
                out.reject(posting, UNPARSEABLE_URL);
                continue;
            }
            if !batch.insert(posting.fingerprint.clone()) {
                out.reject(posting, DUPLICATE_IN_BATCH);
                continue;
            }

            let record = self.ledger.lookup(&posting.fingerprint).await?;
            self.ledger.upsert_seen(&posting.fingerprint, now).await?;

            match record {
                Some(record) if record.was_emailed() => out.reject(posting, ALREADY_EMAILED),
                Some(_) if !force => out.reject(posting, ALREADY_SEEN),
                _ => out.survivors.push(posting),
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use scout_core::{RawCandidate, SourceKind};
    use scout_storage::MemoryLedger;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 7, 0, 0).single().unwrap()
    }

    fn posting(url: &str) -> Posting {
        Posting::from_candidate(RawCandidate::new(url, SourceKind::DirectAts), now())
    }

    fn reasons(out: &DedupOutcome) -> Vec<String> {
        out.rejected.iter().flat_map(|r| r.rejection.reasons()).collect()
    }

    #[tokio::test]
    async fn fresh_postings_survive_and_are_recorded() {
        let ledger = MemoryLedger::new();
        let out = DedupFilter::new(&ledger)
            .filter(vec![posting("https://boards.greenhouse.io/acme/jobs/1")], false, now())
            .await
            .unwrap();
        assert_eq!(out.survivors.len(), 1);
        let record = ledger.lookup(&out.survivors[0].fingerprint).await.unwrap().unwrap();
        assert_eq!(record.first_seen_at, now());
        assert!(record.emailed_at.is_none());
    }

    #[tokio::test]
    async fn malformed_and_duplicate_candidates_are_rejected_with_reasons() {
        let ledger = MemoryLedger::new();
        let out = DedupFilter::new(&ledger)
            .filter(
                vec![
                    posting("https://boards.greenhouse.io/acme/jobs/1?utm_source=a"),
                    posting("not a url"),
                    posting("https://boards.greenhouse.io/acme/jobs/1?gh_src=b"),
                ],
                false,
                now(),
            )
            .await
            .unwrap();
        assert_eq!(out.survivors.len(), 1);
        assert_eq!(
            out.survivors[0].source_url,
            "https://boards.greenhouse.io/acme/jobs/1?utm_source=a"
        );
        assert_eq!(
            reasons(&out),
            vec![UNPARSEABLE_URL.to_string(), DUPLICATE_IN_BATCH.to_string()]
        );
        assert_eq!(ledger.stats(now()).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn seen_postings_need_force_and_emailed_ones_never_pass() {
        let ledger = MemoryLedger::new();
        let earlier = now() - Duration::days(3);
        let seen = posting("https://jobs.lever.co/acme/5c1b2f0e-8a7d-4c43-9b0e-2f6f7d2a1e11");
        let emailed = posting("https://boards.greenhouse.io/acme/jobs/2");
        ledger.upsert_seen(&seen.fingerprint, earlier).await.unwrap();
        ledger.upsert_seen(&emailed.fingerprint, earlier).await.unwrap();
        ledger.mark_emailed(&emailed.fingerprint, earlier).await.unwrap();

        let filter = DedupFilter::new(&ledger);
        let out = filter.filter(vec![seen.clone(), emailed.clone()], false, now()).await.unwrap();
        assert!(out.survivors.is_empty());
        assert_eq!(reasons(&out), vec![ALREADY_SEEN.to_string(), ALREADY_EMAILED.to_string()]);

        let out = filter.filter(vec![seen.clone(), emailed.clone()], true, now()).await.unwrap();
        assert_eq!(out.survivors.len(), 1);
        assert_eq!(out.survivors[0].fingerprint, seen.fingerprint);
        assert_eq!(reasons(&out), vec![ALREADY_EMAILED.to_string()]);

        // Recurrence advances last_seen even for rejected postings; emailed_at is untouched.
        let record = ledger.lookup(&emailed.fingerprint).await.unwrap().unwrap();
        assert_eq!(record.last_seen_at, now());
        assert_eq!(record.emailed_at, Some(earlier));
    }
}
