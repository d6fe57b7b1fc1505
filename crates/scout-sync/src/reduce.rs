//! Outcome Reducer: turns per-posting outcomes into the notify set and commits deliveries.

use chrono::{DateTime, Utc};
use scout_core::{Posting, RejectedPosting, Rejection, ValidationOutcome, ValidationStatus};
use scout_storage::{EmailMark, LedgerError, SeenLedger};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct Reduced {
    pub notify: Vec<Posting>,
    pub rejected: Vec<RejectedPosting>,
}

pub struct OutcomeReducer<'a> {
    ledger: &'a dyn SeenLedger,
}

impl<'a> OutcomeReducer<'a> {
    pub fn new(ledger: &'a dyn SeenLedger) -> Self {
        Self { ledger }
    }

    /// Walks survivors in order. `Open` postings get exactly one `mark_emailed`; everything else
    /// stays "seen, not emailed" so a later run re-validates it. A survivor without an outcome
    /// is treated as `Unreachable`.
    pub async fn reduce(
        &self,
        survivors: Vec<Posting>,
        outcomes: Vec<ValidationOutcome>,
        now: DateTime<Utc>,
    ) -> Result<Reduced, LedgerError> {
        let mut out = Reduced::default();
        let mut outcomes = outcomes.into_iter();

        for posting in survivors {
            let outcome = outcomes
                .next()
                .unwrap_or_else(|| ValidationOutcome::unreachable("no validation outcome"));

            if !outcome.is_open() {
                log_rejection(&posting, &outcome);
                out.rejected.push(RejectedPosting {
                    posting,
                    rejection: Rejection::Validation {
                        status: outcome.status,
                        reasons: outcome.reasons,
                    },
                });
                continue;
            }

            match self.ledger.mark_emailed(&posting.fingerprint, now).await? {
                EmailMark::Marked => out.notify.push(posting),
                EmailMark::AlreadyMarked => {
                    warn!(
                        fingerprint = %posting.fingerprint,
                        "delivery already recorded by another writer"
                    );
                    out.rejected.push(RejectedPosting {
                        posting,
                        rejection: Rejection::AlreadyDelivered,
                    });
                }
            }
        }

        Ok(out)
    }
}

fn log_rejection(posting: &Posting, outcome: &ValidationOutcome) {
    let reasons = outcome.reasons.join("; ");
    match outcome.status {
        ValidationStatus::Suspicious => {
            info!(
                fingerprint = %posting.fingerprint,
                %reasons,
                "suspicious: degraded or fabricated url"
            )
        }
        status => info!(
            fingerprint = %posting.fingerprint,
            %status,
            %reasons,
            "rejected by validation"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scout_core::{RawCandidate, SourceKind};
    use scout_storage::MemoryLedger;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 7, 0, 0).single().unwrap()
    }

    fn posting(url: &str) -> Posting {
        Posting::from_candidate(RawCandidate::new(url, SourceKind::DirectAts), now())
    }

    #[tokio::test]
    async fn only_open_postings_are_marked_and_order_is_kept() {
        let ledger = MemoryLedger::new();
        let survivors = vec![
            posting("https://acme.com/jobs/1001"),
            posting("https://acme.com/jobs/1002"),
            posting("https://acme.com/jobs/1003"),
        ];
        let outcomes = vec![
            ValidationOutcome::open(vec!["ok".into()]),
            ValidationOutcome::closed("closure phrase"),
            ValidationOutcome::open(vec!["ok".into()]),
        ];
        let reduced = OutcomeReducer::new(&ledger)
            .reduce(survivors.clone(), outcomes, now())
            .await
            .unwrap();

        let notified = reduced.notify.iter().map(|p| p.source_url.as_str()).collect::<Vec<_>>();
        assert_eq!(notified, vec!["https://acme.com/jobs/1001", "https://acme.com/jobs/1003"]);
        assert_eq!(reduced.rejected.len(), 1);
        assert_eq!(reduced.rejected[0].rejection.status(), Some(ValidationStatus::Closed));

        let closed = ledger.lookup(&survivors[1].fingerprint).await.unwrap();
        assert!(closed.is_none(), "reducer never writes for rejected postings");
        assert_eq!(ledger.stats(now()).await.unwrap().emailed, 2);
    }

    #[tokio::test]
    async fn already_marked_posting_is_not_notified_twice() {
        let ledger = MemoryLedger::new();
        let p = posting("https://acme.com/jobs/1001");
        ledger.mark_emailed(&p.fingerprint, now()).await.unwrap();

        let reduced = OutcomeReducer::new(&ledger)
            .reduce(vec![p], vec![ValidationOutcome::open(vec![])], now())
            .await
            .unwrap();
        assert!(reduced.notify.is_empty());
        assert_eq!(reduced.rejected[0].rejection, Rejection::AlreadyDelivered);
    }

    #[tokio::test]
    async fn missing_outcome_is_unreachable() {
        let ledger = MemoryLedger::new();
        let reduced = OutcomeReducer::new(&ledger)
            .reduce(vec![posting("https://acme.com/jobs/1")], vec![], now())
            .await
            .unwrap();
        assert_eq!(reduced.rejected[0].rejection.status(), Some(ValidationStatus::Unreachable));
    }
}
