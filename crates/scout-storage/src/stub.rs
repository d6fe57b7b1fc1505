//! Canned-response fetcher for exercising validation without the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use crate::{FetchError, FetchedResponse, PageFetcher};

#[derive(Debug, Clone)]
enum Canned {
    Page { final_url: String, body: String },
    Fail(FetchError),
}

#[derive(Debug, Clone)]
struct Entry {
    canned: Canned,
    delay: Option<Duration>,
}

/// Unknown URLs answer 404.
///
/// ```rust
/// use scout_storage::StubFetcher;
///
/// let stub = StubFetcher::new()
///     .with_page("https://jobs.lever.co/acme/1", "<a href='/apply'>Apply</a>")
///     .with_redirect(
///         "https://boards.greenhouse.io/acme/jobs/555",
///         "https://acme.com/careers",
///         "<h1>Careers</h1>",
///     );
/// assert_eq!(stub.call_count(), 0);
/// ```
#[derive(Debug, Default, Clone)]
pub struct StubFetcher {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, url: &str, canned: Canned) {
        guard(&self.entries).insert(url.to_string(), Entry { canned, delay: None });
    }

    pub fn with_page(self, url: &str, body: impl Into<String>) -> Self {
        self.insert(
            url,
            Canned::Page {
                final_url: url.to_string(),
                body: body.into(),
            },
        );
        self
    }

    /// Serves `body` as if `url` had redirected to `final_url`.
    pub fn with_redirect(self, url: &str, final_url: &str, body: impl Into<String>) -> Self {
        self.insert(
            url,
            Canned::Page {
                final_url: final_url.to_string(),
                body: body.into(),
            },
        );
        self
    }

    pub fn with_status(self, url: &str, status: u16) -> Self {
        self.insert(
            url,
            Canned::Fail(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
        );
        self
    }

    pub fn with_error(self, url: &str, error: FetchError) -> Self {
        self.insert(url, Canned::Fail(error));
        self
    }

    /// Holds the response for `url` back by `delay`.
    pub fn with_delay(self, url: &str, delay: Duration) -> Self {
        if let Some(entry) = guard(&self.entries).get_mut(url) {
            entry.delay = Some(delay);
        }
        self
    }

    pub fn call_count(&self) -> usize {
        guard(&self.calls).len()
    }

    pub fn calls(&self) -> Vec<String> {
        guard(&self.calls).clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        guard(&self.calls).iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, _run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        guard(&self.calls).push(url.to_string());
        let entry = guard(&self.entries).get(url).cloned();
        let Some(entry) = entry else {
            return Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        };

        if let Some(delay) = entry.delay {
            tokio::time::sleep(delay).await;
        }

        match entry.canned {
            Canned::Page { final_url, body } => Ok(FetchedResponse {
                status: StatusCode::OK,
                requested_url: url.to_string(),
                final_url,
                body: body.into_bytes(),
            }),
            Canned::Fail(err) => Err(err),
        }
    }
}
