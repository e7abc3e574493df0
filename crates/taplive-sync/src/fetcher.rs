//! Snapshot fetcher
//!
//! Pulls the two read models (totals and the top-N ranking) from the backend.
//! Results are cached per query key and shared by every mounted dashboard, so
//! a newly mounted view can show the last good numbers right away. At most
//! one request per key is in flight at any time; overlapping callers wait for
//! it and share its outcome.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use taplive_core::{
    LiveError, RankedList, RankedProduct, Result, Snapshot, SubjectId, Totals,
};
use tokio::sync::watch;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Backend read models
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_totals(&self, subject: SubjectId) -> Result<Totals>;

    async fn fetch_top_products(&self, subject: SubjectId, limit: usize)
        -> Result<Vec<RankedProduct>>;
}

/// HTTP implementation of the pull endpoints
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpSnapshotSource {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LiveError::Fetch(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LiveError::Fetch(format!("GET {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            return Err(LiveError::Fetch(format!("GET {} returned {}: {}", url, status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| LiveError::Fetch(format!("Failed to parse {}: {}", url, e)))
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_totals(&self, subject: SubjectId) -> Result<Totals> {
        self.get(&format!("/events/{}/totals", subject), &[]).await
    }

    async fn fetch_top_products(
        &self,
        subject: SubjectId,
        limit: usize,
    ) -> Result<Vec<RankedProduct>> {
        self.get(
            &format!("/events/{}/top-products", subject),
            &[("limit", limit.to_string())],
        )
        .await
    }
}

/// Cache key: subject plus query parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Totals { subject: SubjectId },
    TopProducts { subject: SubjectId, limit: usize },
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Totals { subject } => write!(f, "totals/{}", subject),
            Self::TopProducts { subject, limit } => write!(f, "top-products/{}?limit={}", subject, limit),
        }
    }
}

/// Outcome of a finished fetch, as seen by callers that joined it
type Outcome = Option<std::result::Result<(), String>>;

#[derive(Default)]
struct Cache {
    in_flight: HashMap<QueryKey, watch::Receiver<Outcome>>,
    totals: HashMap<SubjectId, Snapshot>,
    top_products: HashMap<(SubjectId, usize), RankedList>,
}

fn lock(cache: &Mutex<Cache>) -> MutexGuard<'_, Cache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks a key in flight until dropped, including when the fetch is cancelled.
/// Dropping without an outcome sends joined callers back to fetch themselves.
struct InFlight {
    cache: Arc<Mutex<Cache>>,
    key: QueryKey,
    outcome: watch::Sender<Outcome>,
}

impl InFlight {
    fn finish<T>(&self, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        self.outcome.send_replace(Some(outcome));
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        lock(&self.cache).in_flight.remove(&self.key);
    }
}

/// Cached, overlap-free access to the read models
#[derive(Clone)]
pub struct SnapshotFetcher {
    source: Arc<dyn SnapshotSource>,
    cache: Arc<Mutex<Cache>>,
}

impl SnapshotFetcher {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            source,
            cache: Arc::new(Mutex::new(Cache::default())),
        }
    }

    /// Claim `key`, or wait for whoever holds it.
    ///
    /// Returns the guard when the caller must fetch, and `None` when a running
    /// fetch of the same key succeeded and its result is in the cache.
    async fn acquire(&self, key: QueryKey) -> Result<Option<InFlight>> {
        loop {
            let mut running = {
                let mut cache = lock(&self.cache);
                match cache.in_flight.get(&key) {
                    Some(running) => running.clone(),
                    None => {
                        let (outcome, running) = watch::channel(None);
                        cache.in_flight.insert(key, running);
                        return Ok(Some(InFlight {
                            cache: Arc::clone(&self.cache),
                            key,
                            outcome,
                        }));
                    }
                }
            };

            debug!("Joining running fetch of {}", key);
            let outcome: Outcome = match running.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone(),
                Err(_) => None,
            };
            match outcome {
                Some(Ok(())) => return Ok(None),
                Some(Err(message)) => return Err(LiveError::Fetch(message)),
                // The running fetch was cancelled
                None => continue,
            }
        }
    }

    /// Fetch totals and cache them as the subject's snapshot.
    ///
    /// A call that overlaps a running fetch of the same subject waits for it
    /// and shares its result instead of issuing a second request.
    pub async fn fetch_totals(&self, subject: SubjectId) -> Result<Snapshot> {
        let key = QueryKey::Totals { subject };
        let Some(in_flight) = self.acquire(key).await? else {
            return self
                .cached_totals(subject)
                .ok_or_else(|| LiveError::Other(format!("No cached result for {}", key)));
        };

        let result = self.source.fetch_totals(subject).await.map(Snapshot::new);
        if let Ok(snapshot) = &result {
            lock(&self.cache).totals.insert(subject, snapshot.clone());
        }
        in_flight.finish(&result);
        result
    }

    /// Fetch the top-`limit` ranking and cache it
    pub async fn fetch_top_products(&self, subject: SubjectId, limit: usize) -> Result<RankedList> {
        let key = QueryKey::TopProducts { subject, limit };
        let Some(in_flight) = self.acquire(key).await? else {
            return self
                .cached_top_products(subject, limit)
                .ok_or_else(|| LiveError::Other(format!("No cached result for {}", key)));
        };

        let result = self
            .source
            .fetch_top_products(subject, limit)
            .await
            .map(RankedList::new);
        if let Ok(list) = &result {
            lock(&self.cache)
                .top_products
                .insert((subject, limit), list.clone());
        }
        in_flight.finish(&result);
        result
    }

    pub fn cached_totals(&self, subject: SubjectId) -> Option<Snapshot> {
        lock(&self.cache).totals.get(&subject).cloned()
    }

    pub fn cached_top_products(&self, subject: SubjectId, limit: usize) -> Option<RankedList> {
        lock(&self.cache).top_products.get(&(subject, limit)).cloned()
    }

    pub fn is_in_flight(&self, key: QueryKey) -> bool {
        lock(&self.cache).in_flight.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taplive_core::SalesTotals;
    use tokio::sync::Notify;

    /// Source whose totals requests block until released
    struct GatedSource {
        gate: Notify,
        calls: AtomicUsize,
        fail: bool,
    }

    impl GatedSource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl SnapshotSource for GatedSource {
        async fn fetch_totals(&self, _subject: SubjectId) -> Result<Totals> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(LiveError::Fetch("503 Service Unavailable".to_string()));
            }
            Ok(Totals {
                sales: SalesTotals {
                    amount_cents: 1000,
                    units: 10,
                    order_count: 2,
                },
                ..Totals::default()
            })
        }

        async fn fetch_top_products(
            &self,
            _subject: SubjectId,
            limit: usize,
        ) -> Result<Vec<RankedProduct>> {
            Ok((0..limit as u64)
                .map(|i| RankedProduct {
                    product_id: i,
                    name: format!("Product {}", i),
                    units: 10 - i,
                    amount_cents: 1000,
                })
                .collect())
        }
    }

    async fn wait_in_flight(fetcher: &SnapshotFetcher, key: QueryKey) {
        while !fetcher.is_in_flight(key) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_overlapping_fetch_joins_running_one() {
        let source = GatedSource::new(false);
        let fetcher = SnapshotFetcher::new(source.clone());
        let key = QueryKey::Totals { subject: 1 };

        let first = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch_totals(1).await }
        });
        wait_in_flight(&fetcher, key).await;

        let second = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch_totals(1).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        source.gate.notify_one();
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(!fetcher.is_in_flight(key));
        assert_eq!(fetcher.cached_totals(1), Some(first));
    }

    #[tokio::test]
    async fn test_joined_caller_sees_failure() {
        let source = GatedSource::new(true);
        let fetcher = SnapshotFetcher::new(source.clone());
        let key = QueryKey::Totals { subject: 2 };

        let first = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch_totals(2).await }
        });
        wait_in_flight(&fetcher, key).await;
        let second = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch_totals(2).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        source.gate.notify_one();
        assert!(matches!(first.await.unwrap(), Err(LiveError::Fetch(_))));
        assert!(matches!(second.await.unwrap(), Err(LiveError::Fetch(_))));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_joined_caller_takes_over_cancelled_fetch() {
        let source = GatedSource::new(false);
        let fetcher = SnapshotFetcher::new(source.clone());
        let key = QueryKey::Totals { subject: 3 };

        let first = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch_totals(3).await }
        });
        wait_in_flight(&fetcher, key).await;
        let second = tokio::spawn({
            let fetcher = fetcher.clone();
            async move { fetcher.fetch_totals(3).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        first.abort();
        while source.calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        source.gate.notify_one();
        let snapshot = second.await.unwrap().unwrap();
        assert_eq!(snapshot.totals.sales.amount_cents, 1000);
        assert!(!fetcher.is_in_flight(key));
    }

    #[tokio::test]
    async fn test_failure_keeps_cache_and_clears_flag() {
        let source = GatedSource::new(true);
        let fetcher = SnapshotFetcher::new(source.clone());
        source.gate.notify_one();

        assert!(matches!(fetcher.fetch_totals(3).await, Err(LiveError::Fetch(_))));
        assert!(fetcher.cached_totals(3).is_none());
        assert!(!fetcher.is_in_flight(QueryKey::Totals { subject: 3 }));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_releases_key() {
        let source = GatedSource::new(false);
        let fetcher = SnapshotFetcher::new(source);

        let result =
            tokio::time::timeout(Duration::from_millis(10), fetcher.fetch_totals(2)).await;
        assert!(result.is_err());
        assert!(!fetcher.is_in_flight(QueryKey::Totals { subject: 2 }));
    }

    #[tokio::test]
    async fn test_top_products_cached_per_limit() {
        let fetcher = SnapshotFetcher::new(GatedSource::new(false));
        let five = fetcher.fetch_top_products(1, 5).await.unwrap();
        assert_eq!(five.items.len(), 5);
        assert_eq!(fetcher.cached_top_products(1, 5), Some(five));
        assert!(fetcher.cached_top_products(1, 10).is_none());
        assert!(fetcher.cached_top_products(2, 5).is_none());
    }

    #[test]
    fn test_query_key_display() {
        assert_eq!(QueryKey::Totals { subject: 4 }.to_string(), "totals/4");
        assert_eq!(
            QueryKey::TopProducts { subject: 4, limit: 5 }.to_string(),
            "top-products/4?limit=5"
        );
    }
}
