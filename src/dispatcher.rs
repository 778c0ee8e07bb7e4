use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::types::ListingSnapshot;

/// Anything that can turn a listing URL into a snapshot.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<ListingSnapshot>;
}

/// Result of one background fetch, handed to the report callback.
pub type FetchReport = (String, anyhow::Result<ListingSnapshot>);

/// Process-lifetime set of canonical URLs already handed out for fetching.
/// Membership only grows.
#[derive(Debug, Clone, Default)]
pub struct SeenUrls {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SeenUrls {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `url` was not seen before and is now recorded.
    pub fn insert(&self, url: &str) -> bool {
        match self.inner.lock() {
            Ok(mut set) => set.insert(url.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(url.to_string()),
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        match self.inner.lock() {
            Ok(set) => set.contains(url),
            Err(poisoned) => poisoned.into_inner().contains(url),
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(set) => set.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fire-and-forget listing fetches.
///
/// [`ListingDispatcher::dispatch`] never awaits: URLs go onto an unbounded
/// queue drained by a small worker pool, and every outcome is passed to the
/// report callback instead of the caller.
pub struct ListingDispatcher {
    seen: SeenUrls,
    queue: mpsc::UnboundedSender<String>,
}

impl ListingDispatcher {
    pub fn spawn<F, R>(fetcher: Arc<F>, workers: usize, report: R) -> Self
    where
        F: SnapshotFetcher + ?Sized + 'static,
        R: Fn(FetchReport) + Send + Sync + 'static,
    {
        let (queue, rx) = mpsc::unbounded_channel::<String>();
        let report = Arc::new(report);
        let workers = workers.max(1);

        tokio::spawn(async move {
            UnboundedReceiverStream::new(rx)
                .for_each_concurrent(workers, |url| {
                    let fetcher = fetcher.clone();
                    let report = report.clone();
                    async move {
                        debug!("fetching listing snapshot for {}", url);
                        let res = fetcher.fetch(&url).await;
                        report((url, res));
                    }
                })
                .await;
        });

        ListingDispatcher {
            seen: SeenUrls::new(),
            queue,
        }
    }

    /// Queues `url` unless it was dispatched before. Returns whether it was queued.
    pub fn dispatch(&self, url: &str) -> bool {
        if url.is_empty() || !self.seen.insert(url) {
            return false;
        }
        if let Err(e) = self.queue.send(url.to_string()) {
            error!("listing worker pool is gone, dropping {}: {}", url, e);
            return false;
        }
        true
    }

    pub fn seen(&self) -> &SeenUrls {
        &self.seen
    }
}

/// Default report: print the snapshot, log failures.
pub fn print_report((url, res): FetchReport) {
    match res {
        Ok(snapshot) => {
            println!("[LISTING] Snapshot for {}", snapshot.final_url);
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("could not serialize snapshot for {}: {}", url, e),
            }
        }
        Err(e) => error!("[LISTING] failed to fetch '{}': {:#}", url, e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::types::{Content, PageKind, PageMeta};

    struct CountingFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SnapshotFetcher for CountingFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<ListingSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("render failed for {}", url);
            }
            Ok(ListingSnapshot {
                requested_url: url.into(),
                final_url: url.into(),
                status: Some(200),
                kind: PageKind::Product,
                needs_review: false,
                meta: PageMeta::default(),
                json_ld: vec![],
                content: Content::default(),
                reviews: None,
                pricing: vec![],
                fetch_errors: vec![],
                profile: None,
                products: vec![],
                failed_products: vec![],
            })
        }
    }

    #[test]
    fn seen_urls_only_grow() {
        let seen = SeenUrls::new();
        assert!(seen.insert("https://whop.com/a"));
        assert!(!seen.insert("https://whop.com/a"));
        assert!(seen.insert("https://whop.com/b"));
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("https://whop.com/a"));
    }

    #[tokio::test]
    async fn dispatches_each_url_once() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let dispatcher = ListingDispatcher::spawn(fetcher.clone(), 2, move |(url, res)| {
            assert!(res.is_ok());
            tx.send(url).unwrap();
        });

        assert!(dispatcher.dispatch("https://whop.com/iris-out-5c"));
        assert!(!dispatcher.dispatch("https://whop.com/iris-out-5c"));
        assert!(dispatcher.dispatch("https://whop.com/other"));
        assert!(!dispatcher.dispatch(""));

        let mut done = vec![];
        for _ in 0..2 {
            let url = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            done.push(url);
        }
        done.sort();
        assert_eq!(done, vec!["https://whop.com/iris-out-5c", "https://whop.com/other"]);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.seen().len(), 2);
    }

    #[tokio::test]
    async fn failed_fetches_are_reported_not_retried() {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<bool>();
        let dispatcher = ListingDispatcher::spawn(fetcher.clone(), 1, move |(_, res)| {
            tx.send(res.is_err()).unwrap();
        });

        assert!(dispatcher.dispatch("https://whop.com/broken"));
        let failed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(failed);
        assert!(!dispatcher.dispatch("https://whop.com/broken"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
