use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::cursor::{self, PageRequest};
use crate::data::PageSource;
use crate::error::FetchError;
use crate::model::{ItemId, Page, Record};
use crate::query::{LoadMode, PendingFetch, QueryCache, QueryEntry, QueryKey, QueryStatus};

/// Outcome of a completed fetch that was still current when it landed.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    Loaded {
        key: QueryKey,
        mode: LoadMode,
        items: usize,
    },
    Failed {
        key: QueryKey,
        mode: LoadMode,
        error: FetchError,
    },
}

impl FetchEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            FetchEvent::Loaded { key, .. } | FetchEvent::Failed { key, .. } => key,
        }
    }
}

struct FetchResponse<T> {
    key: QueryKey,
    request_id: u64,
    result: Result<Page<T>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Drives page requests for every key of one record type.
///
/// Requests run on worker threads; their results are applied only from
/// [`FetchCoordinator::poll`] on the owning thread, so the cache is never
/// touched concurrently. Each entry holds at most one pending request and a
/// completion whose request id no longer matches is dropped.
pub struct FetchCoordinator<T: Record> {
    cache: QueryCache<T>,
    source: Arc<dyn PageSource<T>>,
    page_size: usize,
    next_request_id: u64,
    response_tx: Sender<FetchResponse<T>>,
    response_rx: Receiver<FetchResponse<T>>,
}

impl<T: Record> FetchCoordinator<T> {
    pub fn new(source: Arc<dyn PageSource<T>>, page_size: usize, gc_after: Duration) -> Self {
        let (response_tx, response_rx) = unbounded();
        Self {
            cache: QueryCache::new(gc_after),
            source,
            page_size: page_size.max(1),
            next_request_id: 1,
            response_tx,
            response_rx,
        }
    }

    pub fn cache(&self) -> &QueryCache<T> {
        &self.cache
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn entry(&self, key: &QueryKey) -> Option<&QueryEntry<T>> {
        self.cache.get(key)
    }

    pub fn status(&self, key: &QueryKey) -> QueryStatus {
        self.cache
            .get(key)
            .map(QueryEntry::status)
            .unwrap_or_default()
    }

    pub fn has_more(&self, key: &QueryKey) -> bool {
        self.cache
            .get(key)
            .is_some_and(|entry| entry.has_more(self.page_size))
    }

    pub fn error(&self, key: &QueryKey) -> Option<&FetchError> {
        self.cache.get(key).and_then(QueryEntry::error)
    }

    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        self.cache.get(key).is_some_and(QueryEntry::is_fetching)
    }

    pub fn in_flight(&self) -> bool {
        self.cache
            .keys()
            .any(|key| self.cache.get(key).is_some_and(|e| e.pending.is_some()))
    }

    /// Registers a subscriber and fetches the first page when the entry is
    /// empty, errored or stale. A stale entry is reset first so the new
    /// subscriber never sees pages from before the invalidation.
    /// Returns true when a fetch was started.
    pub fn mount(&mut self, key: &QueryKey) -> bool {
        let entry = self.cache.subscribe(key);
        let stale = entry.is_stale();
        let needs_fetch = stale
            || entry.status() == QueryStatus::Error
            || (entry.pages().is_empty() && entry.status() != QueryStatus::Fetching);
        if stale {
            info!("query {key}: stale on mount, refetching from the first page");
            self.cache.reset(key);
        }
        needs_fetch && self.fetch_first_page(key)
    }

    pub fn unmount(&mut self, key: &QueryKey) {
        self.cache.unsubscribe(key);
    }

    pub fn mark_stale(&mut self, key: &QueryKey) -> bool {
        self.cache.mark_stale(key)
    }

    pub fn reset(&mut self, key: &QueryKey) {
        self.cache.reset(key);
    }

    /// No-op while a first-page fetch is already running. A running
    /// next-page fetch is superseded.
    pub fn fetch_first_page(&mut self, key: &QueryKey) -> bool {
        let entry = self.cache.ensure(key);
        if entry.status() == QueryStatus::Fetching {
            return false;
        }
        entry.cancel_pending();
        entry.set_status(QueryStatus::Fetching);
        let request = cursor::first_request(self.page_size);
        self.dispatch(key, request, LoadMode::Replace);
        true
    }

    /// No-op while any fetch is running, once the last page came back
    /// empty, or while the entry holds a first-page error. Requires a first
    /// page to continue from.
    pub fn fetch_next_page(&mut self, key: &QueryKey) -> bool {
        let page_size = self.page_size;
        let Some(entry) = self.cache.get_mut(key) else {
            return false;
        };
        if entry.is_fetching() || entry.status() == QueryStatus::Error {
            return false;
        }
        let Some(request) = entry.next_request(page_size) else {
            return false;
        };
        entry.set_status(QueryStatus::FetchingNext);
        self.dispatch(key, request, LoadMode::Append);
        true
    }

    fn dispatch(&mut self, key: &QueryKey, request: PageRequest, mode: LoadMode) {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cache.ensure(key).pending = Some(PendingFetch {
            request_id,
            cancel_flag: cancel_flag.clone(),
            mode,
        });
        debug!(
            "query {key}: request {request_id} after={:?} limit={}",
            request.after, request.limit
        );

        let tx = self.response_tx.clone();
        let source = self.source.clone();
        let key = key.clone();
        thread::spawn(move || {
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                source.fetch_page(&key, &request)
            }))
            .unwrap_or_else(|payload| {
                Err(anyhow!("page source panicked: {}", panic_message(&*payload)))
            });
            if cancel_flag.load(Ordering::SeqCst) {
                return;
            }
            let _ = tx.send(FetchResponse {
                key,
                request_id,
                result,
            });
        });
    }

    /// Applies every completion that has arrived, without blocking.
    pub fn poll(&mut self) -> Vec<FetchEvent> {
        let mut events = Vec::new();
        while let Ok(response) = self.response_rx.try_recv() {
            events.extend(self.apply(response));
        }
        events
    }

    /// Blocks until no request is pending or `timeout` elapses, applying
    /// completions as they arrive.
    pub fn settle(&mut self, timeout: Duration) -> Vec<FetchEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = self.poll();
        while self.in_flight() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(response) => events.extend(self.apply(response)),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        events
    }

    pub fn collect_garbage(&mut self, now: Instant) -> Vec<QueryKey> {
        self.cache.collect_garbage(now)
    }

    fn apply(&mut self, response: FetchResponse<T>) -> Option<FetchEvent> {
        let FetchResponse {
            key,
            request_id,
            result,
        } = response;
        let Some(entry) = self.cache.get_mut(&key) else {
            debug!("query {key}: dropping response {request_id} for torn down entry");
            return None;
        };
        let Some(pending) = entry.pending.take() else {
            debug!("query {key}: dropping unexpected response {request_id}");
            return None;
        };
        if pending.request_id != request_id || pending.cancel_flag.load(Ordering::SeqCst) {
            debug!(
                "query {key}: dropping superseded response {request_id} (current {})",
                pending.request_id
            );
            entry.pending = Some(pending);
            return None;
        }

        let mode = pending.mode;
        match result {
            Ok(page) => {
                let items = page.len();
                // a fresh first page also settles any earlier invalidation
                if mode == LoadMode::Replace {
                    entry.clear_pages();
                }
                entry.set_status(QueryStatus::Idle);
                entry.set_error(None);
                self.cache.append_page(&key, page);
                info!("query {key}: loaded {items} items ({mode:?})");
                Some(FetchEvent::Loaded { key, mode, items })
            }
            Err(err) => {
                let error = FetchError::Transport {
                    key: key.clone(),
                    message: format!("{err:#}"),
                };
                match mode {
                    LoadMode::Replace => {
                        entry.set_status(QueryStatus::Error);
                        entry.set_error(Some(error.clone()));
                    }
                    LoadMode::Append => entry.set_status(QueryStatus::Idle),
                }
                warn!("{error}");
                Some(FetchEvent::Failed { key, mode, error })
            }
        }
    }

    /// Items of every page in fetch order, first occurrence of each id only.
    /// Recomputed on every call.
    pub fn flattened_view(&self, key: &QueryKey) -> Flattened<'_, T> {
        let pages = self.cache.get(key).map(QueryEntry::pages).unwrap_or(&[]);
        Flattened::new(pages)
    }
}

pub struct Flattened<'a, T> {
    pages: &'a [Page<T>],
    page: usize,
    item: usize,
    seen: HashSet<ItemId>,
}

impl<'a, T> Flattened<'a, T> {
    fn new(pages: &'a [Page<T>]) -> Self {
        Self {
            pages,
            page: 0,
            item: 0,
            seen: HashSet::new(),
        }
    }
}

impl<'a, T: Record> Iterator for Flattened<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(page) = self.pages.get(self.page) {
            match page.items.get(self.item) {
                Some(item) => {
                    self.item += 1;
                    if self.seen.insert(item.id()) {
                        return Some(item);
                    }
                }
                None => {
                    self.page += 1;
                    self.item = 0;
                }
            }
        }
        None
    }
}
