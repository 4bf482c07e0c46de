use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;

use crate::cursor::{self, PageRequest};
use crate::error::FetchError;
use crate::model::{ItemId, Page, Record};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Posts,
    Comments(ItemId),
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryKey::Posts => f.write_str("posts"),
            QueryKey::Comments(post) => write!(f, "comments/{post}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Idle,
    Fetching,
    FetchingNext,
    Error,
}

/// Whether a completed page replaces the entry (first page) or extends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Replace,
    Append,
}

#[derive(Debug)]
pub(crate) struct PendingFetch {
    pub(crate) request_id: u64,
    pub(crate) cancel_flag: Arc<AtomicBool>,
    pub(crate) mode: LoadMode,
}

impl PendingFetch {
    fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct QueryEntry<T> {
    pages: Vec<Page<T>>,
    status: QueryStatus,
    stale: bool,
    error: Option<FetchError>,
    subscribers: usize,
    inactive_since: Option<Instant>,
    pub(crate) pending: Option<PendingFetch>,
}

impl<T> Default for QueryEntry<T> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            status: QueryStatus::Idle,
            stale: false,
            error: None,
            subscribers: 0,
            inactive_since: None,
            pending: None,
        }
    }
}

impl<T: Record> QueryEntry<T> {
    pub fn pages(&self) -> &[Page<T>] {
        &self.pages
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    pub fn subscribers(&self) -> usize {
        self.subscribers
    }

    pub fn is_fetching(&self) -> bool {
        matches!(
            self.status,
            QueryStatus::Fetching | QueryStatus::FetchingNext
        )
    }

    /// Request for the page after the last one held, or `None` when nothing
    /// has been loaded yet or the stream has ended.
    pub fn next_request(&self, page_size: usize) -> Option<PageRequest> {
        self.pages
            .last()
            .and_then(|last| cursor::next_cursor(last, page_size))
    }

    pub fn has_more(&self, page_size: usize) -> bool {
        self.next_request(page_size).is_some()
    }

    pub fn item_count(&self) -> usize {
        self.pages.iter().map(Page::len).sum()
    }

    pub(crate) fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
    }

    pub(crate) fn set_error(&mut self, error: Option<FetchError>) {
        self.error = error;
    }

    pub(crate) fn clear_pages(&mut self) {
        self.pages.clear();
        self.stale = false;
    }

    pub(crate) fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}

/// Fetched pages per query key. Not internally synchronized: the fetch
/// coordinator is the single writer for each key.
#[derive(Debug)]
pub struct QueryCache<T> {
    entries: HashMap<QueryKey, QueryEntry<T>>,
    gc_after: Duration,
}

impl<T: Record> QueryCache<T> {
    pub fn new(gc_after: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            gc_after,
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<&QueryEntry<T>> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &QueryKey) -> Option<&mut QueryEntry<T>> {
        self.entries.get_mut(key)
    }

    pub fn ensure(&mut self, key: &QueryKey) -> &mut QueryEntry<T> {
        self.entries.entry(key.clone()).or_default()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.entries.keys()
    }

    pub fn append_page(&mut self, key: &QueryKey, page: Page<T>) {
        self.ensure(key).pages.push(page);
    }

    /// Returns false when the key has no entry.
    pub fn mark_stale(&mut self, key: &QueryKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Drops every page and any in-flight fetch, returning the entry to a
    /// fresh idle state. Subscribers are kept.
    pub fn reset(&mut self, key: &QueryKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.cancel_pending();
            entry.pages.clear();
            entry.status = QueryStatus::Idle;
            entry.stale = false;
            entry.error = None;
        }
    }

    pub fn subscribe(&mut self, key: &QueryKey) -> &mut QueryEntry<T> {
        let entry = self.ensure(key);
        entry.subscribers += 1;
        entry.inactive_since = None;
        entry
    }

    /// Returns true when the entry was torn down as a result.
    pub fn unsubscribe(&mut self, key: &QueryKey) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return false;
        }
        if self.gc_after.is_zero() {
            self.remove(key);
            return true;
        }
        entry.inactive_since = Some(Instant::now());
        false
    }

    /// Tears down entries that have had no subscribers for longer than the
    /// configured retention. Returns the removed keys.
    pub fn collect_garbage(&mut self, now: Instant) -> Vec<QueryKey> {
        let gc_after = self.gc_after;
        let expired: Vec<QueryKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .inactive_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= gc_after)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }

    fn remove(&mut self, key: &QueryKey) {
        if let Some(mut entry) = self.entries.remove(key) {
            entry.cancel_pending();
            debug!("query {key}: torn down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthorRef, FeedItem, MediaRef};
    use chrono::Utc;

    fn item(id: i64) -> FeedItem {
        FeedItem {
            id: ItemId(id),
            author: AuthorRef("author".into()),
            media: MediaRef::new(format!("https://media.test/{id}.mp4")),
            comment_count: 0,
            description: String::new(),
            created_at: Utc::now(),
        }
    }

    fn page(ids: &[i64]) -> Page<FeedItem> {
        Page::new(ids.iter().copied().map(item).collect())
    }

    #[test]
    fn ensure_creates_idle_entry_once() {
        let mut cache: QueryCache<FeedItem> = QueryCache::new(Duration::from_secs(60));
        assert!(cache.get(&QueryKey::Posts).is_none());
        cache.ensure(&QueryKey::Posts);
        cache.ensure(&QueryKey::Posts);
        assert_eq!(cache.len(), 1);
        let entry = cache.get(&QueryKey::Posts).unwrap();
        assert_eq!(entry.status(), QueryStatus::Idle);
        assert!(entry.pages().is_empty());
        assert!(!entry.is_stale());
    }

    #[test]
    fn append_preserves_fetch_order() {
        let mut cache = QueryCache::new(Duration::from_secs(60));
        cache.append_page(&QueryKey::Posts, page(&[1, 2]));
        cache.append_page(&QueryKey::Posts, page(&[3]));
        let entry = cache.get(&QueryKey::Posts).unwrap();
        assert_eq!(entry.pages().len(), 2);
        assert_eq!(entry.pages()[1].items[0].id, ItemId(3));
        assert_eq!(entry.item_count(), 3);
    }

    #[test]
    fn mark_stale_only_touches_existing_entries() {
        let mut cache: QueryCache<FeedItem> = QueryCache::new(Duration::from_secs(60));
        assert!(!cache.mark_stale(&QueryKey::Posts));
        cache.ensure(&QueryKey::Posts);
        assert!(cache.mark_stale(&QueryKey::Posts));
        assert!(cache.get(&QueryKey::Posts).unwrap().is_stale());
        assert!(!cache.contains(&QueryKey::Comments(ItemId(1))));
    }

    #[test]
    fn reset_drops_pages_and_clears_staleness() {
        let mut cache = QueryCache::new(Duration::from_secs(60));
        cache.append_page(&QueryKey::Posts, page(&[1, 2, 3]));
        cache.mark_stale(&QueryKey::Posts);
        cache.reset(&QueryKey::Posts);
        let entry = cache.get(&QueryKey::Posts).unwrap();
        assert!(entry.pages().is_empty());
        assert!(!entry.is_stale());
        assert_eq!(entry.status(), QueryStatus::Idle);
    }

    #[test]
    fn has_more_follows_last_page() {
        let mut cache = QueryCache::new(Duration::from_secs(60));
        assert!(!cache.ensure(&QueryKey::Posts).has_more(3));
        cache.append_page(&QueryKey::Posts, page(&[1, 2, 3]));
        assert!(cache.get(&QueryKey::Posts).unwrap().has_more(3));
        cache.append_page(&QueryKey::Posts, page(&[]));
        assert!(!cache.get(&QueryKey::Posts).unwrap().has_more(3));
    }

    #[test]
    fn last_unsubscribe_tears_down_without_retention() {
        let mut cache: QueryCache<FeedItem> = QueryCache::new(Duration::ZERO);
        cache.subscribe(&QueryKey::Posts);
        cache.subscribe(&QueryKey::Posts);
        assert!(!cache.unsubscribe(&QueryKey::Posts));
        assert!(cache.contains(&QueryKey::Posts));
        assert!(cache.unsubscribe(&QueryKey::Posts));
        assert!(!cache.contains(&QueryKey::Posts));
    }

    #[test]
    fn garbage_collection_respects_retention_and_resubscribe() {
        let mut cache: QueryCache<FeedItem> = QueryCache::new(Duration::from_secs(300));
        let comments = QueryKey::Comments(ItemId(7));
        cache.subscribe(&QueryKey::Posts);
        cache.subscribe(&comments);
        cache.unsubscribe(&QueryKey::Posts);
        cache.unsubscribe(&comments);
        cache.subscribe(&comments);

        let now = Instant::now();
        assert!(cache.collect_garbage(now).is_empty());
        let removed = cache.collect_garbage(now + Duration::from_secs(301));
        assert_eq!(removed, vec![QueryKey::Posts]);
        assert!(cache.contains(&comments));
    }

    #[test]
    fn key_display_names_stream() {
        assert_eq!(QueryKey::Posts.to_string(), "posts");
        assert_eq!(QueryKey::Comments(ItemId(42)).to_string(), "comments/42");
    }
}
