use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::Config;
use crate::data::{CommentService, MemoryBackend, PageSource, PostService};
use crate::error::{FetchError, MutationError};
use crate::fetch::{FetchCoordinator, FetchEvent, Flattened};
use crate::model::{AuthorRef, Comment, FeedItem, ItemId};
use crate::mutation::{Invalidate, MutationBus, PostDraft};
use crate::playback::{MediaResourceFactory, PlaybackManager, PlaybackState, PlayerOptions};
use crate::query::{LoadMode, QueryKey, QueryStatus};
use crate::viewport::{render_range, ViewportTracker, VisibilityEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceOptions {
    pub page_size: usize,
    /// Remaining items after the active one at which the next page is requested.
    pub prefetch_threshold: usize,
    pub render_window: usize,
    pub visibility_threshold: f32,
    pub gc_after: Duration,
    pub player: PlayerOptions,
}

impl Default for SurfaceOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SurfaceOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            page_size: cfg.feed.page_size,
            prefetch_threshold: cfg.feed.prefetch_threshold,
            render_window: cfg.feed.render_window,
            visibility_threshold: cfg.viewport.visibility_threshold,
            gc_after: cfg.cache.gc_after,
            player: PlayerOptions {
                looping: cfg.player.loop_playback,
            },
        }
    }
}

/// Everything the surface talks to outside the process.
#[derive(Clone)]
pub struct Backends {
    pub posts: Arc<dyn PageSource<FeedItem>>,
    pub comments: Arc<dyn PageSource<Comment>>,
    pub post_service: Arc<dyn PostService>,
    pub comment_service: Arc<dyn CommentService>,
    pub media: Arc<dyn MediaResourceFactory>,
}

impl Backends {
    pub fn memory(backend: Arc<MemoryBackend>, media: Arc<dyn MediaResourceFactory>) -> Self {
        Self {
            posts: backend.clone(),
            comments: backend.clone(),
            post_service: backend.clone(),
            comment_service: backend,
            media,
        }
    }
}

/// Routes invalidations to whichever coordinator owns the key.
struct SurfaceCaches<'a> {
    posts: &'a mut FetchCoordinator<FeedItem>,
    comments: &'a mut FetchCoordinator<Comment>,
}

impl Invalidate for SurfaceCaches<'_> {
    fn invalidate(&mut self, key: &QueryKey) -> bool {
        match key {
            QueryKey::Posts => self.posts.invalidate(key),
            QueryKey::Comments(_) => self.comments.invalidate(key),
        }
    }
}

/// The vertical feed: paged posts, the active item, the players around it
/// and the comment sheet of one post at a time.
pub struct FeedSurface {
    options: SurfaceOptions,
    posts: FetchCoordinator<FeedItem>,
    comments: FetchCoordinator<Comment>,
    viewport: ViewportTracker,
    playback: PlaybackManager,
    mutations: MutationBus,
    open_comments: Option<ItemId>,
    mounted: bool,
}

impl FeedSurface {
    pub fn new(options: SurfaceOptions, backends: Backends) -> Self {
        let posts = FetchCoordinator::new(backends.posts, options.page_size, options.gc_after);
        let comments =
            FetchCoordinator::new(backends.comments, options.page_size, options.gc_after);
        Self {
            posts,
            comments,
            viewport: ViewportTracker::new(options.visibility_threshold),
            playback: PlaybackManager::new(backends.media, options.player),
            mutations: MutationBus::new(backends.post_service, backends.comment_service),
            open_comments: None,
            mounted: false,
            options,
        }
    }

    pub fn options(&self) -> &SurfaceOptions {
        &self.options
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// The feed screen appeared. Starts the first page when nothing usable
    /// is cached and gives the screen focus.
    pub fn on_mount(&mut self) {
        if self.mounted {
            return;
        }
        self.mounted = true;
        self.posts.mount(&QueryKey::Posts);
        if self.open_comments.is_none() {
            self.playback.on_focus();
        }
        self.sync_render();
    }

    /// The feed screen went away: every player is released and the cached
    /// pages become eligible for collection.
    pub fn on_unmount(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        self.close_comments();
        self.playback.release_all();
        self.posts.unmount(&QueryKey::Posts);
    }

    pub fn on_focus(&mut self) {
        if self.mounted && self.open_comments.is_none() {
            self.playback.on_focus();
        }
    }

    pub fn on_blur(&mut self) {
        self.playback.on_blur();
    }

    /// Pull to refresh.
    pub fn refresh(&mut self) -> bool {
        self.posts.fetch_first_page(&QueryKey::Posts)
    }

    pub fn fetch_next_page(&mut self) -> bool {
        self.posts.fetch_next_page(&QueryKey::Posts)
    }

    /// Applies finished fetches of both coordinators without blocking.
    pub fn poll(&mut self) -> Vec<FetchEvent> {
        let mut events = self.posts.poll();
        events.extend(self.comments.poll());
        self.after_fetch(&events);
        events
    }

    /// Waits up to `timeout` for outstanding fetches, including the next
    /// pages that landing pages trigger.
    pub fn settle(&mut self, timeout: Duration) -> Vec<FetchEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut batch = self.posts.settle(remaining);
            batch.extend(self.comments.settle(remaining));
            self.after_fetch(&batch);
            events.extend(batch);
            let busy = self.posts.in_flight() || self.comments.in_flight();
            if !busy || Instant::now() >= deadline {
                break;
            }
        }
        events
    }

    /// Feeds one visibility report from the list. Returns the new active
    /// index when it moved.
    pub fn observe_visibility(&mut self, event: &VisibilityEvent) -> Option<usize> {
        let changed = self.viewport.observe(event)?;
        debug!("feed: active item -> {changed}");
        self.playback.set_active(changed);
        self.sync_render();
        self.maybe_request_more();
        Some(changed)
    }

    /// Shows the comment sheet of `post`. The feed loses focus so its
    /// active player pauses.
    pub fn open_comments(&mut self, post: ItemId) {
        if self.open_comments == Some(post) {
            return;
        }
        self.close_comments();
        self.comments.mount(&QueryKey::Comments(post));
        self.open_comments = Some(post);
        self.playback.on_blur();
    }

    pub fn close_comments(&mut self) {
        let Some(post) = self.open_comments.take() else {
            return;
        };
        self.comments.unmount(&QueryKey::Comments(post));
        if self.mounted {
            self.playback.on_focus();
        }
    }

    pub fn comments_open_for(&self) -> Option<ItemId> {
        self.open_comments
    }

    pub fn fetch_more_comments(&mut self) -> bool {
        match self.open_comments {
            Some(post) => self.comments.fetch_next_page(&QueryKey::Comments(post)),
            None => false,
        }
    }

    pub fn create_post(
        &mut self,
        author: &AuthorRef,
        draft: &mut PostDraft,
    ) -> Result<FeedItem, MutationError> {
        let mut caches = SurfaceCaches {
            posts: &mut self.posts,
            comments: &mut self.comments,
        };
        self.mutations.create_post(author, draft, &mut caches)
    }

    /// Posts a comment. When the sheet for that post is open its list is
    /// mounted again so it refetches from the first page.
    pub fn create_comment(
        &mut self,
        author: &AuthorRef,
        post: ItemId,
        body: &str,
    ) -> Result<Comment, MutationError> {
        let mut caches = SurfaceCaches {
            posts: &mut self.posts,
            comments: &mut self.comments,
        };
        let created = self
            .mutations
            .create_comment(author, post, body, &mut caches)?;
        if self.open_comments == Some(post) {
            let key = QueryKey::Comments(post);
            self.comments.unmount(&key);
            self.comments.mount(&key);
        }
        Ok(created)
    }

    pub fn items(&self) -> Flattened<'_, FeedItem> {
        self.posts.flattened_view(&QueryKey::Posts)
    }

    pub fn item_count(&self) -> usize {
        self.items().count()
    }

    pub fn comments(&self, post: ItemId) -> Flattened<'_, Comment> {
        self.comments.flattened_view(&QueryKey::Comments(post))
    }

    pub fn status(&self) -> QueryStatus {
        self.posts.status(&QueryKey::Posts)
    }

    pub fn comments_status(&self, post: ItemId) -> QueryStatus {
        self.comments.status(&QueryKey::Comments(post))
    }

    pub fn has_more(&self) -> bool {
        self.posts.has_more(&QueryKey::Posts)
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.posts.error(&QueryKey::Posts)
    }

    pub fn active_index(&self) -> usize {
        self.viewport.active_index()
    }

    pub fn playback_state(&self, index: usize) -> Option<PlaybackState> {
        self.playback.state(index)
    }

    pub fn playing_index(&self) -> Option<usize> {
        self.playback.playing_index()
    }

    pub fn playing_count(&self) -> usize {
        self.playback.playing_count()
    }

    pub fn rendered(&self) -> Vec<usize> {
        self.playback.mounted().collect()
    }

    fn after_fetch(&mut self, events: &[FetchEvent]) {
        let replaced = events.iter().any(|event| {
            matches!(
                event,
                FetchEvent::Loaded {
                    key: QueryKey::Posts,
                    mode: LoadMode::Replace,
                    ..
                }
            )
        });
        if replaced {
            info!("feed: first page replaced the list, back to item 0");
            self.playback.unmount_all();
            self.viewport.reset();
            self.playback.set_active(0);
        }
        if events.iter().any(|event| *event.key() == QueryKey::Posts) {
            self.sync_render();
        }
        // failures wait for the user to retry
        let loaded = events.iter().any(|event| {
            matches!(
                event,
                FetchEvent::Loaded {
                    key: QueryKey::Posts,
                    ..
                }
            )
        });
        if loaded {
            self.maybe_request_more();
        }

        let now = Instant::now();
        for key in self.posts.collect_garbage(now) {
            debug!("query {key}: collected");
        }
        for key in self.comments.collect_garbage(now) {
            debug!("query {key}: collected");
        }
    }

    /// Mounts players for the render window around the active item and
    /// releases everything outside it.
    fn sync_render(&mut self) {
        if !self.mounted {
            return;
        }
        let items: Vec<&FeedItem> = self.posts.flattened_view(&QueryKey::Posts).collect();
        self.viewport.set_rendered(items.len());
        let window = render_range(self.viewport.active_index(), items.len(), self.options.render_window);

        let outside: Vec<usize> = self
            .playback
            .mounted()
            .filter(|index| !window.contains(index))
            .collect();
        for index in outside {
            self.playback.on_unmount(index);
        }
        for index in window {
            self.playback.on_mount(index, items[index]);
        }
    }

    fn maybe_request_more(&mut self) {
        if !self.mounted {
            return;
        }
        match self.posts.status(&QueryKey::Posts) {
            QueryStatus::Idle => {}
            QueryStatus::Fetching | QueryStatus::FetchingNext | QueryStatus::Error => return,
        }
        if !self.posts.has_more(&QueryKey::Posts) {
            return;
        }
        let len = self.item_count();
        if len == 0 {
            return;
        }
        let remaining = len.saturating_sub(self.viewport.active_index() + 1);
        if remaining > self.options.prefetch_threshold {
            return;
        }
        debug!("feed: {remaining} items left after the active one, requesting more");
        self.posts.fetch_next_page(&QueryKey::Posts);
    }
}
