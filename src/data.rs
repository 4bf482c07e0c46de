use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::cursor::PageRequest;
use crate::model::{AuthorRef, Comment, FeedItem, ItemId, MediaRef, NewComment, NewPost, Page};
use crate::query::QueryKey;

/// Fetches one page of a query. Implementations must return items in
/// increasing id order; see [`crate::cursor`].
pub trait PageSource<T>: Send + Sync {
    fn fetch_page(&self, key: &QueryKey, request: &PageRequest) -> Result<Page<T>>;
}

pub trait PostService: Send + Sync {
    fn create_post(&self, post: NewPost) -> Result<FeedItem>;
}

pub trait CommentService: Send + Sync {
    fn create_comment(&self, comment: NewComment) -> Result<Comment>;
}

/// In-process backend used by the binary and the tests.
pub struct MemoryBackend {
    posts: RwLock<Vec<FeedItem>>,
    comments: RwLock<Vec<Comment>>,
    next_id: AtomicI64,
    offline: AtomicBool,
}

const SAMPLE_DESCRIPTIONS: &[&str] = &[
    "Sunset over the harbour",
    "First try at a kickflip",
    "Rainy day coffee pour",
    "Cat vs. cardboard box",
    "Street drummer downtown",
    "Five minute pasta",
];

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            posts: RwLock::new(Vec::new()),
            comments: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
            offline: AtomicBool::new(false),
        }
    }

    pub fn seeded(count: usize) -> Self {
        let backend = Self::new();
        let mut rng = rand::thread_rng();
        for n in 0..count {
            let description = SAMPLE_DESCRIPTIONS
                .choose(&mut rng)
                .copied()
                .unwrap_or_default();
            backend.insert_post(NewPost {
                author: AuthorRef(format!("user-{}", n % 4)),
                media: MediaRef::new(format!("https://media.reelfeed.test/clip-{n}.mp4")),
                description: description.to_string(),
            });
        }
        backend
    }

    /// While offline every call fails as a transport error would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn post_count(&self) -> usize {
        self.posts.read().len()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("backend unreachable");
        }
        Ok(())
    }

    fn allocate_id(&self) -> ItemId {
        ItemId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn insert_post(&self, post: NewPost) -> FeedItem {
        let item = FeedItem {
            id: self.allocate_id(),
            author: post.author,
            media: post.media,
            comment_count: 0,
            description: post.description,
            created_at: Utc::now(),
        };
        self.posts.write().push(item.clone());
        item
    }
}

fn window<T: Clone>(items: impl Iterator<Item = T>, request: &PageRequest, id: fn(&T) -> ItemId) -> Page<T> {
    Page::new(
        items
            .filter(|item| request.after.map_or(true, |after| id(item) > after))
            .take(request.limit)
            .collect(),
    )
}

impl PageSource<FeedItem> for MemoryBackend {
    fn fetch_page(&self, key: &QueryKey, request: &PageRequest) -> Result<Page<FeedItem>> {
        self.check_online()?;
        if *key != QueryKey::Posts {
            bail!("{key} is not a post stream");
        }
        let comments = self.comments.read();
        let posts = self.posts.read();
        let mut page = window(posts.iter().cloned(), request, |item| item.id);
        for item in &mut page.items {
            item.comment_count = comments.iter().filter(|c| c.post_id == item.id).count() as u32;
        }
        Ok(page)
    }
}

impl PageSource<Comment> for MemoryBackend {
    fn fetch_page(&self, key: &QueryKey, request: &PageRequest) -> Result<Page<Comment>> {
        self.check_online()?;
        let QueryKey::Comments(post_id) = key else {
            bail!("{key} is not a comment stream");
        };
        let comments = self.comments.read();
        Ok(window(
            comments.iter().filter(|c| c.post_id == *post_id).cloned(),
            request,
            |comment| comment.id,
        ))
    }
}

impl PostService for MemoryBackend {
    fn create_post(&self, post: NewPost) -> Result<FeedItem> {
        self.check_online()?;
        Ok(self.insert_post(post))
    }
}

impl CommentService for MemoryBackend {
    fn create_comment(&self, comment: NewComment) -> Result<Comment> {
        self.check_online()?;
        if !self.posts.read().iter().any(|post| post.id == comment.post_id) {
            bail!("post {} does not exist", comment.post_id);
        }
        let created = Comment {
            id: self.allocate_id(),
            post_id: comment.post_id,
            author: comment.author,
            body: comment.body,
            created_at: Utc::now(),
        };
        self.comments.write().push(created.clone());
        Ok(created)
    }
}
