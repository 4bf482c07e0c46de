use std::sync::Arc;

use log::info;

use crate::data::{CommentService, PostService};
use crate::error::MutationError;
use crate::fetch::FetchCoordinator;
use crate::model::{AuthorRef, Comment, FeedItem, ItemId, MediaRef, NewComment, NewPost, Record};
use crate::query::QueryKey;

/// Something holding cached queries that can be told a key is out of date.
pub trait Invalidate {
    /// Returns true when an entry for `key` existed and was marked stale.
    fn invalidate(&mut self, key: &QueryKey) -> bool;
}

impl<T: Record> Invalidate for FetchCoordinator<T> {
    fn invalidate(&mut self, key: &QueryKey) -> bool {
        self.mark_stale(key)
    }
}

/// Successful writes that affect cached reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    PostCreated,
    CommentCreated { post_id: ItemId },
}

/// Keys whose cached pages a mutation makes stale. Comment counts are
/// denormalized onto feed items, so a new comment also dirties the feed.
pub fn invalidation_targets(mutation: Mutation) -> Vec<QueryKey> {
    match mutation {
        Mutation::PostCreated => vec![QueryKey::Posts],
        Mutation::CommentCreated { post_id } => {
            vec![QueryKey::Comments(post_id), QueryKey::Posts]
        }
    }
}

/// Post being composed. Cleared only once the post is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostDraft {
    pub media: Option<MediaRef>,
    pub description: String,
}

impl PostDraft {
    pub fn new(media: MediaRef, description: impl Into<String>) -> Self {
        Self {
            media: Some(media),
            description: description.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.media.is_none() && self.description.is_empty()
    }

    pub fn clear(&mut self) {
        self.media = None;
        self.description.clear();
    }
}

/// Runs create operations and, only when they succeed, marks the affected
/// queries stale. Pages are never edited in place.
pub struct MutationBus {
    posts: Arc<dyn PostService>,
    comments: Arc<dyn CommentService>,
}

impl MutationBus {
    pub fn new(posts: Arc<dyn PostService>, comments: Arc<dyn CommentService>) -> Self {
        Self { posts, comments }
    }

    pub fn create_post(
        &self,
        author: &AuthorRef,
        draft: &mut PostDraft,
        caches: &mut dyn Invalidate,
    ) -> Result<FeedItem, MutationError> {
        let media = match &draft.media {
            Some(media) if !media.is_empty() => media.clone(),
            _ => return Err(MutationError::MissingMedia),
        };
        let created = self
            .posts
            .create_post(NewPost {
                author: author.clone(),
                media,
                description: draft.description.trim().to_string(),
            })
            .map_err(MutationError::CreatePost)?;

        publish(Mutation::PostCreated, caches);
        draft.clear();
        Ok(created)
    }

    pub fn create_comment(
        &self,
        author: &AuthorRef,
        post_id: ItemId,
        body: &str,
        caches: &mut dyn Invalidate,
    ) -> Result<Comment, MutationError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(MutationError::EmptyComment);
        }
        let created = self
            .comments
            .create_comment(NewComment {
                post_id,
                author: author.clone(),
                body: body.to_string(),
            })
            .map_err(|source| MutationError::CreateComment { post_id, source })?;

        publish(Mutation::CommentCreated { post_id }, caches);
        Ok(created)
    }
}

fn publish(mutation: Mutation, caches: &mut dyn Invalidate) {
    for key in invalidation_targets(mutation) {
        if caches.invalidate(&key) {
            info!("query {key}: marked stale after {mutation:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemoryBackend;

    #[derive(Default)]
    struct RecordingCaches {
        stale: Vec<QueryKey>,
    }

    impl Invalidate for RecordingCaches {
        fn invalidate(&mut self, key: &QueryKey) -> bool {
            self.stale.push(key.clone());
            true
        }
    }

    fn bus(backend: &Arc<MemoryBackend>) -> MutationBus {
        MutationBus::new(backend.clone(), backend.clone())
    }

    fn me() -> AuthorRef {
        AuthorRef("me".into())
    }

    #[test]
    fn targets_for_each_mutation() {
        assert_eq!(
            invalidation_targets(Mutation::PostCreated),
            vec![QueryKey::Posts]
        );
        assert_eq!(
            invalidation_targets(Mutation::CommentCreated { post_id: ItemId(4) }),
            vec![QueryKey::Comments(ItemId(4)), QueryKey::Posts]
        );
    }

    #[test]
    fn created_post_invalidates_feed_and_clears_draft() {
        let backend = Arc::new(MemoryBackend::new());
        let mut caches = RecordingCaches::default();
        let mut draft = PostDraft::new(MediaRef::new("clip.mp4"), "  hello  ");

        let created = bus(&backend)
            .create_post(&me(), &mut draft, &mut caches)
            .unwrap();

        assert_eq!(created.description, "hello");
        assert_eq!(caches.stale, vec![QueryKey::Posts]);
        assert!(draft.is_empty());
        assert_eq!(backend.post_count(), 1);
    }

    #[test]
    fn post_without_media_is_rejected_before_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let mut caches = RecordingCaches::default();
        let mut draft = PostDraft {
            media: None,
            description: "text only".into(),
        };
        let err = bus(&backend)
            .create_post(&me(), &mut draft, &mut caches)
            .unwrap_err();
        assert!(matches!(err, MutationError::MissingMedia));
        assert_eq!(draft.description, "text only");
        assert!(caches.stale.is_empty());
        assert_eq!(backend.post_count(), 0);
    }

    #[test]
    fn failed_post_keeps_draft_and_cache() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_offline(true);
        let mut caches = RecordingCaches::default();
        let mut draft = PostDraft::new(MediaRef::new("clip.mp4"), "hi");
        let err = bus(&backend)
            .create_post(&me(), &mut draft, &mut caches)
            .unwrap_err();
        assert!(matches!(err, MutationError::CreatePost(_)));
        assert_eq!(draft.media, Some(MediaRef::new("clip.mp4")));
        assert!(caches.stale.is_empty());
    }

    #[test]
    fn created_comment_invalidates_comments_and_feed() {
        let backend = Arc::new(MemoryBackend::seeded(3));
        let mut caches = RecordingCaches::default();
        let comment = bus(&backend)
            .create_comment(&me(), ItemId(2), "  great clip ", &mut caches)
            .unwrap();
        assert_eq!(comment.body, "great clip");
        assert_eq!(
            caches.stale,
            vec![QueryKey::Comments(ItemId(2)), QueryKey::Posts]
        );
    }

    #[test]
    fn blank_comment_is_rejected() {
        let backend = Arc::new(MemoryBackend::seeded(1));
        let mut caches = RecordingCaches::default();
        let err = bus(&backend)
            .create_comment(&me(), ItemId(1), "   ", &mut caches)
            .unwrap_err();
        assert!(matches!(err, MutationError::EmptyComment));
        assert!(caches.stale.is_empty());
    }

    #[test]
    fn failed_comment_surfaces_post_id() {
        let backend = Arc::new(MemoryBackend::seeded(1));
        let mut caches = RecordingCaches::default();
        let err = bus(&backend)
            .create_comment(&me(), ItemId(50), "hi", &mut caches)
            .unwrap_err();
        assert!(matches!(
            err,
            MutationError::CreateComment {
                post_id: ItemId(50),
                ..
            }
        ));
        assert!(caches.stale.is_empty());
    }
}
