use crate::model::{ItemId, MediaRef};
use crate::query::QueryKey;

/// Transport or backend failure while fetching a page. Retained on the
/// query entry so the UI can render it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("fetch {key} failed: {message}")]
    Transport { key: QueryKey, message: String },
}

impl FetchError {
    pub fn key(&self) -> &QueryKey {
        match self {
            FetchError::Transport { key, .. } => key,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("no video selected")]
    MissingMedia,
    #[error("comment is empty")]
    EmptyComment,
    #[error("create post failed")]
    CreatePost(#[source] anyhow::Error),
    #[error("create comment on post {post_id} failed")]
    CreateComment {
        post_id: ItemId,
        #[source]
        source: anyhow::Error,
    },
}

/// Media resource lifecycle failure. Never propagated: the playback manager
/// logs it and keeps going.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("create player for {media}: {source:#}")]
    Create {
        media: MediaRef,
        source: anyhow::Error,
    },
    #[error("play item {index}: {source:#}")]
    Play { index: usize, source: anyhow::Error },
    #[error("pause item {index}: {source:#}")]
    Pause { index: usize, source: anyhow::Error },
    #[error("release item {index}: {source:#}")]
    Release { index: usize, source: anyhow::Error },
}
