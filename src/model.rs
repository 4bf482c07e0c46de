use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-assigned identifier. Ordered by insertion, which is what lets the
/// last id of a page double as the cursor for the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a profile; resolving it to a username is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorRef(pub String);

/// Locator of a playable media resource (URL or path), never the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaRef(pub String);

impl MediaRef {
    pub fn new<S: Into<String>>(locator: S) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Anything that can be paginated by id and deduplicated when flattened.
pub trait Record: Clone + Send + 'static {
    fn id(&self) -> ItemId;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: ItemId,
    pub author: AuthorRef,
    pub media: MediaRef,
    #[serde(default)]
    pub comment_count: u32,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Record for FeedItem {
    fn id(&self) -> ItemId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: ItemId,
    pub post_id: ItemId,
    pub author: AuthorRef,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Record for Comment {
    fn id(&self) -> ItemId {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPost {
    pub author: AuthorRef,
    pub media: MediaRef,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewComment {
    pub post_id: ItemId,
    pub author: AuthorRef,
    pub body: String,
}

/// Result of one fetch. An empty page marks the end of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.last()
    }
}

impl<T> From<Vec<T>> for Page<T> {
    fn from(items: Vec<T>) -> Self {
        Self { items }
    }
}
