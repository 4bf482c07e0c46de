//! Offset-by-last-id pagination.
//!
//! Precondition on the page source: items within and across pages are
//! returned in strictly increasing `id` order. Nothing here validates that;
//! a backend that reorders items will make continuation skip or repeat
//! items, which `flattened_view` can only partially mask by deduplicating.

use crate::model::{ItemId, Page, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Return items strictly after this id; `None` starts from the beginning.
    pub after: Option<ItemId>,
    pub limit: usize,
}

impl PageRequest {
    pub fn is_first(&self) -> bool {
        self.after.is_none()
    }
}

pub fn first_request(page_size: usize) -> PageRequest {
    PageRequest {
        after: None,
        limit: page_size,
    }
}

/// An empty page is terminal.
pub fn next_cursor<T: Record>(last_page: &Page<T>, page_size: usize) -> Option<PageRequest> {
    let last = last_page.last()?;
    Some(PageRequest {
        after: Some(last.id()),
        limit: page_size,
    })
}
