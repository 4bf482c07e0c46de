use std::ops::Range;

pub const DEFAULT_VISIBILITY_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleItem {
    pub index: usize,
    /// Share of the item's area inside the viewport, 0.0..=1.0.
    pub fraction: f32,
}

/// One report from the rendering layer, items in on-screen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibilityEvent {
    pub visible: Vec<VisibleItem>,
}

impl VisibilityEvent {
    pub fn new(visible: Vec<VisibleItem>) -> Self {
        Self { visible }
    }

    /// A snapped full-screen page showing only `index`.
    pub fn single(index: usize) -> Self {
        Self::new(vec![VisibleItem {
            index,
            fraction: 1.0,
        }])
    }
}

/// Picks the one feed position eligible for playback.
#[derive(Debug, Clone)]
pub struct ViewportTracker {
    threshold: f32,
    active_index: usize,
    rendered: usize,
}

impl Default for ViewportTracker {
    fn default() -> Self {
        Self::new(DEFAULT_VISIBILITY_THRESHOLD)
    }
}

impl ViewportTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            active_index: 0,
            rendered: 0,
        }
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Number of items currently rendered; reports beyond it are ignored.
    pub fn set_rendered(&mut self, rendered: usize) {
        self.rendered = rendered;
    }

    pub fn reset(&mut self) {
        self.active_index = 0;
    }

    /// Applies one report. Returns the new active index when it changed.
    /// Without a qualifying item the previous index is kept.
    pub fn observe(&mut self, event: &VisibilityEvent) -> Option<usize> {
        let candidate = event
            .visible
            .iter()
            .find(|item| item.index < self.rendered && item.fraction >= self.threshold)?;
        if candidate.index == self.active_index {
            return None;
        }
        self.active_index = candidate.index;
        Some(candidate.index)
    }

    /// Drains a report stream, returning the last change if any.
    pub fn observe_all<I>(&mut self, events: I) -> Option<usize>
    where
        I: IntoIterator<Item = VisibilityEvent>,
    {
        events
            .into_iter()
            .filter_map(|event| self.observe(&event))
            .last()
    }
}

/// Indices kept mounted around `active`: `window` items in total, centred
/// on the active one and clamped to the feed.
pub fn render_range(active: usize, len: usize, window: usize) -> Range<usize> {
    if len == 0 {
        return 0..0;
    }
    let window = window.max(1).min(len);
    let active = active.min(len - 1);
    let start = active
        .saturating_sub(window / 2)
        .min(len - window);
    start..start + window
}
