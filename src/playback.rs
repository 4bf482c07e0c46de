use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};

use crate::error::ResourceError;
use crate::model::{FeedItem, ItemId, MediaRef};

/// Handle to one playable media resource.
pub trait MediaPlayer: Send {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerOptions {
    pub looping: bool,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self { looping: true }
    }
}

/// Creates a paused player bound to a media locator.
pub trait MediaResourceFactory: Send + Sync {
    fn create(&self, media: &MediaRef, options: &PlayerOptions) -> Result<Box<dyn MediaPlayer>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Ready,
    Playing,
    Paused,
    Released,
}

struct Slot {
    item: ItemId,
    media: MediaRef,
    player: Option<Box<dyn MediaPlayer>>,
    state: PlaybackState,
}

impl Slot {
    fn play(&mut self, index: usize) {
        if let Some(player) = self.player.as_mut() {
            if let Err(source) = player.play() {
                warn!("{}", ResourceError::Play { index, source });
            }
        }
        debug!("item {index} ({}): {:?} -> Playing", self.item, self.state);
        self.state = PlaybackState::Playing;
    }

    fn pause(&mut self, index: usize) {
        if let Some(player) = self.player.as_mut() {
            if let Err(source) = player.pause() {
                warn!("{}", ResourceError::Pause { index, source });
            }
        }
        debug!("item {index} ({}): Playing -> Paused", self.item);
        self.state = PlaybackState::Paused;
    }

    fn release(&mut self, index: usize) {
        if self.state == PlaybackState::Released {
            return;
        }
        if let Some(mut player) = self.player.take() {
            if let Err(source) = player.release() {
                warn!("{}", ResourceError::Release { index, source });
            }
        }
        debug!("item {index} ({}): {:?} -> Released", self.item, self.state);
        self.state = PlaybackState::Released;
    }
}

/// Owns one player per rendered item and keeps at most one of them playing.
///
/// The only way into `Playing` is [`PlaybackManager::reconcile`], which
/// targets the single `active_index` and pauses every other slot first.
pub struct PlaybackManager {
    factory: Arc<dyn MediaResourceFactory>,
    options: PlayerOptions,
    slots: BTreeMap<usize, Slot>,
    active_index: usize,
    focused: bool,
}

impl PlaybackManager {
    pub fn new(factory: Arc<dyn MediaResourceFactory>, options: PlayerOptions) -> Self {
        Self {
            factory,
            options,
            slots: BTreeMap::new(),
            active_index: 0,
            focused: false,
        }
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn state(&self, index: usize) -> Option<PlaybackState> {
        self.slots.get(&index).map(|slot| slot.state)
    }

    pub fn item_at(&self, index: usize) -> Option<ItemId> {
        self.slots.get(&index).map(|slot| slot.item)
    }

    pub fn mounted(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.keys().copied()
    }

    pub fn playing_index(&self) -> Option<usize> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.state == PlaybackState::Playing)
            .map(|(index, _)| *index)
    }

    pub fn playing_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.state == PlaybackState::Playing)
            .count()
    }

    /// First render of `item` at `index`. Re-mounting the same item is a
    /// no-op, even when its resource could not be created; a different item
    /// replaces (and releases) the old slot.
    pub fn on_mount(&mut self, index: usize, item: &FeedItem) {
        if self.item_at(index) == Some(item.id) {
            return;
        }
        self.on_unmount(index);

        let mut slot = Slot {
            item: item.id,
            media: item.media.clone(),
            player: None,
            state: PlaybackState::Idle,
        };
        match self.factory.create(&slot.media, &self.options) {
            Ok(player) => {
                slot.player = Some(player);
                slot.state = PlaybackState::Ready;
                debug!("item {index} ({}): Idle -> Ready", item.id);
            }
            Err(source) => {
                warn!(
                    "{}",
                    ResourceError::Create {
                        media: slot.media.clone(),
                        source
                    }
                );
                slot.state = PlaybackState::Released;
            }
        }
        self.slots.insert(index, slot);
        self.reconcile();
    }

    /// Releases and forgets the slot at `index`. Safe on unknown or
    /// already released slots.
    pub fn on_unmount(&mut self, index: usize) {
        if let Some(mut slot) = self.slots.remove(&index) {
            slot.release(index);
        }
    }

    pub fn set_active(&mut self, index: usize) {
        self.active_index = index;
        self.reconcile();
    }

    pub fn on_focus(&mut self) {
        self.focused = true;
        self.reconcile();
    }

    pub fn on_blur(&mut self) {
        self.focused = false;
        self.reconcile();
    }

    /// Releases every slot but keeps focus, e.g. when the list underneath
    /// was replaced.
    pub fn unmount_all(&mut self) {
        for (index, slot) in self.slots.iter_mut() {
            slot.release(*index);
        }
        self.slots.clear();
    }

    /// The surface went away entirely: every resource is released.
    pub fn release_all(&mut self) {
        self.focused = false;
        self.unmount_all();
    }

    fn reconcile(&mut self) {
        let target = self.focused.then_some(self.active_index);
        for (index, slot) in self.slots.iter_mut() {
            if slot.state == PlaybackState::Playing && Some(*index) != target {
                slot.pause(*index);
            }
        }
        let Some(target) = target else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(&target) {
            if matches!(slot.state, PlaybackState::Ready | PlaybackState::Paused) {
                slot.play(target);
            }
        }
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        self.release_all();
    }
}
