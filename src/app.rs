use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;

use crate::config::{self, Config};
use crate::data::MemoryBackend;
use crate::model::{AuthorRef, MediaRef};
use crate::mutation::PostDraft;
use crate::playback::{MediaPlayer, MediaResourceFactory, PlayerOptions};
use crate::player::MpvFactory;
use crate::query::QueryStatus;
use crate::surface::{Backends, FeedSurface, SurfaceOptions};
use crate::viewport::VisibilityEvent;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ITEMS: usize = 12;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    /// Drive real mpv windows instead of the headless players.
    pub use_mpv: bool,
    pub items: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config_file: None,
            use_mpv: false,
            items: DEFAULT_ITEMS,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub version: &'static str,
    pub items: Vec<ItemReport>,
    pub visited: Vec<usize>,
    pub active_index: usize,
    pub playing_index: Option<usize>,
    pub has_more: bool,
    pub status: QueryStatus,
    pub comments: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ItemReport {
    pub id: i64,
    pub author: String,
    pub description: String,
    pub comment_count: u32,
}

pub fn init_logging(cfg: &Config) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(cfg.log.level.as_str()),
    )
    .format_timestamp_millis()
    .try_init();
}

pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    init_logging(&cfg);
    if let Some(path) = config::default_path() {
        debug!("default config path: {}", path.display());
    }

    let report = run_session(&cfg, &options)?;
    let rendered = serde_json::to_string_pretty(&report).context("serialize session report")?;
    println!("{rendered}");
    Ok(())
}

/// Scripted walk through the feed: load, scroll to the end, comment on the
/// last item, publish a post and come back to a refreshed feed.
pub fn run_session(cfg: &Config, options: &RunOptions) -> Result<SessionReport> {
    let backend = Arc::new(MemoryBackend::seeded(options.items));
    let media: Arc<dyn MediaResourceFactory> = if options.use_mpv {
        Arc::new(MpvFactory::new(
            cfg.player.mpv_path.clone(),
            cfg.player.extra_args.clone(),
        ))
    } else {
        Arc::new(HeadlessFactory)
    };
    let mut feed = FeedSurface::new(SurfaceOptions::from(cfg), Backends::memory(backend, media));
    let me = AuthorRef("reelfeed".into());

    feed.on_mount();
    feed.settle(SETTLE_TIMEOUT);
    if let Some(err) = feed.error() {
        warn!("feed failed to load: {err}");
    }

    let mut visited = vec![feed.active_index()];
    let mut index = feed.active_index();
    while index + 1 < feed.item_count() {
        index += 1;
        if let Some(active) = feed.observe_visibility(&VisibilityEvent::single(index)) {
            visited.push(active);
        }
        feed.settle(SETTLE_TIMEOUT);
    }
    info!("session: scrolled through {} items", visited.len());

    let mut comments = Vec::new();
    let current = feed.items().nth(feed.active_index()).map(|item| item.id);
    if let Some(post) = current {
        feed.open_comments(post);
        feed.settle(SETTLE_TIMEOUT);
        feed.create_comment(&me, post, "Looping this all day")
            .context("post comment")?;
        feed.settle(SETTLE_TIMEOUT);
        comments = feed.comments(post).map(|c| c.body.clone()).collect();
        feed.close_comments();
    }

    let mut draft = PostDraft::new(
        MediaRef::new("https://media.reelfeed.test/upload.mp4"),
        "Posted from the session",
    );
    feed.create_post(&me, &mut draft).context("create post")?;

    // leaving and re-entering the feed picks up the invalidated pages
    feed.on_unmount();
    feed.on_mount();
    feed.settle(SETTLE_TIMEOUT);

    let report = SessionReport {
        version: crate::VERSION,
        items: feed
            .items()
            .map(|item| ItemReport {
                id: item.id.0,
                author: item.author.0.clone(),
                description: item.description.clone(),
                comment_count: item.comment_count,
            })
            .collect(),
        visited,
        active_index: feed.active_index(),
        playing_index: feed.playing_index(),
        has_more: feed.has_more(),
        status: feed.status(),
        comments,
    };
    feed.on_unmount();
    Ok(report)
}

/// Players that only log what a real one would do.
struct HeadlessFactory;

impl MediaResourceFactory for HeadlessFactory {
    fn create(&self, media: &MediaRef, options: &PlayerOptions) -> Result<Box<dyn MediaPlayer>> {
        debug!("headless player for {media} (loop={})", options.looping);
        Ok(Box::new(HeadlessPlayer {
            media: media.clone(),
        }))
    }
}

struct HeadlessPlayer {
    media: MediaRef,
}

impl MediaPlayer for HeadlessPlayer {
    fn play(&mut self) -> Result<()> {
        debug!("play {}", self.media);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        debug!("pause {}", self.media);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        debug!("release {}", self.media);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_walks_whole_feed() {
        let options = RunOptions {
            items: 5,
            ..RunOptions::default()
        };
        let report = run_session(&Config::default(), &options).unwrap();

        assert_eq!(report.visited, vec![0, 1, 2, 3, 4]);
        assert_eq!(report.comments, vec!["Looping this all day".to_string()]);
        assert_eq!(report.status, QueryStatus::Idle);
        assert_eq!(report.active_index, 0);
        assert_eq!(report.playing_index, Some(0));

        let ids: Vec<i64> = report.items.iter().map(|item| item.id).collect();
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(report.items.len(), 6);
        assert_eq!(report.items[4].comment_count, 1);
    }

    #[test]
    fn empty_feed_still_reports() {
        let options = RunOptions {
            items: 0,
            ..RunOptions::default()
        };
        let report = run_session(&Config::default(), &options).unwrap();
        assert_eq!(report.visited, vec![0]);
        assert!(report.comments.is_empty());
        assert_eq!(report.items.len(), 1);
    }
}
