use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "REELFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub viewport: ViewportConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_prefetch_threshold")]
    pub prefetch_threshold: usize,
    #[serde(default = "default_render_window")]
    pub render_window: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            prefetch_threshold: default_prefetch_threshold(),
            render_window: default_render_window(),
        }
    }
}

fn default_page_size() -> usize {
    3
}

fn default_prefetch_threshold() -> usize {
    2
}

fn default_render_window() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewportConfig {
    #[serde(default = "default_visibility_threshold")]
    pub visibility_threshold: f32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            visibility_threshold: default_visibility_threshold(),
        }
    }
}

fn default_visibility_threshold() -> f32 {
    crate::viewport::DEFAULT_VISIBILITY_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_gc_after", with = "humantime_serde")]
    pub gc_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gc_after: default_gc_after(),
        }
    }
}

fn default_gc_after() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_mpv_path")]
    pub mpv_path: String,
    #[serde(default = "default_loop_playback")]
    pub loop_playback: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            mpv_path: default_mpv_path(),
            loop_playback: default_loop_playback(),
            extra_args: Vec::new(),
        }
    }
}

fn default_mpv_path() -> String {
    "mpv".into()
}

fn default_loop_playback() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        cfg = merge_config(cfg, read_config_file(path)?);
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if other.feed.page_size != 0 {
        base.feed.page_size = other.feed.page_size;
    }
    base.feed.prefetch_threshold = other.feed.prefetch_threshold;
    if other.feed.render_window != 0 {
        base.feed.render_window = other.feed.render_window;
    }

    if other.viewport.visibility_threshold > 0.0 {
        base.viewport.visibility_threshold = other.viewport.visibility_threshold.min(1.0);
    }

    base.cache.gc_after = other.cache.gc_after;

    if !other.player.mpv_path.is_empty() {
        base.player.mpv_path = other.player.mpv_path;
    }
    base.player.loop_playback = other.player.loop_playback;
    if !other.player.extra_args.is_empty() {
        base.player.extra_args = other.player.extra_args;
    }

    if !other.log.level.is_empty() {
        base.log.level = other.log.level;
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed > 0 {
                    cfg.feed.page_size = parsed;
                }
            }
        }
        "feed.prefetch_threshold" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.prefetch_threshold = parsed;
            }
        }
        "feed.render_window" => {
            if let Ok(parsed) = value.parse::<usize>() {
                if parsed > 0 {
                    cfg.feed.render_window = parsed;
                }
            }
        }
        "viewport.visibility_threshold" => {
            if let Ok(parsed) = value.parse::<f32>() {
                if parsed > 0.0 {
                    cfg.viewport.visibility_threshold = parsed.min(1.0);
                }
            }
        }
        "cache.gc_after" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.gc_after = duration;
            }
        }
        "player.mpv_path" => cfg.player.mpv_path = value,
        "player.loop_playback" => {
            cfg.player.loop_playback = matches!(value.as_str(), "1" | "true" | "TRUE" | "True");
        }
        "player.extra_args" => {
            cfg.player.extra_args = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "log.level" => cfg.log.level = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("reelfeed").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_feed_behaviour() {
        let cfg = Config::default();
        assert_eq!(cfg.feed.page_size, 3);
        assert_eq!(cfg.feed.prefetch_threshold, 2);
        assert_eq!(cfg.feed.render_window, 5);
        assert_eq!(cfg.viewport.visibility_threshold, 0.5);
        assert_eq!(cfg.cache.gc_after, Duration::from_secs(300));
        assert!(cfg.player.loop_playback);
        assert_eq!(cfg.log.level, "warn");
    }

    #[test]
    fn load_without_overrides_uses_defaults() {
        let cfg = load(LoadOptions {
            config_file: None,
            env_prefix: Some("REELFEED_TEST_NONE".into()),
        })
        .unwrap();
        assert_eq!(cfg.feed.page_size, Config::default().feed.page_size);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "feed:\n  page_size: 10\ncache:\n  gc_after: 30s\nplayer:\n  loop_playback: false\n  extra_args: [\"--mute=yes\"]\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("REELFEED_TEST_YAML".into()),
        })
        .unwrap();
        assert_eq!(cfg.feed.page_size, 10);
        assert_eq!(cfg.feed.render_window, 5);
        assert_eq!(cfg.cache.gc_after, Duration::from_secs(30));
        assert!(!cfg.player.loop_playback);
        assert_eq!(cfg.player.extra_args, vec!["--mute=yes".to_string()]);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = load(LoadOptions {
            config_file: Some(dir.path().join("nope.yaml")),
            env_prefix: Some("REELFEED_TEST_MISSING".into()),
        })
        .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn env_overrides() {
        env::set_var("REELFEED_TEST_ENV_FEED__PAGE_SIZE", "7");
        env::set_var("REELFEED_TEST_ENV_CACHE__GC_AFTER", "2m");
        env::set_var("REELFEED_TEST_ENV_VIEWPORT__VISIBILITY_THRESHOLD", "3.5");
        let cfg = load(LoadOptions {
            config_file: None,
            env_prefix: Some("REELFEED_TEST_ENV".into()),
        })
        .unwrap();
        env::remove_var("REELFEED_TEST_ENV_FEED__PAGE_SIZE");
        env::remove_var("REELFEED_TEST_ENV_CACHE__GC_AFTER");
        env::remove_var("REELFEED_TEST_ENV_VIEWPORT__VISIBILITY_THRESHOLD");
        assert_eq!(cfg.feed.page_size, 7);
        assert_eq!(cfg.cache.gc_after, Duration::from_secs(120));
        assert_eq!(cfg.viewport.visibility_threshold, 1.0);
    }
}
