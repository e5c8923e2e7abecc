use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::feed::{DEFAULT_FETCH_TIMEOUT, DEFAULT_PAGE_SIZE};

const DEFAULT_ENV_PREFIX: &str = "SOCIALFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub player: PlayerConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Firebase,
    #[default]
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "firebase" => Ok(BackendKind::Firebase),
            "memory" => Ok(BackendKind::Memory),
            other => anyhow::bail!("config: unknown backend kind {other:?}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub storage_bucket: String,
    #[serde(default)]
    pub oauth_client_id: String,
    #[serde(default)]
    pub oauth_client_secret: String,
    #[serde(default = "default_redirect_uri")]
    pub oauth_redirect_uri: String,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Number of seeded posts when running on the in-memory backend.
    #[serde(default = "default_demo_posts")]
    pub demo_posts: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            api_key: String::new(),
            project_id: String::new(),
            storage_bucket: String::new(),
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            oauth_redirect_uri: default_redirect_uri(),
            request_timeout: default_request_timeout(),
            demo_posts: default_demo_posts(),
        }
    }
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:0/socialfeed/callback".into()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_demo_posts() -> usize {
    45
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Rows of the terminal treated as the visible viewport.
    #[serde(default = "default_viewport_rows")]
    pub viewport_rows: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            fetch_timeout: default_fetch_timeout(),
            viewport_rows: default_viewport_rows(),
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_fetch_timeout() -> Duration {
    DEFAULT_FETCH_TIMEOUT
}

fn default_viewport_rows() -> usize {
    24
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_video_command")]
    pub video_command: Vec<String>,
    #[serde(default = "default_autoplay")]
    pub autoplay: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            video_command: default_video_command(),
            autoplay: default_autoplay(),
        }
    }
}

fn default_video_command() -> Vec<String> {
    vec![
        "mpv".into(),
        "--loop-file=inf".into(),
        "--mute=yes".into(),
        "--really-quiet".into(),
        "%URL%".into(),
    ]
}

fn default_autoplay() -> bool {
    true
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

/// Defaults, then the YAML file, then `SOCIALFEED_*` variables.
pub fn load(options: LoadOptions) -> Result<Config> {
    let path = options.config_file.or_else(default_config_path);
    let mut cfg = match path {
        Some(path) if path.exists() => read_config_file(&path)?,
        _ => Config::default(),
    };

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    for (key, value) in env_overrides(prefix) {
        apply_env_value(&mut cfg, &key, value)?;
    }
    if cfg.feed.page_size == 0 {
        cfg.feed.page_size = DEFAULT_PAGE_SIZE;
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    if data.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn env_overrides(prefix: &str) -> Vec<(String, String)> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    let mut pairs: Vec<(String, String)> = env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(&upper_prefix)
                .map(|stripped| (stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect();
    pairs.sort();
    pairs
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) -> Result<()> {
    match key {
        "backend.kind" => cfg.backend.kind = value.parse()?,
        "backend.api_key" => cfg.backend.api_key = value,
        "backend.project_id" => cfg.backend.project_id = value,
        "backend.storage_bucket" => cfg.backend.storage_bucket = value,
        "backend.oauth_client_id" => cfg.backend.oauth_client_id = value,
        "backend.oauth_client_secret" => cfg.backend.oauth_client_secret = value,
        "backend.oauth_redirect_uri" => cfg.backend.oauth_redirect_uri = value,
        "backend.request_timeout" => {
            cfg.backend.request_timeout = parse_duration(key, &value)?;
        }
        "backend.demo_posts" => cfg.backend.demo_posts = parse_number(key, &value)?,
        "feed.page_size" => cfg.feed.page_size = parse_number(key, &value)?,
        "feed.fetch_timeout" => cfg.feed.fetch_timeout = parse_duration(key, &value)?,
        "feed.viewport_rows" => cfg.feed.viewport_rows = parse_number(key, &value)?,
        "player.video_command" => {
            cfg.player.video_command = value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        "player.autoplay" => {
            cfg.player.autoplay = matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        // LOG is read by the subscriber, not here.
        _ => {}
    }
    Ok(())
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .with_context(|| format!("config: {key} is not a duration: {value:?}"))
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .with_context(|| format!("config: {key} is not a number: {value:?}"))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("socialfeed").join("config.yaml"))
}

/// Writes a config file with every default spelled out, unless one exists.
/// Returns the path and whether it was created.
pub fn write_template(path: Option<PathBuf>) -> Result<(PathBuf, bool)> {
    let path = match path {
        Some(path) => path,
        None => default_config_path().context("config: unable to determine default config path")?,
    };
    if path.exists() {
        return Ok((path, false));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: failed to create directory {}", parent.display()))?;
    }

    let contents =
        serde_yaml::to_string(&Config::default()).context("config: failed to serialize config")?;
    fs::write(&path, contents)
        .with_context(|| format!("config: failed to write file {}", path.display()))?;

    Ok((path, true))
}
