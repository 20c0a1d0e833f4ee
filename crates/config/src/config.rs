//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// The four directories the pipeline bridges.
///
/// All of them are optional in the file so they can be supplied by the
/// environment or the command line instead.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PathsConfig {
    /// Root of the tree watched for new request files
    pub intake_root: Option<PathBuf>,
    /// Where request files are handed to the external consumer
    pub drop_off: Option<PathBuf>,
    /// Where the external consumer deposits finished artifacts
    pub completed: Option<PathBuf>,
    /// Final library location, organized by category
    pub media_root: Option<PathBuf>,
}

/// Intake-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntakeConfig {
    /// Extension (with leading dot) of files forwarded to the drop-off directory
    #[serde(default = "default_intake_extension")]
    pub extension: String,
    /// Base-name prefix of not-yet-renamed "new item" placeholders
    #[serde(default = "default_placeholder_prefix")]
    pub placeholder_prefix: String,
    /// Give up moving an intake file after this many seconds (default 30 min)
    #[serde(default = "default_intake_move_timeout_secs")]
    pub move_timeout_secs: u64,
    /// Delay between move attempts
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Feed intake files already present at startup to the mover
    #[serde(default)]
    pub sweep_on_startup: bool,
}

fn default_intake_extension() -> String {
    ".torrent".to_string()
}

fn default_placeholder_prefix() -> String {
    "new ".to_string()
}

fn default_intake_move_timeout_secs() -> u64 {
    30 * 60
}

fn default_retry_backoff_secs() -> u64 {
    5
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            extension: default_intake_extension(),
            placeholder_prefix: default_placeholder_prefix(),
            move_timeout_secs: default_intake_move_timeout_secs(),
            retry_backoff_secs: default_retry_backoff_secs(),
            sweep_on_startup: false,
        }
    }
}

/// Completion matcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatcherConfig {
    /// Seconds between scans of the completed-output directory
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Abandon active files unmatched for this long (0 = never)
    #[serde(default = "default_active_ttl_secs")]
    pub active_ttl_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_active_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            active_ttl_secs: default_active_ttl_secs(),
        }
    }
}

/// Finalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizeConfig {
    /// Give up moving a completed artifact after this many seconds (default 5 min)
    #[serde(default = "default_finalize_move_timeout_secs")]
    pub move_timeout_secs: u64,
    /// Origin path fragments that mark a request as TV
    #[serde(default = "default_tv_keywords")]
    pub tv_keywords: Vec<String>,
    /// Origin path fragments that mark a request as a movie
    #[serde(default = "default_movie_keywords")]
    pub movie_keywords: Vec<String>,
}

fn default_finalize_move_timeout_secs() -> u64 {
    5 * 60
}

fn default_tv_keywords() -> Vec<String> {
    vec!["tv".to_string()]
}

fn default_movie_keywords() -> Vec<String> {
    vec!["movies".to_string()]
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            move_timeout_secs: default_finalize_move_timeout_secs(),
            tv_keywords: default_tv_keywords(),
            movie_keywords: default_movie_keywords(),
        }
    }
}

/// Stage wiring configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Capacity of the bounded queues between stages
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub finalize: FinalizeConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Parse a boolean env value. Accepts "true", "1", "yes" and "false", "0", "no".
fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - MEDIA_RELAY_INTAKE_ROOT -> paths.intake_root
    /// - MEDIA_RELAY_DROP_OFF -> paths.drop_off
    /// - MEDIA_RELAY_COMPLETED -> paths.completed
    /// - MEDIA_RELAY_MEDIA_ROOT -> paths.media_root
    /// - MEDIA_RELAY_INTAKE_EXTENSION -> intake.extension
    /// - MEDIA_RELAY_SWEEP_ON_STARTUP -> intake.sweep_on_startup
    /// - MEDIA_RELAY_POLL_INTERVAL_SECS -> matcher.poll_interval_secs
    /// - MEDIA_RELAY_ACTIVE_TTL_SECS -> matcher.active_ttl_secs
    pub fn apply_env_overrides(&mut self) {
        let path_overrides = [
            ("MEDIA_RELAY_INTAKE_ROOT", &mut self.paths.intake_root),
            ("MEDIA_RELAY_DROP_OFF", &mut self.paths.drop_off),
            ("MEDIA_RELAY_COMPLETED", &mut self.paths.completed),
            ("MEDIA_RELAY_MEDIA_ROOT", &mut self.paths.media_root),
        ];
        for (name, slot) in path_overrides {
            if let Ok(val) = env::var(name) {
                if !val.is_empty() {
                    *slot = Some(PathBuf::from(val));
                }
            }
        }

        if let Ok(val) = env::var("MEDIA_RELAY_INTAKE_EXTENSION") {
            if !val.is_empty() {
                self.intake.extension = val;
            }
        }

        if let Ok(val) = env::var("MEDIA_RELAY_SWEEP_ON_STARTUP") {
            if let Some(sweep) = parse_bool(&val) {
                self.intake.sweep_on_startup = sweep;
            }
        }

        if let Ok(val) = env::var("MEDIA_RELAY_POLL_INTERVAL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.matcher.poll_interval_secs = secs;
            }
        }

        if let Ok(val) = env::var("MEDIA_RELAY_ACTIVE_TTL_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.matcher.active_ttl_secs = secs;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}
