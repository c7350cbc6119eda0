//! picvm configuration
//!
//! Two tables, both optional; every field falls back to its default.
//!
//! ```toml
//! [cache]
//! enabled = true
//! megamorphic_threshold = 3
//! miss_counting = "all"        # or "saturated"
//! arena_regions_per_site = 1.0
//!
//! [engine]
//! max_call_depth = 1024
//! register_count = 256
//! max_alloc_bytes = 67108864   # per sys_alloc block or gc_alloc object
//! trace_execution = false
//! ```
//!
//! # Usage
//!
//! ```rust
//! use picvm::util::config::load_config;
//!
//! // a missing file yields the defaults
//! let config = load_config("does-not-exist.toml").unwrap();
//! assert!(config.cache.enabled);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::cache::{CachePolicy, MissCounting, OVERFLOW_SLOTS};
use crate::vm::frames::GENERAL_PURPOSE_REGS;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PicvmConfig {
    /// Inline cache settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Dispatch engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Inline cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// When false every call site resolves on every execution
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// A site goes megamorphic once its miss count exceeds this
    #[serde(default = "default_threshold")]
    pub megamorphic_threshold: u32,
    /// Which misses count towards the threshold
    #[serde(default)]
    pub miss_counting: MissCounting,
    /// Overflow regions reserved per call site when sizing a store's arena
    #[serde(default = "default_regions_per_site")]
    pub arena_regions_per_site: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> u32 {
    OVERFLOW_SLOTS as u32
}

fn default_regions_per_site() -> f64 {
    1.0
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            megamorphic_threshold: default_threshold(),
            miss_counting: MissCounting::All,
            arena_regions_per_site: 1.0,
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            enabled: self.enabled,
            megamorphic_threshold: self.megamorphic_threshold,
            miss_counting: self.miss_counting,
        }
    }
}

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of live frames
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Registers per frame
    #[serde(default = "default_register_count")]
    pub register_count: usize,
    /// Largest block `sys_alloc` or object `gc_alloc` may request
    #[serde(default = "default_max_alloc_bytes")]
    pub max_alloc_bytes: usize,
    /// Log every executed instruction at trace level
    #[serde(default)]
    pub trace_execution: bool,
}

fn default_max_call_depth() -> usize {
    1024
}

fn default_register_count() -> usize {
    GENERAL_PURPOSE_REGS
}

fn default_max_alloc_bytes() -> usize {
    64 << 20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 1024,
            register_count: GENERAL_PURPOSE_REGS,
            max_alloc_bytes: default_max_alloc_bytes(),
            trace_execution: false,
        }
    }
}

/// Load configuration from a TOML file
/// Returns default config if file doesn't exist
pub fn load_config(path: impl AsRef<Path>) -> Result<PicvmConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(PicvmConfig::default());
    }

    let content = fs::read_to_string(path).map_err(ConfigError::IoError)?;
    parse_config(&content)
}

/// Parse configuration from TOML text
pub fn parse_config(content: &str) -> Result<PicvmConfig, ConfigError> {
    let config: PicvmConfig = toml::from_str(content).map_err(ConfigError::ParseError)?;
    if config.engine.register_count == 0 {
        return Err(ConfigError::Invalid(
            "engine.register_count must be at least 1".to_string(),
        ));
    }
    if !config.cache.arena_regions_per_site.is_finite() || config.cache.arena_regions_per_site < 0.0
    {
        return Err(ConfigError::Invalid(
            "cache.arena_regions_per_site must be a non-negative number".to_string(),
        ));
    }
    Ok(config)
}

/// Save configuration as TOML
pub fn save_config(
    config: &PicvmConfig,
    path: impl AsRef<Path>,
) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config).map_err(ConfigError::SerializeError)?;
    fs::write(path, content).map_err(ConfigError::IoError)?;
    Ok(())
}

/// Configuration errors
#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    ParseError(toml::de::Error),
    SerializeError(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Config parse error: {}", e),
            ConfigError::SerializeError(e) => write!(f, "Config serialize error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
