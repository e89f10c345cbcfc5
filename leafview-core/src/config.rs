use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::ConfigError;
use crate::reduction::ReductionTable;

pub const MIN_THUMBNAIL_COLUMNS: u32 = 2;
pub const MAX_THUMBNAIL_COLUMNS: u32 = 8;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub padding: f32,
    pub reductions: Vec<f32>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "redraw_interval_ms")]
    pub redraw_interval: Duration,
    pub one_page_breakpoint: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_capacity: Option<usize>,
    pub thumbnails: ThumbnailConfig,
    pub spread: SpreadConfig,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            padding: 10.0,
            reductions: vec![0.5, 1.0, 2.0, 3.0, 4.0, 6.0],
            redraw_interval: Duration::from_millis(250),
            one_page_breakpoint: 800.0,
            cache_capacity: None,
            thumbnails: ThumbnailConfig::default(),
            spread: SpreadConfig::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    pub padding: f32,
    pub row_buffer: usize,
    pub columns: u32,
    pub fallback_width: f32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "lazy_load_delay_ms")]
    pub lazy_load_delay: Duration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            padding: 10.0,
            row_buffer: 2,
            columns: 6,
            fallback_width: 100.0,
            lazy_load_delay: Duration::from_millis(300),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpreadConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "flip_duration_ms")]
    pub flip_duration: Duration,
    pub prefetch_distance: usize,
    pub prune_margin: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "stagger_delay_ms")]
    pub stagger_delay: Duration,
}

impl Default for SpreadConfig {
    fn default() -> Self {
        Self {
            flip_duration: Duration::from_millis(400),
            prefetch_distance: 3,
            prune_margin: 4,
            stagger_delay: Duration::from_millis(300),
        }
    }
}

impl ViewerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: ViewerConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config file {:?}", path))
    }

    /// Falls back to the defaults when `path` does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_table()?;
        let columns = self.thumbnails.columns;
        if !(MIN_THUMBNAIL_COLUMNS..=MAX_THUMBNAIL_COLUMNS).contains(&columns) {
            return Err(ConfigError::ThumbnailColumns(columns));
        }
        Ok(())
    }

    pub fn base_table(&self) -> Result<ReductionTable, ConfigError> {
        ReductionTable::from_ratios(&self.reductions)
    }
}
