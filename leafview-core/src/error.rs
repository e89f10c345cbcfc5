use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document has no pages")]
    Empty,
    #[error("page {index} has a zero dimension ({width}x{height})")]
    ZeroSizedPage { index: usize, width: u32, height: u32 },
    #[error("failed to decode manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reduction table is empty")]
    EmptyReductionTable,
    #[error("reduction ratio {0} must be a positive finite number")]
    InvalidRatio(f32),
    #[error("reduction table must be sorted ascending ({previous} precedes {next})")]
    Unsorted { previous: f32, next: f32 },
    #[error("reduction table declares more than one `auto` factor")]
    DuplicateAuto,
    #[error("thumbnail columns must lie within 2..=8, got {0}")]
    ThumbnailColumns(u32),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewerError {
    #[error("no page labelled {0:?}")]
    PageNotFound(String),
}
