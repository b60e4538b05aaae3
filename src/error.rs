use std::path::PathBuf;
use thiserror::Error;

/// Failure to bring up the frozen encoder. Always fatal.
#[derive(Debug, Error)]
pub enum EncoderRestoreError {
    #[error("fail to restore encoder: no checkpoint at {path}. please check your encoder model")]
    Missing { path: PathBuf },

    #[error("fail to restore encoder from {path}. please check your encoder model: {source}")]
    Incompatible {
        path: PathBuf,
        #[source]
        source: burn::record::RecorderError,
    },

    #[error("fail to restore encoder from {path}: parameter shapes {found:?} do not match the configured encoder {expected:?}")]
    ShapeMismatch {
        path: PathBuf,
        expected: Vec<Vec<usize>>,
        found: Vec<Vec<usize>>,
    },
}

/// Rejected configuration, reported before any model is built.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown optimizer `{0}` (expected Adam or RMS)")]
    UnknownOptimizer(String),

    #[error("unknown objective `{0}` (expected wgan, lsgan or gan)")]
    UnknownObjective(String),

    #[error("unknown mode `{0}` (expected train or test)")]
    UnknownMode(String),

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("clip range is inverted: [{low}, {high}]")]
    InvertedClip { low: f64, high: f64 },

    #[error("image_size must be a positive multiple of 16, got {0}")]
    ImageSize(usize),

    #[error("load_size {load_size} is smaller than image_size {image_size}")]
    LoadSize { load_size: usize, image_size: usize },
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("dataset is empty")]
    EmptyDataset,

    #[error("class id {class} out of range for {num_classes} classes in {path}")]
    ClassOutOfRange {
        class: usize,
        num_classes: usize,
        path: PathBuf,
    },

    #[error("no dataset entry at index {0}")]
    MissingEntry(usize),

    #[error("data workers stopped")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoint found in {0}")]
    NotFound(PathBuf),

    #[error("failed to load {what} from {path}: {source}")]
    Load {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: burn::record::RecorderError,
    },
}
