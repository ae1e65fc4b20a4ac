use lai_models::{DownloadError, NetworkErrorKind};
use serde::{Serialize, Serializer};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model file not found at {path:?}: {source}")]
    FileMissing {
        path: PathBuf,
        #[source]
        source: DownloadError,
    },

    #[error("Model file is empty: {0:?}")]
    FileEmpty(PathBuf),

    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Model not loaded. Call initialize() first.")]
    ModelNotLoaded,

    #[error("Generation already in progress")]
    Busy,

    #[error("Prompt cannot be empty")]
    InvalidPrompt,

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Generation was stopped")]
    Cancelled,

    #[error("Failed to stop generation: {0}")]
    StopFailed(String),

    #[error("Failed to unload model: {0}")]
    UnloadFailed(String),
}

impl InferenceError {
    /// Network classification when the failure came from acquiring the model.
    pub fn network_error(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::FileMissing { source, .. } => source.network_kind(),
            _ => None,
        }
    }

    /// Whether repeating the failed operation may succeed. Acquisition and
    /// load failures are retried with `initialize()`, `GenerationFailed` with
    /// another generation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FileMissing { .. }
                | Self::FileEmpty(_)
                | Self::LoadFailed(_)
                | Self::GenerationFailed(_)
        )
    }
}

impl Serialize for InferenceError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;
