mod download;

use std::path::{Path, PathBuf};

pub use download::{classify_message, DownloadError, DownloadManager, DownloadProgress, NetworkErrorKind};

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Gemma 3n E2B (int4, LiteRT-LM) on Hugging Face.
pub const DEFAULT_MODEL_URL: &str = "https://huggingface.co/google/gemma-3n-E2B-it-litert-lm/resolve/main/gemma-3n-E2B-it-int4.litertlm?download=true";

pub const DEFAULT_MODEL_FILE: &str = "gemma3n.litertlm";

/// Default directory holding downloaded model artifacts.
pub fn models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lai")
        .join("models")
}

/// A single-file model artifact and where it comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelArtifact {
    pub url: String,
    pub path: PathBuf,
    /// Bearer token sent with the download request.
    pub auth_token: Option<String>,
}

impl ModelArtifact {
    pub fn new(url: impl Into<String>, models_dir: &Path, file_name: &str) -> Self {
        Self {
            url: url.into(),
            path: models_dir.join(file_name),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn models_dir(&self) -> Option<&Path> {
        self.path.parent()
    }

    /// Length of the local file, or `None` if it does not exist.
    pub fn local_len(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

/// Staging path used while a download is in flight.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}
