//! Runtime configuration.

use crate::filter::DEFAULT_CONTROL_TOKENS;
use lai_models::{ModelArtifact, DEFAULT_MODEL_FILE, DEFAULT_MODEL_URL};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on how long a single native generation call may run.
pub const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 300;

/// How long `stop()` waits for a hard-cancel engine to acknowledge.
pub const DEFAULT_STOP_ACK_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub models_dir: PathBuf,
    pub model_file_name: String,
    pub model_url: String,
    pub auth_token: Option<String>,
    pub filter_tokens: Vec<String>,
    pub generation_timeout_secs: u64,
    pub stop_ack_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            models_dir: lai_models::models_dir(),
            model_file_name: DEFAULT_MODEL_FILE.to_string(),
            model_url: DEFAULT_MODEL_URL.to_string(),
            auth_token: None,
            filter_tokens: DEFAULT_CONTROL_TOKENS.iter().map(|t| t.to_string()).collect(),
            generation_timeout_secs: DEFAULT_GENERATION_TIMEOUT_SECS,
            stop_ack_timeout_secs: DEFAULT_STOP_ACK_TIMEOUT_SECS,
        }
    }
}

impl InferenceConfig {
    /// Defaults overlaid with `LAI_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = var("LAI_MODELS_DIR") {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(url) = var("LAI_MODEL_URL") {
            self.model_url = url;
        }
        if let Some(name) = var("LAI_MODEL_FILE") {
            self.model_file_name = name;
        }
        if let Some(token) = var("LAI_AUTH_TOKEN").or_else(|| var("HF_TOKEN")) {
            self.auth_token = Some(token);
        }
        if let Some(secs) = var("LAI_GENERATION_TIMEOUT_SECS") {
            match secs.parse() {
                Ok(secs) => self.generation_timeout_secs = secs,
                Err(_) => tracing::warn!(value = %secs, "Ignoring invalid LAI_GENERATION_TIMEOUT_SECS"),
            }
        }
        self
    }

    pub fn artifact(&self) -> ModelArtifact {
        let artifact = ModelArtifact::new(&self.model_url, &self.models_dir, &self.model_file_name);
        match &self.auth_token {
            Some(token) => artifact.with_auth_token(token),
            None => artifact,
        }
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_secs)
    }

    pub fn stop_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_ack_timeout_secs)
    }
}
