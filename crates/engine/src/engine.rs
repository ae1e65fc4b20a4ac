use std::fmt;
use std::path::Path;

use serde::Serialize;

/// Callback invoked by an engine for every generated fragment.
///
/// `is_final` is true on the last invocation of a generation call. Engines may
/// call it from any thread, but never concurrently.
pub type TokenCallback<'a> = &'a mut (dyn FnMut(&str, bool) + Send);

/// Which modality an engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineVariant {
    /// Accepts a prompt plus an optional image.
    Vision,
    /// Accepts prompts only.
    TextOnly,
}

impl EngineVariant {
    pub fn accepts_images(&self) -> bool {
        matches!(self, Self::Vision)
    }
}

impl fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vision => f.write_str("vision"),
            Self::TextOnly => f.write_str("text-only"),
        }
    }
}

/// How an engine reacts to [`Engine::stop_generation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStyle {
    /// The native call aborts and returns promptly once stop is requested.
    Hard,
    /// No native abort primitive. The generation call keeps running until it
    /// finishes on its own; callers must stop listening instead.
    Soft,
}

/// A native on-device model runtime.
///
/// All methods block for the duration of the native work and are expected to
/// be called from a blocking-capable thread. One generation runs at a time;
/// callers enforce this.
pub trait Engine: Send + Sync {
    /// Load the model into memory.
    ///
    /// `path` is the downloaded artifact, or `None` for engines whose model
    /// ships with the native runtime.
    fn load_model(&self, path: Option<&Path>) -> crate::Result<()>;

    /// Generate a response to a text prompt.
    ///
    /// Returns once the engine has emitted its final fragment, failed, or
    /// been cancelled.
    fn generate(&self, prompt: &str, on_token: TokenCallback<'_>) -> crate::Result<()>;

    /// Generate a response to a prompt about the image at `image_path`.
    ///
    /// Default implementation rejects the request. Vision engines override.
    fn generate_with_image(
        &self,
        _prompt: &str,
        _image_path: &Path,
        _on_token: TokenCallback<'_>,
    ) -> crate::Result<()> {
        Err(crate::EngineError::Unsupported(format!(
            "{} does not accept images",
            self.name()
        )))
    }

    /// Ask the running generation to stop.
    fn stop_generation(&self) -> crate::Result<()>;

    /// Release the loaded model.
    fn unload_model(&self) -> crate::Result<()>;

    fn cancel_style(&self) -> CancelStyle {
        CancelStyle::Hard
    }

    fn variant(&self) -> EngineVariant;

    /// Human-readable model name (e.g. "Gemma", "FastVLM").
    fn name(&self) -> &str;
}

/// Factory for an engine backend.
///
/// Backends register a provider per platform runtime; the dispatcher asks each
/// one whether it can run here and builds the first that can.
pub trait EngineProvider: Send + Sync {
    /// Platform label for this backend (e.g. "android", "ios").
    fn platform(&self) -> &str;

    fn variant(&self) -> EngineVariant;

    /// Whether the backend's native library is present in this process.
    fn is_available(&self) -> bool;

    /// Whether the engine loads a downloaded artifact, as opposed to a model
    /// bundled with the native runtime.
    fn requires_model_file(&self) -> bool {
        true
    }

    fn create(&self) -> crate::Result<Box<dyn Engine>>;
}
