mod engine;

pub use engine::{CancelStyle, Engine, EngineProvider, EngineVariant, TokenCallback};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    LoadFailed(String),
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("generation was stopped")]
    Cancelled,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("native error: {0}")]
    Native(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
