mod config;
mod dispatcher;
mod error;
mod filter;
mod lifecycle;
mod request;
mod service;
mod session;

pub use config::{InferenceConfig, DEFAULT_GENERATION_TIMEOUT_SECS, DEFAULT_STOP_ACK_TIMEOUT_SECS};
pub use dispatcher::{PlatformDispatcher, ResolvedEngine};
pub use error::{InferenceError, Result};
pub use filter::{filter, TokenFilter, DEFAULT_CONTROL_TOKENS};
pub use lifecycle::{ModelLifecycleController, ModelState};
pub use request::{normalize_path, sniff_format, GenerationRequest, ImageFormat, ValidatedRequest};
pub use service::{ModelInfo, VlmInference};
pub use session::{SessionInfo, SessionState, StreamingGenerationSession, TokenEvent, TokenStream};

pub use lai_engine::{CancelStyle, Engine, EngineError, EngineProvider, EngineVariant, TokenCallback};
pub use lai_models::{DownloadError, DownloadManager, DownloadProgress, NetworkErrorKind};
