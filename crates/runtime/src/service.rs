use crate::config::InferenceConfig;
use crate::dispatcher::PlatformDispatcher;
use crate::error::{InferenceError, Result};
use crate::filter::TokenFilter;
use crate::lifecycle::{ModelLifecycleController, ModelState};
use crate::request::GenerationRequest;
use crate::session::{SessionState, StreamingGenerationSession, TokenStream};
use futures::StreamExt;
use lai_engine::EngineVariant;
use lai_models::{DownloadManager, DownloadProgress};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub platform: String,
    pub model_name: String,
    pub variant: EngineVariant,
    pub is_loaded: bool,
    pub state: ModelState,
}

/// Caller-facing inference service.
///
/// Every method is safe to call repeatedly and from any task.
pub struct VlmInference {
    controller: Arc<ModelLifecycleController>,
    session: StreamingGenerationSession,
}

impl VlmInference {
    pub fn new(dispatcher: &PlatformDispatcher, config: InferenceConfig) -> Result<Self> {
        let controller = ModelLifecycleController::from_dispatcher(dispatcher, &config)?;
        Ok(Self::from_controller(controller, &config))
    }

    /// Same as [`VlmInference::new`], downloading through `downloads`.
    pub fn with_download_manager(
        dispatcher: &PlatformDispatcher,
        config: InferenceConfig,
        downloads: DownloadManager,
    ) -> Result<Self> {
        let controller = ModelLifecycleController::from_dispatcher(dispatcher, &config)?
            .with_download_manager(downloads);
        Ok(Self::from_controller(controller, &config))
    }

    fn from_controller(controller: ModelLifecycleController, config: &InferenceConfig) -> Self {
        let controller = Arc::new(controller);
        let session = StreamingGenerationSession::new(
            Arc::clone(&controller),
            TokenFilter::new(config.filter_tokens.iter().cloned()),
            config.generation_timeout(),
            config.stop_ack_timeout(),
        );
        Self { controller, session }
    }

    pub fn controller(&self) -> &Arc<ModelLifecycleController> {
        &self.controller
    }

    pub async fn initialize(&self) -> Result<()> {
        self.controller.initialize().await
    }

    pub async fn initialize_with_progress<F>(&self, on_progress: F) -> Result<()>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        self.controller.initialize_with_progress(on_progress).await
    }

    pub fn cancel_download(&self) -> bool {
        self.controller.cancel_download()
    }

    /// Start a generation and return its token stream.
    pub async fn generate(&self, request: GenerationRequest) -> Result<TokenStream> {
        self.session.generate(request).await
    }

    /// Run a generation to completion, handing each filtered fragment to
    /// `on_token`. Returns the full response text.
    ///
    /// Returns `Cancelled` if the generation was stopped before it finished.
    pub async fn generate_streaming<F>(
        &self,
        prompt: &str,
        mut on_token: F,
        image: Option<&str>,
    ) -> Result<String>
    where
        F: FnMut(&str),
    {
        let mut request = GenerationRequest::new(prompt);
        if let Some(image) = image {
            request = request.with_image(image);
        }

        let mut stream = self.session.generate(request).await?;
        let mut response = String::new();
        while let Some(event) = stream.next().await {
            let event = event?;
            on_token(&event.text);
            response.push_str(&event.text);
        }

        match stream.state() {
            SessionState::Completed => Ok(response),
            SessionState::Failed => Err(InferenceError::GenerationFailed(
                "generation ended without a result".into(),
            )),
            _ => Err(InferenceError::Cancelled),
        }
    }

    /// Stop the running generation, if any.
    pub async fn stop_generation(&self) -> Result<()> {
        if !self.session.is_running() {
            tracing::debug!("No generation to stop");
            return Ok(());
        }
        self.session.stop().await
    }

    pub async fn unload(&self) -> Result<()> {
        self.controller.unload().await
    }

    pub fn is_model_loaded(&self) -> bool {
        self.controller.is_model_loaded()
    }

    pub fn state(&self) -> ModelState {
        self.controller.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.controller.subscribe()
    }

    pub fn platform(&self) -> &str {
        &self.controller.resolved().platform
    }

    pub fn model_name(&self) -> &str {
        self.controller.resolved().engine.name()
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            platform: self.platform().to_string(),
            model_name: self.model_name().to_string(),
            variant: self.controller.variant(),
            is_loaded: self.is_model_loaded(),
            state: self.state(),
        }
    }
}
