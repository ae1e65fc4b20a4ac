//! Model lifecycle: acquire the artifact, load it, unload it.

use crate::config::InferenceConfig;
use crate::dispatcher::{PlatformDispatcher, ResolvedEngine};
use crate::error::{InferenceError, Result};
use crate::session::{cancel_session, SessionInfo, SessionShared};
use chrono::{DateTime, Utc};
use lai_engine::{Engine, EngineVariant};
use lai_models::{DownloadError, DownloadManager, DownloadProgress, ModelArtifact};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Uninitialized,
    CheckingLocal,
    Downloading,
    Loading,
    Ready,
    Generating,
    Stopping,
    Unloaded,
    Failed,
}

impl ModelState {
    /// Whether an engine handle is live in this state.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Ready | Self::Generating | Self::Stopping)
    }
}

/// A loaded model. Exactly one exists while the controller is loaded.
struct EngineHandle {
    engine: Arc<dyn Engine>,
    model_path: Option<PathBuf>,
    loaded_at: DateTime<Utc>,
}

#[derive(Default)]
struct Slots {
    handle: Option<EngineHandle>,
    active: Option<Arc<SessionShared>>,
    unloading: bool,
}

/// Owns the engine handle and the model state machine.
///
/// `initialize()` and `unload()` are serialized against each other. Generation
/// sessions borrow the engine through [`ModelLifecycleController::begin_generation`]
/// and give it back through `finish_generation`.
pub struct ModelLifecycleController {
    resolved: ResolvedEngine,
    artifact: ModelArtifact,
    downloads: DownloadManager,
    state: watch::Sender<ModelState>,
    slots: Mutex<Slots>,
    ops: tokio::sync::Mutex<()>,
    download_cancel: Mutex<Option<CancellationToken>>,
    /// Unloads waiting for `ops`; a download starting meanwhile is cancelled.
    pending_unloads: AtomicUsize,
    stop_ack_timeout: Duration,
    generation_timeout: Duration,
}

impl ModelLifecycleController {
    pub fn new(resolved: ResolvedEngine, config: &InferenceConfig) -> Self {
        Self {
            resolved,
            artifact: config.artifact(),
            downloads: DownloadManager::new(),
            state: watch::channel(ModelState::Uninitialized).0,
            slots: Mutex::new(Slots::default()),
            ops: tokio::sync::Mutex::new(()),
            download_cancel: Mutex::new(None),
            pending_unloads: AtomicUsize::new(0),
            stop_ack_timeout: config.stop_ack_timeout(),
            generation_timeout: config.generation_timeout(),
        }
    }

    /// Resolve the platform engine and build a controller around it.
    pub fn from_dispatcher(dispatcher: &PlatformDispatcher, config: &InferenceConfig) -> Result<Self> {
        Ok(Self::new(dispatcher.resolve()?.clone(), config))
    }

    pub fn with_download_manager(mut self, downloads: DownloadManager) -> Self {
        self.downloads = downloads;
        self
    }

    pub fn state(&self) -> ModelState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    pub fn is_model_loaded(&self) -> bool {
        self.state().is_loaded()
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn resolved(&self) -> &ResolvedEngine {
        &self.resolved
    }

    pub fn variant(&self) -> EngineVariant {
        self.resolved.variant
    }

    pub(crate) fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.resolved.engine)
    }

    /// Path the current handle was loaded from, if loaded.
    pub fn loaded_model_path(&self) -> Option<PathBuf> {
        self.slots().handle.as_ref().and_then(|h| h.model_path.clone())
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.slots().handle.as_ref().map(|h| h.loaded_at)
    }

    pub fn active_session_info(&self) -> Option<SessionInfo> {
        self.slots().active.as_ref().map(|s| s.info())
    }

    pub async fn initialize(&self) -> Result<()> {
        self.initialize_with_progress(|_| {}).await
    }

    /// Make sure the model is loaded, downloading it first if needed.
    ///
    /// Returns immediately when already loaded. `on_progress` is called only
    /// while downloading.
    pub async fn initialize_with_progress<F>(&self, on_progress: F) -> Result<()>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let _op = self.ops.lock().await;

        if self.is_model_loaded() {
            tracing::debug!("Model already loaded");
            return Ok(());
        }

        match self.acquire_and_load(on_progress).await {
            Ok(handle) => {
                tracing::info!(
                    model = self.resolved.engine.name(),
                    path = ?handle.model_path,
                    "Model loaded"
                );
                let mut slots = self.slots();
                slots.handle = Some(handle);
                self.transition(ModelState::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::error!(model = self.resolved.engine.name(), "Model initialization failed: {}", e);
                self.transition(ModelState::Failed);
                Err(e)
            }
        }
    }

    async fn acquire_and_load<F>(&self, on_progress: F) -> Result<EngineHandle>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let model_path = if self.resolved.requires_model_file {
            Some(self.acquire(on_progress).await?)
        } else {
            None
        };

        self.transition(ModelState::Loading);
        let engine = self.engine();
        let load_path = model_path.clone();
        tokio::task::spawn_blocking(move || engine.load_model(load_path.as_deref()))
            .await
            .map_err(|e| InferenceError::LoadFailed(format!("load task failed: {e}")))?
            .map_err(|e| InferenceError::LoadFailed(e.to_string()))?;

        Ok(EngineHandle {
            engine: self.engine(),
            model_path,
            loaded_at: Utc::now(),
        })
    }

    async fn acquire<F>(&self, on_progress: F) -> Result<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let path = self.artifact.path.clone();

        // Published before the local check so an unload arriving from here on
        // can always reach it.
        let cancel = CancellationToken::new();
        *lock(&self.download_cancel) = Some(cancel.clone());
        if self.pending_unloads.load(Ordering::SeqCst) > 0 {
            cancel.cancel();
        }
        let result = self.acquire_with(&path, &cancel, on_progress).await;
        *lock(&self.download_cancel) = None;
        result
    }

    async fn acquire_with<F>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        self.transition(ModelState::CheckingLocal);

        if !self.downloads.exists(path) {
            self.transition(ModelState::Downloading);
            self.downloads
                .download_cancellable(
                    &self.artifact.url,
                    path,
                    self.artifact.auth_token.as_deref(),
                    cancel,
                    on_progress,
                )
                .await
                .map_err(|source| InferenceError::FileMissing {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        match self.artifact.local_len() {
            None => Err(InferenceError::FileMissing {
                path: path.to_path_buf(),
                source: DownloadError::Io(std::io::ErrorKind::NotFound.into()),
            }),
            Some(0) => {
                // Removed so the next initialize() downloads it again.
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!("Failed to remove empty model file {:?}: {}", path, e);
                }
                Err(InferenceError::FileEmpty(path.to_path_buf()))
            }
            Some(_) => Ok(path.to_path_buf()),
        }
    }

    /// Cancel an in-flight model download. Returns false if none is running.
    pub fn cancel_download(&self) -> bool {
        match lock(&self.download_cancel).as_ref() {
            Some(cancel) => {
                tracing::info!("Download cancelled");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Release the model.
    ///
    /// Any running session is cancelled first and the engine is only unloaded
    /// once it has let go. Engine failures are logged, never returned, so the
    /// handle is always released.
    pub async fn unload(&self) -> Result<()> {
        let pending = PendingUnload::new(&self.pending_unloads);
        self.cancel_download();
        let _op = self.ops.lock().await;
        drop(pending);

        if matches!(self.state(), ModelState::Uninitialized | ModelState::Unloaded) {
            return Ok(());
        }

        let active = {
            let mut slots = self.slots();
            slots.unloading = true;
            slots.active.clone()
        };

        if let Some(session) = active {
            tracing::info!(session = %session.id, "Cancelling active generation before unload");
            if let Err(e) = cancel_session(
                self,
                &session,
                self.stop_ack_timeout,
                Some(self.generation_timeout),
            )
            .await
            {
                tracing::warn!(error = %InferenceError::StopFailed(e.to_string()), "Continuing unload");
            }
        }

        let handle = self.slots().handle.take();
        if let Some(handle) = handle {
            let engine = handle.engine;
            match tokio::task::spawn_blocking(move || engine.unload_model()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %InferenceError::UnloadFailed(e.to_string()), "Releasing handle anyway")
                }
                Err(e) => {
                    tracing::warn!(error = %InferenceError::UnloadFailed(e.to_string()), "Releasing handle anyway")
                }
            }
        }

        let mut slots = self.slots();
        slots.active = None;
        slots.unloading = false;
        self.transition(ModelState::Unloaded);
        tracing::info!("Model unloaded");
        Ok(())
    }

    pub(crate) fn active_session(&self) -> Option<Arc<SessionShared>> {
        self.slots().active.clone()
    }

    /// Claim the engine for a new session: `Ready` → `Generating`.
    pub(crate) fn begin_generation(&self, session: Arc<SessionShared>) -> Result<Arc<dyn Engine>> {
        let mut slots = self.slots();
        match self.state() {
            ModelState::Ready if !slots.unloading => {
                let engine = slots
                    .handle
                    .as_ref()
                    .map(|h| Arc::clone(&h.engine))
                    .ok_or(InferenceError::ModelNotLoaded)?;
                slots.active = Some(session);
                self.transition(ModelState::Generating);
                Ok(engine)
            }
            ModelState::Generating | ModelState::Stopping => Err(InferenceError::Busy),
            _ => Err(InferenceError::ModelNotLoaded),
        }
    }

    pub(crate) fn mark_stopping(&self, id: Uuid) {
        let slots = self.slots();
        if slots.active.as_ref().is_some_and(|s| s.id == id) && self.state() == ModelState::Generating {
            self.transition(ModelState::Stopping);
        }
    }

    /// Give the engine back after a session's native call has returned.
    pub(crate) fn finish_generation(&self, id: Uuid) {
        let mut slots = self.slots();
        if !slots.active.as_ref().is_some_and(|s| s.id == id) {
            return;
        }
        slots.active = None;
        if !slots.unloading && matches!(self.state(), ModelState::Generating | ModelState::Stopping) {
            self.transition(ModelState::Ready);
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        lock(&self.slots)
    }

    fn transition(&self, next: ModelState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Model state changed");
        }
    }
}

/// Counts an unload from before it queues on `ops` until it holds it.
struct PendingUnload<'a>(&'a AtomicUsize);

impl<'a> PendingUnload<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingUnload<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
