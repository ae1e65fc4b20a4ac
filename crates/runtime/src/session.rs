//! Streaming generation sessions.
//!
//! A native engine reports fragments through a callback on a blocking thread.
//! Each session moves them through three stages:
//!
//! 1. the callback pushes raw fragments into an intermediate queue, dropping
//!    them once the session is cancelled. The queue is not capacity-bounded so
//!    the native call never blocks on the consumer; it holds at most one
//!    generation's output and is discarded with the session;
//! 2. a forwarder task filters control tokens, numbers the survivors and hands
//!    them to the consumer one at a time. At most one event waits there;
//! 3. the consumer reads a [`TokenStream`], which ends as soon as the session is
//!    cancelled, even if events are still queued.
//!
//! Stage 3 is what makes `stop()` exact: once it returns, the stream yields
//! nothing more, whether or not the engine has actually stopped computing.

use crate::error::{InferenceError, Result};
use crate::filter::TokenFilter;
use crate::lifecycle::ModelLifecycleController;
use crate::request::{GenerationRequest, ValidatedRequest};
use chrono::{DateTime, Utc};
use futures::Stream;
use lai_engine::{CancelStyle, Engine, EngineError};
use serde::Serialize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One filtered fragment of generated text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenEvent {
    pub text: String,
    /// Starts at 1 and increases by one per delivered event.
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    StopRequested,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// State shared between a session's driver, its stream and the controller.
pub(crate) struct SessionShared {
    pub(crate) id: Uuid,
    started_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    native_stop_requested: AtomicBool,
    last_sequence: AtomicU64,
    done: watch::Sender<bool>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: Mutex::new(SessionState::Running),
            cancel: CancellationToken::new(),
            native_stop_requested: AtomicBool::new(false),
            last_sequence: AtomicU64::new(0),
            done: watch::channel(false).0,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move a running session to `StopRequested` and close its gate.
    ///
    /// Returns false if the session was not running.
    pub(crate) fn request_stop(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != SessionState::Running {
            return false;
        }
        *state = SessionState::StopRequested;
        self.cancel.cancel();
        true
    }

    pub(crate) fn mark_cancelled(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*state, SessionState::Completed | SessionState::Failed) {
            *state = SessionState::Cancelled;
        }
    }

    fn resolve(&self, outcome: SessionState) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            *state = if self.cancel.is_cancelled() {
                SessionState::Cancelled
            } else {
                outcome
            };
        }
        self.done.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            state: self.state(),
            last_sequence_number: self.last_sequence.load(Ordering::Acquire),
            started_at: self.started_at,
        }
    }

    /// Wait until the native call has returned. Returns false on timeout.
    pub(crate) async fn wait_done(&self, timeout: Duration) -> bool {
        let mut done = self.done.subscribe();
        tokio::time::timeout(timeout, done.wait_for(|d| *d))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

/// Summary of the session currently holding the engine.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: SessionState,
    pub last_sequence_number: u64,
    pub started_at: DateTime<Utc>,
}

/// Ask the engine to abort, at most once per session.
async fn request_native_stop(
    engine: &Arc<dyn Engine>,
    shared: &SessionShared,
) -> lai_engine::Result<()> {
    if engine.cancel_style() == CancelStyle::Soft
        || shared.native_stop_requested.swap(true, Ordering::AcqRel)
    {
        return Ok(());
    }
    let engine = Arc::clone(engine);
    tokio::task::spawn_blocking(move || engine.stop_generation())
        .await
        .map_err(|e| EngineError::Native(format!("stop task failed: {e}")))?
}

/// Cancel a session and wait for the engine to let go of it.
///
/// Hard-cancel engines are given `ack_timeout` to return. Soft-cancel engines
/// run to completion; `soft_timeout` bounds the wait, `None` skips it.
pub(crate) async fn cancel_session(
    controller: &ModelLifecycleController,
    shared: &SessionShared,
    ack_timeout: Duration,
    soft_timeout: Option<Duration>,
) -> lai_engine::Result<()> {
    shared.request_stop();
    controller.mark_stopping(shared.id);

    let engine = controller.engine();
    let (native, wait) = match engine.cancel_style() {
        CancelStyle::Hard => (request_native_stop(&engine, shared).await, Some(ack_timeout)),
        CancelStyle::Soft => (Ok(()), soft_timeout),
    };

    if let Some(wait) = wait {
        if !shared.wait_done(wait).await {
            tracing::warn!(
                session = %shared.id,
                "Engine did not return within {:?} of cancellation",
                wait
            );
        }
    }
    shared.mark_cancelled();
    native
}

/// Ordered stream of [`TokenEvent`]s for one generation.
///
/// Ends when the engine finishes, after a single `Err` if it fails, or
/// immediately once the session is stopped. Dropping the stream stops the
/// session.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<TokenEvent>>,
    shared: Arc<SessionShared>,
}

impl TokenStream {
    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn last_sequence_number(&self) -> u64 {
        self.shared.last_sequence.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("session_id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Stream for TokenStream {
    type Item = Result<TokenEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.shared.is_cancelled() {
            self.rx.close();
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if self.shared.request_stop() {
            tracing::debug!(session = %self.shared.id, "Token stream dropped while running");
        }
    }
}

/// Runs generations against the controller's engine, one at a time.
pub struct StreamingGenerationSession {
    controller: Arc<ModelLifecycleController>,
    filter: TokenFilter,
    generation_timeout: Duration,
    stop_ack_timeout: Duration,
}

impl StreamingGenerationSession {
    pub fn new(
        controller: Arc<ModelLifecycleController>,
        filter: TokenFilter,
        generation_timeout: Duration,
        stop_ack_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            filter,
            generation_timeout,
            stop_ack_timeout,
        }
    }

    pub fn controller(&self) -> &Arc<ModelLifecycleController> {
        &self.controller
    }

    pub fn is_running(&self) -> bool {
        self.controller
            .active_session()
            .is_some_and(|s| s.state() == SessionState::Running)
    }

    /// Start a generation and return its token stream.
    ///
    /// Validation happens before anything else: an invalid request leaves the
    /// lifecycle untouched and never reaches the engine.
    pub async fn generate(&self, request: GenerationRequest) -> Result<TokenStream> {
        let request = request.validate()?;
        if request.image.is_some() && !self.controller.variant().accepts_images() {
            return Err(InferenceError::InvalidImage(format!(
                "{} engine does not accept images",
                self.controller.variant()
            )));
        }

        let shared = Arc::new(SessionShared::new());
        let engine = self.controller.begin_generation(Arc::clone(&shared))?;

        tracing::info!(
            session = %shared.id,
            with_image = request.image.is_some(),
            "Starting generation"
        );

        let (tx, rx) = mpsc::channel(1);
        let driver = Driver {
            controller: Arc::clone(&self.controller),
            engine,
            shared: Arc::clone(&shared),
            filter: self.filter.clone(),
            tx,
            deadline: Instant::now() + self.generation_timeout,
            stop_ack_timeout: self.stop_ack_timeout,
        };
        tokio::spawn(driver.run(request));

        Ok(TokenStream { rx, shared })
    }

    /// Stop the running generation.
    ///
    /// When this returns, the session's stream yields no further events. With
    /// a hard-cancel engine it also waits (briefly) for the engine to
    /// acknowledge; a soft-cancel engine keeps computing in the background.
    pub async fn stop(&self) -> Result<()> {
        let session = self
            .controller
            .active_session()
            .ok_or_else(|| InferenceError::StopFailed("no generation in progress".into()))?;
        if session.state() != SessionState::Running {
            return Err(InferenceError::StopFailed("generation is not running".into()));
        }

        tracing::info!(session = %session.id, "Stop requested");
        cancel_session(&self.controller, &session, self.stop_ack_timeout, None)
            .await
            .map_err(|e| InferenceError::StopFailed(e.to_string()))?;

        if self.controller.engine().cancel_style() == CancelStyle::Soft {
            tracing::debug!(
                session = %session.id,
                "Soft cancel: engine keeps running for up to {:?}",
                self.generation_timeout
            );
        }
        Ok(())
    }
}

struct Fragment {
    text: String,
    is_final: bool,
}

enum Forward {
    /// The native call returned and every fragment was handled.
    Drained,
    Cancelled,
    ConsumerGone,
    TimedOut,
}

struct Driver {
    controller: Arc<ModelLifecycleController>,
    engine: Arc<dyn Engine>,
    shared: Arc<SessionShared>,
    filter: TokenFilter,
    tx: mpsc::Sender<Result<TokenEvent>>,
    deadline: Instant,
    stop_ack_timeout: Duration,
}

impl Driver {
    async fn run(self, request: ValidatedRequest) {
        let Driver {
            controller,
            engine,
            shared,
            filter,
            tx,
            deadline,
            stop_ack_timeout,
        } = self;
        let started = std::time::Instant::now();

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Fragment>();
        let gate = shared.cancel.clone();
        let native_engine = Arc::clone(&engine);
        let mut native = tokio::task::spawn_blocking(move || {
            let mut on_token = move |fragment: &str, is_final: bool| {
                if gate.is_cancelled() {
                    return;
                }
                let _ = raw_tx.send(Fragment {
                    text: fragment.to_owned(),
                    is_final,
                });
            };
            match &request.image {
                Some(image) => native_engine.generate_with_image(&request.prompt, image, &mut on_token),
                None => native_engine.generate(&request.prompt, &mut on_token),
            }
        });

        let cancel = shared.cancel.clone();
        let mut sequence = 0u64;
        let mut final_seen = false;
        // The deadline bounds the native call only. Once it has returned, what
        // is left is drained at the consumer's pace.
        let mut deadline_armed = true;

        let forward = 'forward: loop {
            let fragment = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'forward Forward::Cancelled,
                    _ = tokio::time::sleep_until(deadline), if deadline_armed => {
                        if !native.is_finished() {
                            break 'forward Forward::TimedOut;
                        }
                        deadline_armed = false;
                    }
                    fragment = raw_rx.recv() => break fragment,
                }
            };
            let Some(fragment) = fragment else {
                break Forward::Drained;
            };
            if final_seen {
                continue;
            }
            final_seen = fragment.is_final;

            let text = filter.apply(&fragment.text);
            if text.is_empty() {
                continue;
            }
            sequence += 1;
            let event = TokenEvent {
                text: text.into_owned(),
                sequence_number: sequence,
            };
            shared.last_sequence.store(sequence, Ordering::Release);
            let permit = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break 'forward Forward::Cancelled,
                    _ = tokio::time::sleep_until(deadline), if deadline_armed => {
                        if !native.is_finished() {
                            break 'forward Forward::TimedOut;
                        }
                        deadline_armed = false;
                    }
                    permit = tx.reserve() => break permit,
                }
            };
            match permit {
                Ok(permit) => permit.send(Ok(event)),
                Err(_) => break Forward::ConsumerGone,
            }
        };
        // Closing the intermediate stage makes late callbacks no-ops.
        drop(raw_rx);

        let native_result = match forward {
            Forward::Drained => Some(join_native(&mut native).await),
            Forward::Cancelled | Forward::ConsumerGone => {
                if let Err(e) = cancel_native(&controller, &engine, &shared).await {
                    tracing::warn!(session = %shared.id, "Engine stop failed: {}", e);
                }
                let wait = match engine.cancel_style() {
                    CancelStyle::Hard => stop_ack_timeout,
                    CancelStyle::Soft => deadline.saturating_duration_since(Instant::now()),
                };
                tokio::time::timeout(wait, join_native(&mut native)).await.ok()
            }
            Forward::TimedOut => {
                if let Err(e) = request_native_stop(&engine, &shared).await {
                    tracing::warn!(session = %shared.id, "Engine stop after timeout failed: {}", e);
                }
                tokio::time::timeout(stop_ack_timeout, join_native(&mut native))
                    .await
                    .ok()
            }
        };
        if native_result.is_none() {
            tracing::warn!(
                session = %shared.id,
                "Native generation still running; releasing the session without it"
            );
        }
        drop(engine);

        let (outcome, error) = if shared.is_cancelled() {
            (SessionState::Cancelled, None)
        } else {
            match (forward, native_result) {
                (Forward::TimedOut, _) => (
                    SessionState::Failed,
                    Some(InferenceError::GenerationFailed(format!(
                        "timed out after {:.0?}",
                        started.elapsed()
                    ))),
                ),
                (_, Some(Ok(()))) => (SessionState::Completed, None),
                (_, Some(Err(EngineError::Cancelled))) => (SessionState::Cancelled, None),
                (_, Some(Err(e))) => (
                    SessionState::Failed,
                    Some(InferenceError::GenerationFailed(e.to_string())),
                ),
                (_, None) => (
                    SessionState::Failed,
                    Some(InferenceError::GenerationFailed("engine did not finish".into())),
                ),
            }
        };

        controller.finish_generation(shared.id);
        shared.resolve(outcome);

        match &error {
            Some(e) => tracing::warn!(session = %shared.id, "Generation failed: {}", e),
            None => tracing::info!(
                session = %shared.id,
                state = ?shared.state(),
                tokens = sequence,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Generation finished"
            ),
        }

        if let Some(error) = error {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tx.send(Err(error)) => {}
            }
        }
    }
}

/// Cancellation observed by the driver itself (stream dropped, or stop/unload
/// racing with completion). Makes sure the lifecycle shows `Stopping` and a
/// hard engine is asked to abort.
async fn cancel_native(
    controller: &ModelLifecycleController,
    engine: &Arc<dyn Engine>,
    shared: &SessionShared,
) -> lai_engine::Result<()> {
    shared.request_stop();
    controller.mark_stopping(shared.id);
    request_native_stop(engine, shared).await
}

async fn join_native(
    native: &mut tokio::task::JoinHandle<lai_engine::Result<()>>,
) -> lai_engine::Result<()> {
    native
        .await
        .map_err(|e| EngineError::Native(format!("generation task failed: {e}")))?
}
