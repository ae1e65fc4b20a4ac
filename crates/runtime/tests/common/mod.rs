//! Scripted engines and fixtures shared by the runtime integration tests.

#![allow(dead_code)]

use lai_runtime::{
    CancelStyle, Engine, EngineError, EngineProvider, EngineVariant, InferenceConfig, ModelState,
    PlatformDispatcher, TokenCallback, VlmInference,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const MODEL_FILE: &str = "gemma3n.litertlm";

pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

/// What the engine has been asked to do, observable after it is boxed.
#[derive(Default)]
pub struct Probe {
    pub loads: AtomicUsize,
    pub unloads: AtomicUsize,
    pub generations: AtomicUsize,
    pub stops: AtomicUsize,
    pub emitted: AtomicUsize,
    pub finished: AtomicUsize,
    pub loaded_path: Mutex<Option<PathBuf>>,
    pub last_image: Mutex<Option<PathBuf>>,
}

impl Probe {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Engine that replays a fixed list of fragments.
///
/// A gated engine emits one fragment per permit received on its channel and
/// runs freely once the sender is dropped.
pub struct ScriptedEngine {
    tokens: Vec<String>,
    style: CancelStyle,
    variant: EngineVariant,
    failing_loads: AtomicUsize,
    fail_unload: bool,
    fail_at: Option<usize>,
    permits: Option<Mutex<mpsc::Receiver<()>>>,
    stop_flag: AtomicBool,
    probe: Arc<Probe>,
}

impl ScriptedEngine {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            style: CancelStyle::Hard,
            variant: EngineVariant::Vision,
            failing_loads: AtomicUsize::new(0),
            fail_unload: false,
            fail_at: None,
            permits: None,
            stop_flag: AtomicBool::new(false),
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn soft(mut self) -> Self {
        self.style = CancelStyle::Soft;
        self
    }

    pub fn text_only(mut self) -> Self {
        self.variant = EngineVariant::TextOnly;
        self
    }

    pub fn failing_loads(self, count: usize) -> Self {
        self.failing_loads.store(count, Ordering::SeqCst);
        self
    }

    pub fn failing_unload(mut self) -> Self {
        self.fail_unload = true;
        self
    }

    /// Fail with a native error instead of emitting fragment `index`.
    pub fn failing_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn gated(mut self) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        self.permits = Some(Mutex::new(rx));
        (self, tx)
    }

    pub fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }

    /// Returns false if a hard stop arrived while waiting.
    fn wait_permit(&self) -> bool {
        loop {
            if self.style == CancelStyle::Hard && self.stop_flag.load(Ordering::SeqCst) {
                return false;
            }
            let Some(permits) = &self.permits else {
                return true;
            };
            match permits.lock().unwrap().recv_timeout(Duration::from_millis(5)) {
                Ok(()) => return true,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return true,
            }
        }
    }

    fn replay(&self, on_token: TokenCallback<'_>) -> lai_engine::Result<()> {
        self.probe.generations.fetch_add(1, Ordering::SeqCst);
        self.stop_flag.store(false, Ordering::SeqCst);

        let last = self.tokens.len().saturating_sub(1);
        let mut result = Ok(());
        for (i, token) in self.tokens.iter().enumerate() {
            if !self.wait_permit() {
                result = Err(EngineError::Cancelled);
                break;
            }
            if self.fail_at == Some(i) {
                result = Err(EngineError::GenerationFailed("decoder fault".into()));
                break;
            }
            on_token(token, i == last);
            self.probe.emitted.fetch_add(1, Ordering::SeqCst);
        }

        self.probe.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

impl Engine for ScriptedEngine {
    fn load_model(&self, path: Option<&Path>) -> lai_engine::Result<()> {
        self.probe.loads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(EngineError::LoadFailed("bad tensor header".into()));
        }
        *self.probe.loaded_path.lock().unwrap() = path.map(Path::to_path_buf);
        Ok(())
    }

    fn generate(&self, _prompt: &str, on_token: TokenCallback<'_>) -> lai_engine::Result<()> {
        self.replay(on_token)
    }

    fn generate_with_image(
        &self,
        _prompt: &str,
        image_path: &Path,
        on_token: TokenCallback<'_>,
    ) -> lai_engine::Result<()> {
        *self.probe.last_image.lock().unwrap() = Some(image_path.to_path_buf());
        self.replay(on_token)
    }

    fn stop_generation(&self) -> lai_engine::Result<()> {
        self.probe.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_flag.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn unload_model(&self) -> lai_engine::Result<()> {
        self.probe.unloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_unload {
            return Err(EngineError::Native("session already closed".into()));
        }
        Ok(())
    }

    fn cancel_style(&self) -> CancelStyle {
        self.style
    }

    fn variant(&self) -> EngineVariant {
        self.variant
    }

    fn name(&self) -> &str {
        "Scripted"
    }
}

pub struct ScriptedProvider {
    variant: EngineVariant,
    requires_model_file: bool,
    engine: Mutex<Option<ScriptedEngine>>,
}

impl ScriptedProvider {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self {
            variant: engine.variant,
            requires_model_file: true,
            engine: Mutex::new(Some(engine)),
        }
    }

    /// Provider whose model ships with the runtime.
    pub fn bundled(engine: ScriptedEngine) -> Self {
        Self {
            requires_model_file: false,
            ..Self::new(engine)
        }
    }
}

impl EngineProvider for ScriptedProvider {
    fn platform(&self) -> &str {
        "test"
    }

    fn variant(&self) -> EngineVariant {
        self.variant
    }

    fn is_available(&self) -> bool {
        true
    }

    fn requires_model_file(&self) -> bool {
        self.requires_model_file
    }

    fn create(&self) -> lai_engine::Result<Box<dyn Engine>> {
        self.engine
            .lock()
            .unwrap()
            .take()
            .map(|e| Box::new(e) as Box<dyn Engine>)
            .ok_or_else(|| EngineError::Native("engine already created".into()))
    }
}

pub fn dispatcher(provider: ScriptedProvider) -> PlatformDispatcher {
    PlatformDispatcher::new().with_provider(Box::new(provider))
}

/// Config rooted at `dir` whose download URL is never reachable.
pub fn config(dir: &Path) -> InferenceConfig {
    InferenceConfig {
        models_dir: dir.to_path_buf(),
        model_file_name: MODEL_FILE.to_string(),
        model_url: "http://127.0.0.1:9/unreachable".to_string(),
        generation_timeout_secs: 30,
        stop_ack_timeout_secs: 2,
        ..InferenceConfig::default()
    }
}

pub fn write_model(dir: &Path) -> PathBuf {
    let path = dir.join(MODEL_FILE);
    std::fs::write(&path, b"litertlm").unwrap();
    path
}

pub fn write_png(dir: &Path) -> PathBuf {
    let path = dir.join("photo.png");
    std::fs::write(&path, PNG).unwrap();
    path
}

/// A service with its model already loaded.
pub async fn ready(engine: ScriptedEngine) -> (VlmInference, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    write_model(dir.path());
    let inference =
        VlmInference::new(&dispatcher(ScriptedProvider::new(engine)), config(dir.path())).unwrap();
    inference.initialize().await.unwrap();
    (inference, dir)
}

pub async fn wait_for_state(inference: &VlmInference, state: ModelState) {
    let mut rx = inference.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("state never became {state:?}, is {:?}", inference.state()))
        .unwrap();
}

pub async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
