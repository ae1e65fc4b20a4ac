//! Integration tests for model acquisition, loading and unloading.

mod common;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use common::*;
use lai_runtime::{
    DownloadError, DownloadManager, DownloadProgress, EngineVariant, GenerationRequest,
    InferenceError, ModelState, NetworkErrorKind, PlatformDispatcher, VlmInference,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ARTIFACT: &[u8] = b"litertlm model payload";

// =============================================================================
// Initialization
// =============================================================================

mod initialize {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let (inference, dir) = ready(engine).await;

        inference.initialize().await.unwrap();
        inference.initialize().await.unwrap();

        assert_eq!(Probe::count(&probe.loads), 1);
        assert_eq!(inference.state(), ModelState::Ready);
        assert!(inference.is_model_loaded());
        assert_eq!(
            probe.loaded_path.lock().unwrap().as_deref(),
            Some(dir.path().join(MODEL_FILE).as_path())
        );
    }

    #[tokio::test]
    async fn test_downloads_missing_artifact() {
        let addr = serve(Router::new().route("/model", get(|| async { ARTIFACT.to_vec() }))).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.model_url = format!("http://{addr}/model");

        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let inference = VlmInference::new(&dispatcher(ScriptedProvider::new(engine)), config).unwrap();

        let ticks: Arc<Mutex<Vec<DownloadProgress>>> = Arc::default();
        let sink = Arc::clone(&ticks);
        inference
            .initialize_with_progress(move |p| sink.lock().unwrap().push(p))
            .await
            .unwrap();

        let model = dir.path().join(MODEL_FILE);
        assert_eq!(std::fs::read(&model).unwrap(), ARTIFACT);
        assert_eq!(Probe::count(&probe.loads), 1);
        assert_eq!(inference.state(), ModelState::Ready);

        let ticks = ticks.lock().unwrap();
        assert!(!ticks.is_empty());
        assert!(ticks.windows(2).all(|w| w[0].bytes_written <= w[1].bytes_written));
        assert_eq!(ticks.last().unwrap().bytes_written, ARTIFACT.len() as u64);
    }

    #[tokio::test]
    async fn test_http_404_is_file_missing() {
        let addr = serve(Router::new().route("/model", get(|| async { StatusCode::NOT_FOUND }))).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.model_url = format!("http://{addr}/model");

        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let inference = VlmInference::new(&dispatcher(ScriptedProvider::new(engine)), config).unwrap();

        let err = inference.initialize().await.unwrap_err();
        assert!(matches!(err, InferenceError::FileMissing { .. }), "{err:?}");
        assert_eq!(err.network_error(), Some(NetworkErrorKind::Other));
        assert!(err.is_retryable());
        assert_eq!(inference.state(), ModelState::Failed);
        assert_eq!(Probe::count(&probe.loads), 0);
        assert!(!dir.path().join(MODEL_FILE).exists());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_no_connection() {
        let dir = tempfile::tempdir().unwrap();
        let inference = VlmInference::new(
            &dispatcher(ScriptedProvider::new(ScriptedEngine::new(&["hi"]))),
            config(dir.path()),
        )
        .unwrap();

        let err = inference.initialize().await.unwrap_err();
        assert_eq!(err.network_error(), Some(NetworkErrorKind::NoConnection));
    }

    #[tokio::test]
    async fn test_empty_artifact_is_file_empty() {
        let addr = serve(Router::new().route("/model", get(|| async { ARTIFACT.to_vec() }))).await;
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join(MODEL_FILE);
        std::fs::write(&model, b"").unwrap();
        let mut config = config(dir.path());
        config.model_url = format!("http://{addr}/model");

        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let inference = VlmInference::new(&dispatcher(ScriptedProvider::new(engine)), config).unwrap();

        let err = inference.initialize().await.unwrap_err();
        assert!(matches!(err, InferenceError::FileEmpty(_)), "{err:?}");
        assert!(err.is_retryable());
        assert_eq!(Probe::count(&probe.loads), 0);
        assert_eq!(inference.state(), ModelState::Failed);
        assert!(!model.exists());

        inference.initialize().await.unwrap();
        assert_eq!(std::fs::read(&model).unwrap(), ARTIFACT);
        assert_eq!(Probe::count(&probe.loads), 1);
        assert_eq!(inference.state(), ModelState::Ready);
    }

    #[tokio::test]
    async fn test_load_failure_then_retry() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path());

        let engine = ScriptedEngine::new(&["hi"]).failing_loads(1);
        let probe = engine.probe();
        let inference =
            VlmInference::new(&dispatcher(ScriptedProvider::new(engine)), config(dir.path())).unwrap();

        let err = inference.initialize().await.unwrap_err();
        match &err {
            InferenceError::LoadFailed(message) => assert!(message.contains("bad tensor header")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(inference.state(), ModelState::Failed);
        assert!(!inference.is_model_loaded());

        inference.initialize().await.unwrap();
        assert_eq!(inference.state(), ModelState::Ready);
        assert_eq!(Probe::count(&probe.loads), 2);
    }

    #[tokio::test]
    async fn test_bundled_model_skips_download() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let inference =
            VlmInference::new(&dispatcher(ScriptedProvider::bundled(engine)), config(dir.path())).unwrap();

        inference.initialize().await.unwrap();
        assert_eq!(inference.state(), ModelState::Ready);
        assert_eq!(Probe::count(&probe.loads), 1);
        assert!(probe.loaded_path.lock().unwrap().is_none());
        assert!(!dir.path().join(MODEL_FILE).exists());
    }

    #[tokio::test]
    async fn test_cancel_download() {
        let stalled = || async {
            let body = futures::stream::iter([Ok::<_, std::io::Error>(b"first chunk".to_vec())])
                .chain(futures::stream::pending());
            axum::body::Body::from_stream(body)
        };
        let addr = serve(Router::new().route("/model", get(stalled))).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.model_url = format!("http://{addr}/model");

        let inference = Arc::new(
            VlmInference::new(
                &dispatcher(ScriptedProvider::new(ScriptedEngine::new(&["hi"]))),
                config,
            )
            .unwrap(),
        );
        assert!(!inference.cancel_download());

        let task = {
            let inference = Arc::clone(&inference);
            tokio::spawn(async move { inference.initialize().await })
        };
        wait_for_state(&inference, ModelState::Downloading).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(inference.cancel_download());

        let err = task.await.unwrap().unwrap_err();
        assert!(
            matches!(err, InferenceError::FileMissing { source: DownloadError::Cancelled, .. }),
            "{err:?}"
        );
        assert!(!dir.path().join(MODEL_FILE).exists());
        assert!(!dir.path().join(format!("{MODEL_FILE}.part")).exists());
    }

    #[tokio::test]
    async fn test_custom_download_manager() {
        let addr = serve(Router::new().route("/model", get(|| async { ARTIFACT.to_vec() }))).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.model_url = format!("http://{addr}/model");

        let client = reqwest_client();
        let inference = VlmInference::with_download_manager(
            &dispatcher(ScriptedProvider::new(ScriptedEngine::new(&["hi"]))),
            config,
            DownloadManager::with_client(client),
        )
        .unwrap();

        inference.initialize().await.unwrap();
        assert!(dir.path().join(MODEL_FILE).exists());
    }

    fn reqwest_client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }
}

// =============================================================================
// Unloading
// =============================================================================

mod unload {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_unload_before_initialize_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let inference =
            VlmInference::new(&dispatcher(ScriptedProvider::new(engine)), config(dir.path())).unwrap();

        inference.unload().await.unwrap();
        assert_eq!(inference.state(), ModelState::Uninitialized);
        assert_eq!(Probe::count(&probe.unloads), 0);
    }

    #[tokio::test]
    async fn test_unload_is_idempotent() {
        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let (inference, _dir) = ready(engine).await;

        inference.unload().await.unwrap();
        inference.unload().await.unwrap();

        assert_eq!(inference.state(), ModelState::Unloaded);
        assert!(!inference.is_model_loaded());
        assert_eq!(Probe::count(&probe.unloads), 1);
    }

    #[tokio::test]
    async fn test_unload_tolerates_engine_failure() {
        let engine = ScriptedEngine::new(&["hi"]).failing_unload();
        let probe = engine.probe();
        let (inference, _dir) = ready(engine).await;

        inference.unload().await.unwrap();
        assert_eq!(inference.state(), ModelState::Unloaded);
        assert_eq!(Probe::count(&probe.unloads), 1);
    }

    #[tokio::test]
    async fn test_reload_after_unload() {
        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let (inference, _dir) = ready(engine).await;

        inference.unload().await.unwrap();
        inference.initialize().await.unwrap();
        assert_eq!(inference.state(), ModelState::Ready);
        assert_eq!(Probe::count(&probe.loads), 2);
    }

    #[tokio::test]
    async fn test_unload_during_acquisition_cancels_download() {
        let stalled = || async {
            let body = futures::stream::iter([Ok::<_, std::io::Error>(b"first chunk".to_vec())])
                .chain(futures::stream::pending());
            axum::body::Body::from_stream(body)
        };
        let addr = serve(Router::new().route("/model", get(stalled))).await;
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.model_url = format!("http://{addr}/model");

        let engine = ScriptedEngine::new(&["hi"]);
        let probe = engine.probe();
        let inference = Arc::new(
            VlmInference::new(&dispatcher(ScriptedProvider::new(engine)), config).unwrap(),
        );

        let mut states = inference.subscribe();
        let task = {
            let inference = Arc::clone(&inference);
            tokio::spawn(async move { inference.initialize().await })
        };
        states
            .wait_for(|s| *s != ModelState::Uninitialized)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), inference.unload())
            .await
            .expect("unload waited on a stalled download")
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(
            matches!(err, InferenceError::FileMissing { source: DownloadError::Cancelled, .. }),
            "{err:?}"
        );
        assert_eq!(inference.state(), ModelState::Unloaded);
        assert_eq!(Probe::count(&probe.loads), 0);
        assert!(!dir.path().join(MODEL_FILE).exists());
    }

    #[tokio::test]
    async fn test_generate_after_unload_is_not_loaded() {
        let (inference, _dir) = ready(ScriptedEngine::new(&["hi"])).await;
        inference.unload().await.unwrap();

        let err = inference.generate(GenerationRequest::new("Hello")).await.unwrap_err();
        assert!(matches!(err, InferenceError::ModelNotLoaded));
    }
}

// =============================================================================
// Platform resolution and model info
// =============================================================================

mod platform {
    use super::*;

    #[test]
    fn test_no_engine_is_unsupported_platform() {
        let dir = tempfile::tempdir().unwrap();
        let err = VlmInference::new(&PlatformDispatcher::new(), config(dir.path()))
            .err()
            .unwrap();
        assert!(matches!(err, InferenceError::UnsupportedPlatform(_)));
    }

    #[tokio::test]
    async fn test_generate_before_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let inference = VlmInference::new(
            &dispatcher(ScriptedProvider::new(ScriptedEngine::new(&["hi"]))),
            config(dir.path()),
        )
        .unwrap();

        let err = inference.generate(GenerationRequest::new("Hello")).await.unwrap_err();
        assert!(matches!(err, InferenceError::ModelNotLoaded));
        assert_eq!(err.to_string(), "Model not loaded. Call initialize() first.");
    }

    #[tokio::test]
    async fn test_model_info() {
        let (inference, _dir) = ready(ScriptedEngine::new(&["hi"]).text_only()).await;

        let info = inference.model_info();
        assert_eq!(info.platform, "test");
        assert_eq!(info.model_name, "Scripted");
        assert_eq!(info.variant, EngineVariant::TextOnly);
        assert!(info.is_loaded);
        assert_eq!(info.state, ModelState::Ready);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["variant"], "text_only");
        assert_eq!(json["state"], "ready");
    }

    #[tokio::test]
    async fn test_subscribe_sees_ready() {
        let dir = tempfile::tempdir().unwrap();
        write_model(dir.path());
        let inference = VlmInference::new(
            &dispatcher(ScriptedProvider::new(ScriptedEngine::new(&["hi"]))),
            config(dir.path()),
        )
        .unwrap();

        let mut rx = inference.subscribe();
        assert_eq!(*rx.borrow_and_update(), ModelState::Uninitialized);

        inference.initialize().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ModelState::Ready);
    }
}
