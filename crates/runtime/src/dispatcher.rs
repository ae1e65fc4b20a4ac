//! Selection of the engine backend available in this process.

use crate::error::{InferenceError, Result};
use lai_engine::{Engine, EngineProvider, EngineVariant};
use std::sync::{Arc, OnceLock};

/// The engine chosen for this process, with the facts callers need about it.
#[derive(Clone)]
pub struct ResolvedEngine {
    pub engine: Arc<dyn Engine>,
    pub platform: String,
    pub variant: EngineVariant,
    pub requires_model_file: bool,
}

impl std::fmt::Debug for ResolvedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEngine")
            .field("engine", &self.engine.name())
            .field("platform", &self.platform)
            .field("variant", &self.variant)
            .field("requires_model_file", &self.requires_model_file)
            .finish()
    }
}

/// Registry of engine providers, resolved to a single engine on first use.
///
/// Vision-capable providers win over text-only ones; among equals the first
/// registered wins. The choice never changes afterwards.
#[derive(Default)]
pub struct PlatformDispatcher {
    providers: Vec<Box<dyn EngineProvider>>,
    resolved: OnceLock<ResolvedEngine>,
}

impl PlatformDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Box<dyn EngineProvider>) {
        tracing::debug!(
            "Registering engine provider: {} ({})",
            provider.platform(),
            provider.variant()
        );
        self.providers.push(provider);
    }

    pub fn with_provider(mut self, provider: Box<dyn EngineProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn resolve(&self) -> Result<&ResolvedEngine> {
        if let Some(resolved) = self.resolved.get() {
            return Ok(resolved);
        }

        let resolved = self.pick()?;
        tracing::info!(
            platform = %resolved.platform,
            variant = %resolved.variant,
            "Resolved inference engine: {}",
            resolved.engine.name()
        );
        // A concurrent resolve may have won; its engine is equivalent.
        let _ = self.resolved.set(resolved);
        self.resolved
            .get()
            .ok_or_else(|| InferenceError::UnsupportedPlatform("engine resolution failed".into()))
    }

    fn pick(&self) -> Result<ResolvedEngine> {
        let mut candidates: Vec<&dyn EngineProvider> = self
            .providers
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| p.is_available())
            .collect();
        // Stable sort keeps registration order within a variant.
        candidates.sort_by_key(|p| !p.variant().accepts_images());

        for provider in candidates {
            match provider.create() {
                Ok(engine) => {
                    return Ok(ResolvedEngine {
                        engine: Arc::from(engine),
                        platform: provider.platform().to_string(),
                        variant: provider.variant(),
                        requires_model_file: provider.requires_model_file(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Engine provider {} failed to start: {}", provider.platform(), e);
                }
            }
        }

        let registered: Vec<&str> = self.providers.iter().map(|p| p.platform()).collect();
        Err(InferenceError::UnsupportedPlatform(if registered.is_empty() {
            "no engine providers registered".to_string()
        } else {
            format!("no engine available (registered: {})", registered.join(", "))
        }))
    }
}
