//! Shared fixtures for the pipeline, cache and executor tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fetch::SourceFetcher;
use crate::loader::{
    sha256_hex, EphemeralModuleLoader, ModuleHandle, ModuleNamespace, StaticModuleLoader,
};
use crate::persistence::{MemoryStore, PersistenceStore};
use crate::pipeline::ComponentPipeline;
use crate::source::CompiledArtifact;

/// Static loader that counts loads and releases, with an optional load delay.
#[derive(Default)]
pub struct CountingLoader {
    inner: StaticModuleLoader,
    loads: AtomicUsize,
    releases: AtomicUsize,
    delay: Duration,
    offline: AtomicBool,
}

impl CountingLoader {
    pub fn new(delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::from_millis(delay_ms),
            ..Default::default()
        })
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Make every later `materialize` fail with a configuration error.
    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EphemeralModuleLoader for CountingLoader {
    fn materialize(&self, code: &str) -> Result<ModuleHandle> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PipelineError::Config("module loader is offline".to_string()));
        }
        self.inner.materialize(code)
    }

    async fn load(&self, handle: &ModuleHandle) -> Result<ModuleNamespace> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.load(handle).await
    }

    fn release(&self, url: &str) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(url);
    }
}

/// Memory store that can be switched into failing every call.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(PipelineError::CacheIo("disk full".to_string()))
        } else {
            Ok(())
        }
    }
}

impl PersistenceStore for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.remove(key)
    }
}

/// Fetcher serving one fixed body for every URL.
pub struct StubFetcher {
    pub body: String,
    pub calls: AtomicUsize,
}

impl StubFetcher {
    pub fn new(body: &str) -> Arc<Self> {
        Arc::new(Self {
            body: body.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SourceFetcher for StubFetcher {
    async fn fetch(&self, _url: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.body.clone())
    }
}

pub fn pipeline_with(
    loader: Arc<CountingLoader>,
    store: Option<Arc<dyn PersistenceStore>>,
) -> ComponentPipeline {
    ComponentPipeline::new(PipelineConfig::default(), loader, store).unwrap()
}

pub fn memory_store() -> Option<Arc<dyn PersistenceStore>> {
    Some(Arc::new(MemoryStore::new()))
}

pub fn artifact(code: &str, load_url: Option<String>) -> CompiledArtifact {
    CompiledArtifact {
        compiled_code: code.to_string(),
        input_hash: sha256_hex(code),
        output_hash: sha256_hex(code),
        compiled_at: Utc::now(),
        compiler_version_tag: PipelineConfig::default().compiler_version_tag,
        load_url,
        byte_size: code.len(),
        dependencies: Vec::new(),
        component_export: Some("default".to_string()),
        metadata: None,
    }
}
