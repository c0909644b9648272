//! Pipeline Orchestrator
//!
//! `ComponentPipeline::process` takes a `SourceModule` through classification,
//! import normalization, markup lowering and execution, and turns whatever
//! happens into a `ProcessingResult`. Nothing escapes as an error or a panic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::CacheService;
use crate::classify::{classify, modularize_legacy};
use crate::config::PipelineConfig;
use crate::error::{ErrorKind, PipelineError, Result};
use crate::executor::{log_stage, ExecuteOptions, ExecutionStage, ModuleExecutor};
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::jsx_lowerer::{contains_markup, transpile, TranspileOptions};
use crate::loader::{sha256_hex, EphemeralModuleLoader, HandleRegistry, StaticModuleLoader};
use crate::normalize::ImportNormalizer;
use crate::persistence::{MemoryStore, PersistenceStore};
use crate::resolve::collect_specifiers;
use crate::source::{
    CompiledArtifact, ComponentMetadata, ModuleFormat, ProcessingResult, SourceModule,
};

// ═══════════════════════════════════════════════════════════════════════════════
// STATS & FAILURE LOG
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct PipelineStats {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cache_hits: AtomicU64,
    total_elapsed_us: AtomicU64,
}

impl PipelineStats {
    fn record(&self, result: &ProcessingResult) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if result.from_cache {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.total_elapsed_us
            .fetch_add((result.elapsed_ms * 1000.0) as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cache_hits: u64,
    pub total_elapsed_ms: f64,
    pub cached_entries: usize,
    pub live_handles: usize,
    pub caching_enabled: bool,
}

/// A failed execution, kept for debugging only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub at: DateTime<Utc>,
    pub input_hash: String,
    pub error_kind: ErrorKind,
    pub error: String,
    pub compiled_code: String,
}

/// Bounded ring of recent execution failures. Never persisted.
pub struct FailureLog {
    records: Mutex<VecDeque<FailureRecord>>,
    capacity: usize,
}

impl FailureLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, record: FailureRecord) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<FailureRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PIPELINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Stage failure plus, for execution-stage failures, the pre-execution artifact.
type StageFailure = (PipelineError, Option<CompiledArtifact>);

pub struct ComponentPipeline {
    config: PipelineConfig,
    normalizer: ImportNormalizer,
    transpile_options: TranspileOptions,
    registry: Arc<HandleRegistry>,
    executor: ModuleExecutor,
    cache: CacheService,
    fetcher: Option<Arc<dyn SourceFetcher>>,
    stats: PipelineStats,
    failures: FailureLog,
}

impl ComponentPipeline {
    pub fn new(
        config: PipelineConfig,
        loader: Arc<dyn EphemeralModuleLoader>,
        store: Option<Arc<dyn PersistenceStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(HandleRegistry::new(loader));
        Ok(Self {
            normalizer: ImportNormalizer::new(&config.framework),
            transpile_options: TranspileOptions::from_framework(&config.framework),
            executor: ModuleExecutor::new(&config, registry.clone()),
            cache: CacheService::new(&config, store, registry.clone()),
            registry,
            fetcher: None,
            failures: FailureLog::new(config.failure_log_capacity),
            stats: PipelineStats::default(),
            config,
        })
    }

    /// In-process loader, in-memory cache store and the allow-listed HTTP fetcher.
    pub fn with_defaults(config: PipelineConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config)?;
        Ok(Self::new(
            config,
            Arc::new(StaticModuleLoader::new()),
            Some(Arc::new(MemoryStore::new())),
        )?
        .with_fetcher(Arc::new(fetcher)))
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.stats.processed.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            total_elapsed_ms: self.stats.total_elapsed_us.load(Ordering::Relaxed) as f64 / 1000.0,
            cached_entries: self.cache.len(),
            live_handles: self.registry.live_count(),
            caching_enabled: self.cache.is_enabled(),
        }
    }

    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        self.failures.snapshot()
    }

    pub async fn process(&self, module: SourceModule) -> ProcessingResult {
        let started = Instant::now();
        let mut warnings = Vec::new();

        let mut result = match self.run(&module, &mut warnings).await {
            Ok((artifact, from_cache)) => ProcessingResult::success(artifact, warnings, from_cache),
            Err((error, artifact)) => {
                warn!(
                    provenance = module.provenance.as_str(),
                    kind = error.kind().as_str(),
                    error = %error,
                    "component processing failed"
                );
                ProcessingResult::failure(&error, warnings, artifact)
            }
        };
        result.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.record(&result);
        result
    }

    async fn run(
        &self,
        module: &SourceModule,
        warnings: &mut Vec<String>,
    ) -> std::result::Result<(CompiledArtifact, bool), StageFailure> {
        let code = self.source_text(module).await.map_err(|e| (e, None))?;
        if code.trim().is_empty() {
            return Err((PipelineError::MissingSource, None));
        }

        let input_hash = sha256_hex(&code);
        let key = CacheService::key_for(module.provenance, &input_hash);
        let use_cache = module.wants_cache();

        if use_cache && !module.options.force_recompile {
            if let Some(entry) = self.cache.get(&key) {
                info!(key = %key, hits = entry.hit_count, "component served from cache");
                let mut artifact = entry.artifact;
                if let Some(metadata) = self.metadata_for(module) {
                    artifact.metadata = Some(metadata);
                }
                return Ok((artifact, true));
            }
        }

        log_stage(ExecutionStage::Classifying);
        let classification = classify(&code);
        let format = module.declared_format.unwrap_or(classification.format);
        debug!(?format, dialect = ?classification.dialect, "classified source");
        let mut working = match format {
            ModuleFormat::Module => code.clone(),
            ModuleFormat::LegacyScript => modularize_legacy(&code).map_err(|e| (e, None))?,
        };

        log_stage(ExecutionStage::Normalizing);
        let (normalized, normalize_warnings) = self
            .normalizer
            .normalize(&working)
            .into_result()
            .map_err(|e| (e, None))?;
        warnings.extend(normalize_warnings);
        working = normalized;

        if contains_markup(&working) {
            log_stage(ExecutionStage::Transpiling);
            match transpile(&working, &self.transpile_options).into_result() {
                Ok((lowered, transpile_warnings)) => {
                    warnings.extend(transpile_warnings);
                    working = lowered;
                }
                Err(e) => {
                    warnings.extend(e.warnings().iter().cloned());
                    return Err((e, None));
                }
            }
        }

        let options = ExecuteOptions {
            debug: module.options.debug,
            cache: use_cache && !module.options.force_recompile,
            timeout_ms: module
                .options
                .timeout_ms
                .unwrap_or(self.config.default_timeout_ms),
        };

        let executed = match self
            .executor
            .execute_module(&working, &options, Some(&self.cache))
            .await
        {
            Ok(executed) => executed,
            Err(failure) if !failure.error.is_execution_stage() => {
                return Err((failure.error, None));
            }
            Err(failure) => {
                let artifact = self.artifact(module, &working, &input_hash, None, None);
                self.failures.push(FailureRecord {
                    at: artifact.compiled_at,
                    input_hash: input_hash.clone(),
                    error_kind: failure.error.kind(),
                    error: failure.error.to_string(),
                    compiled_code: working,
                });
                return Err((failure.error, Some(artifact)));
            }
        };

        let from_cache = executed.cached.is_some();
        let mut artifact = self.artifact(
            module,
            &working,
            &input_hash,
            Some(executed.load_url.clone()),
            Some(executed.component_export.clone()),
        );
        artifact.byte_size = executed.metadata.byte_size;
        artifact.dependencies = executed.metadata.dependencies.clone();

        if use_cache {
            if !self.cache.put(&key, artifact.clone()) {
                artifact.load_url = None;
            }
        } else {
            self.registry.release(&executed.load_url);
            artifact.load_url = None;
        }

        info!(
            provenance = module.provenance.as_str(),
            component = %executed.component_export,
            load_ms = executed.metadata.load_time_ms,
            "component compiled"
        );
        Ok((artifact, from_cache))
    }

    async fn source_text(&self, module: &SourceModule) -> Result<String> {
        if !module.code.trim().is_empty() || !module.provenance.is_remote() {
            return Ok(module.code.clone());
        }
        let url = module
            .origin
            .as_ref()
            .and_then(|o| o.url.as_deref())
            .ok_or(PipelineError::MissingSource)?;
        let fetcher = self.fetcher.as_ref().ok_or_else(|| PipelineError::Fetch {
            url: url.to_string(),
            reason: "no source fetcher configured".to_string(),
        })?;
        fetcher.fetch(url).await
    }

    fn metadata_for(&self, module: &SourceModule) -> Option<ComponentMetadata> {
        module.origin.as_ref().map(|origin| ComponentMetadata {
            name: origin.name.clone(),
            description: origin.description.clone(),
            tags: origin.tags.clone(),
            source_url: origin.url.clone(),
        })
    }

    fn artifact(
        &self,
        module: &SourceModule,
        compiled_code: &str,
        input_hash: &str,
        load_url: Option<String>,
        component_export: Option<String>,
    ) -> CompiledArtifact {
        CompiledArtifact {
            compiled_code: compiled_code.to_string(),
            input_hash: input_hash.to_string(),
            output_hash: sha256_hex(compiled_code),
            compiled_at: Utc::now(),
            compiler_version_tag: self.config.compiler_version_tag.clone(),
            load_url,
            byte_size: compiled_code.len(),
            dependencies: collect_specifiers(compiled_code),
            component_export,
            metadata: self.metadata_for(module),
        }
    }
}
