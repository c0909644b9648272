//! Dynamic Loader/Executor
//!
//! Resolves the final code's imports, materializes it as an ephemeral module,
//! imports it under a timeout and picks the exported component. Concurrent
//! requests for the same handle share one in-flight load.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheService};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::loader::{sha256_hex, HandleRegistry, ModuleHandle, ModuleNamespace, NamespaceValue};
use crate::resolve::{collect_specifiers, SpecifierResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStage {
    Idle,
    Classifying,
    Normalizing,
    Transpiling,
    Resolving,
    Materializing,
    Importing,
    Extracting,
    Validated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub debug: bool,
    /// Consult the cache for an entry with identical output
    pub cache: bool,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadMetadata {
    pub load_time_ms: f64,
    pub byte_size: usize,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedModule {
    pub resolved_code: String,
    /// One reference on this handle now belongs to the caller
    pub load_url: String,
    /// Export path of the component, e.g. `default` or `default.Button`
    pub component_export: String,
    pub metadata: LoadMetadata,
    /// Set when the result was served from the cache without importing
    pub cached: Option<CacheEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub error: PipelineError,
    /// Code after specifier rewriting, when that stage was reached
    pub resolved_code: Option<String>,
}

pub type ExecutionResult = std::result::Result<ExecutedModule, ExecutionFailure>;

type LoadOutput = std::result::Result<Arc<ModuleNamespace>, PipelineError>;
type SharedLoad = Shared<BoxFuture<'static, LoadOutput>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ModuleExecutor {
    registry: Arc<HandleRegistry>,
    resolver: SpecifierResolver,
    pending: Arc<Mutex<HashMap<String, SharedLoad>>>,
}

impl ModuleExecutor {
    pub fn new(config: &PipelineConfig, registry: Arc<HandleRegistry>) -> Self {
        Self {
            registry,
            resolver: SpecifierResolver::new(config),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Number of loads currently in flight.
    pub fn pending_loads(&self) -> usize {
        lock(&self.pending).len()
    }

    pub async fn execute_module(
        &self,
        code: &str,
        opts: &ExecuteOptions,
        cache: Option<&CacheService>,
    ) -> ExecutionResult {
        let started = Instant::now();

        if opts.cache {
            if let Some(hit) = cache.and_then(|c| self.cached(c, code)) {
                return Ok(hit);
            }
        }

        log_stage(ExecutionStage::Resolving);
        let resolved = self.resolver.rewrite_imports(code).map_err(|error| {
            log_stage(ExecutionStage::Failed);
            ExecutionFailure {
                error,
                resolved_code: None,
            }
        })?;
        if opts.debug {
            debug!(code = %resolved, "resolved module source");
        }

        let fail = |error: PipelineError, resolved: &str| {
            log_stage(ExecutionStage::Failed);
            warn!(error = %error, "module execution failed");
            ExecutionFailure {
                error,
                resolved_code: Some(resolved.to_string()),
            }
        };

        log_stage(ExecutionStage::Materializing);
        let handle = self
            .registry
            .acquire(&resolved)
            .map_err(|e| fail(e, &resolved))?;

        log_stage(ExecutionStage::Importing);
        let load = self.shared_load(&handle);
        let timeout = Duration::from_millis(opts.timeout_ms);
        let namespace = match tokio::time::timeout(timeout, load).await {
            Ok(Ok(ns)) => ns,
            Ok(Err(e)) => {
                self.registry.release(&handle.url);
                return Err(fail(e, &resolved));
            }
            Err(_) => {
                self.registry.release(&handle.url);
                return Err(fail(PipelineError::LoadTimeout(opts.timeout_ms), &resolved));
            }
        };

        log_stage(ExecutionStage::Extracting);
        let component_export = match extract_component(&namespace) {
            Ok(name) => name,
            Err(e) => {
                self.registry.release(&handle.url);
                return Err(fail(e, &resolved));
            }
        };

        log_stage(ExecutionStage::Validated);
        let metadata = LoadMetadata {
            load_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            byte_size: handle.byte_size,
            dependencies: collect_specifiers(&resolved),
        };
        Ok(ExecutedModule {
            resolved_code: resolved,
            load_url: handle.url,
            component_export,
            metadata,
            cached: None,
        })
    }

    fn cached(&self, cache: &CacheService, code: &str) -> Option<ExecutedModule> {
        let entry = cache.get_by_output_hash(&sha256_hex(code))?;
        let url = entry.artifact.load_url.clone()?;
        let resolved_code = self
            .resolver
            .rewrite_imports(&entry.artifact.compiled_code)
            .ok()?;
        if !self.registry.retain(&url) {
            return None;
        }
        debug!(url = %url, hits = entry.hit_count, "serving module from cache");
        Some(ExecutedModule {
            resolved_code,
            load_url: url,
            component_export: entry
                .artifact
                .component_export
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            metadata: LoadMetadata {
                load_time_ms: 0.0,
                byte_size: entry.artifact.byte_size,
                dependencies: entry.artifact.dependencies.clone(),
            },
            cached: Some(entry),
        })
    }

    /// Join the in-flight load for `handle`, or spawn one. The spawned task runs
    /// to completion even if every waiter gives up, then drops out of the map.
    fn shared_load(&self, handle: &ModuleHandle) -> SharedLoad {
        let mut pending = lock(&self.pending);
        if let Some(existing) = pending.get(&handle.url) {
            debug!(url = %handle.url, "joining in-flight module load");
            return existing.clone();
        }

        let loader = self.registry.loader().clone();
        let map = self.pending.clone();
        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            let result = loader.load(&task_handle).await.map(Arc::new);
            lock(&map).remove(&task_handle.url);
            trace!(url = %task_handle.url, ok = result.is_ok(), "module load settled");
            result
        });

        let shared = async move {
            task.await.unwrap_or_else(|e| {
                Err(PipelineError::ExecutionValidation(format!(
                    "module load task failed: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared();
        pending.insert(handle.url.clone(), shared.clone());
        shared
    }
}

pub(crate) fn log_stage(stage: ExecutionStage) {
    debug!(?stage, "execution stage");
}

fn is_capitalized(name: &str) -> bool {
    name.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
}

/// Pick the component export: callable default, callable `Component`, first
/// capitalized callable export, then first capitalized callable property of an
/// object default.
pub fn extract_component(namespace: &ModuleNamespace) -> Result<String, PipelineError> {
    let default = namespace.get("default");
    if default.map(NamespaceValue::is_callable).unwrap_or(false) {
        return Ok("default".to_string());
    }
    if namespace
        .get("Component")
        .map(NamespaceValue::is_callable)
        .unwrap_or(false)
    {
        return Ok("Component".to_string());
    }
    if let Some((name, _)) = namespace
        .iter()
        .find(|(name, value)| *name != "default" && is_capitalized(name) && value.is_callable())
    {
        return Ok(name.to_string());
    }
    if let Some(NamespaceValue::Object { entries }) = default {
        if let Some((name, _)) = entries
            .iter()
            .find(|(name, value)| is_capitalized(name) && value.is_callable())
        {
            return Ok(format!("default.{}", name));
        }
    }
    Err(PipelineError::NoComponentFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::evaluate_exports;

    fn func() -> NamespaceValue {
        NamespaceValue::Function { name: None }
    }

    fn prim() -> NamespaceValue {
        NamespaceValue::Primitive {
            repr: "1".to_string(),
        }
    }

    #[test]
    fn test_extraction_order() {
        let ns = ModuleNamespace::new(vec![
            ("Button".to_string(), func()),
            ("Component".to_string(), func()),
            ("default".to_string(), func()),
        ]);
        assert_eq!(extract_component(&ns).unwrap(), "default");

        let ns = ModuleNamespace::new(vec![
            ("Button".to_string(), func()),
            ("Component".to_string(), func()),
            ("default".to_string(), prim()),
        ]);
        assert_eq!(extract_component(&ns).unwrap(), "Component");

        let ns = ModuleNamespace::new(vec![
            ("helper".to_string(), func()),
            ("Card".to_string(), func()),
            ("Button".to_string(), func()),
        ]);
        assert_eq!(extract_component(&ns).unwrap(), "Card");
    }

    #[test]
    fn test_object_default_property() {
        let entries = vec![("size".to_string(), prim()), ("Widget".to_string(), func())];
        let ns = ModuleNamespace::new(vec![(
            "default".to_string(),
            NamespaceValue::Object { entries },
        )]);
        assert_eq!(extract_component(&ns).unwrap(), "default.Widget");
    }

    #[test]
    fn test_object_default_follows_declaration_order() {
        let ns = evaluate_exports(
            "const Zeta = () => null;\nconst Alpha = () => null;\nexport default { Zeta, Alpha };",
        )
        .unwrap();
        assert_eq!(extract_component(&ns).unwrap(), "default.Zeta");
    }

    #[test]
    fn test_no_component() {
        let ns = ModuleNamespace::new(vec![
            ("helper".to_string(), func()),
            ("Label".to_string(), prim()),
        ]);
        assert_eq!(
            extract_component(&ns).unwrap_err(),
            PipelineError::NoComponentFound
        );
    }
}
