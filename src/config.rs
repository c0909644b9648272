//! Pipeline configuration
//!
//! Plain data with defaults. A host may override any subset from a JSON file;
//! missing fields keep their defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PipelineError, Result};

pub const DEFAULT_CACHE_CAPACITY: usize = 100;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MIRROR_HOST: &str = "esm.sh";
pub const DEFAULT_PERSISTENCE_KEY: &str = "component-cache";

/// The UI framework whose core entry points must stay singletons across
/// dynamically loaded modules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameworkConfig {
    /// Package name of the framework itself
    pub name: String,
    /// Package name of its DOM binding
    pub dom_binding: String,
    /// Framework-core specifier -> local shim URL
    pub shims: BTreeMap<String, String>,
    /// Call used to lower markup elements
    pub jsx_factory: String,
    /// Reference used as the element type for fragments
    pub jsx_fragment: String,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        let mut shims = BTreeMap::new();
        shims.insert("react".to_string(), "/shims/react.js".to_string());
        shims.insert("react-dom".to_string(), "/shims/react-dom.js".to_string());
        shims.insert(
            "react-dom/client".to_string(),
            "/shims/react-dom-client.js".to_string(),
        );
        shims.insert(
            "react/jsx-runtime".to_string(),
            "/shims/react-jsx-runtime.js".to_string(),
        );
        Self {
            name: "react".to_string(),
            dom_binding: "react-dom".to_string(),
            shims,
            jsx_factory: "React.createElement".to_string(),
            jsx_fragment: "React.Fragment".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    /// Stamped on every artifact and on the persisted cache document
    pub compiler_version_tag: String,
    /// Entry ceiling; exceeding it prunes the lowest-scoring quarter
    pub cache_capacity: usize,
    pub default_timeout_ms: u64,
    /// Content-delivery mirror for bare package specifiers
    pub mirror_host: String,
    pub framework: FrameworkConfig,
    /// Hosts the URL-import fetcher may contact
    pub allowed_import_domains: Vec<String>,
    /// Key under which the cache document is persisted
    pub persistence_key: String,
    /// How many recent execution failures are kept for debugging
    pub failure_log_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compiler_version_tag: concat!("canvas-compiler@", env!("CARGO_PKG_VERSION"))
                .to_string(),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            mirror_host: DEFAULT_MIRROR_HOST.to_string(),
            framework: FrameworkConfig::default(),
            allowed_import_domains: vec![
                "esm.sh".to_string(),
                "unpkg.com".to_string(),
                "cdn.jsdelivr.net".to_string(),
                "cdn.skypack.dev".to_string(),
            ],
            persistence_key: DEFAULT_PERSISTENCE_KEY.to_string(),
            failure_log_capacity: 8,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: PipelineConfig =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_capacity == 0 {
            return Err(PipelineError::Config(
                "cacheCapacity must be greater than zero".to_string(),
            ));
        }
        if self.mirror_host.trim().is_empty() || self.mirror_host.contains('/') {
            return Err(PipelineError::Config(format!(
                "mirrorHost must be a bare host name, got \"{}\"",
                self.mirror_host
            )));
        }
        if self.compiler_version_tag.is_empty() {
            return Err(PipelineError::Config(
                "compilerVersionTag must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
