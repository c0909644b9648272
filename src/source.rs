//! Request and result types flowing through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, PipelineError};

// ═══════════════════════════════════════════════════════════════════════════════
// SOURCE MODULE
// ═══════════════════════════════════════════════════════════════════════════════

/// Channel a component's source arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Generated,
    Library,
    UrlImport,
    UserProvided,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Generated => "generated",
            Provenance::Library => "library",
            Provenance::UrlImport => "url-import",
            Provenance::UserProvided => "user-provided",
        }
    }

    /// Whether the source text may have to be fetched before compiling.
    pub fn is_remote(&self) -> bool {
        matches!(self, Provenance::Library | Provenance::UrlImport)
    }

    /// Cache policy when the request does not state one. Hand-pasted code is
    /// edited constantly, so it is the only channel that skips the cache.
    pub fn caches_by_default(&self) -> bool {
        !matches!(self, Provenance::UserProvided)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleFormat {
    Module,
    LegacyScript,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    /// `None` falls back to [`Provenance::caches_by_default`]
    pub use_cache: Option<bool>,
    pub force_recompile: bool,
    pub debug: bool,
    /// `None` falls back to the configured default timeout
    pub timeout_ms: Option<u64>,
}

/// Where a library or URL-imported component came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteOrigin {
    pub url: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceModule {
    #[serde(default)]
    pub code: String,
    pub provenance: Provenance,
    #[serde(default)]
    pub declared_format: Option<ModuleFormat>,
    #[serde(default)]
    pub options: CompileOptions,
    #[serde(default)]
    pub origin: Option<RemoteOrigin>,
}

impl SourceModule {
    pub fn new(code: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            code: code.into(),
            provenance,
            declared_format: None,
            options: CompileOptions::default(),
            origin: None,
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_format(mut self, format: ModuleFormat) -> Self {
        self.declared_format = Some(format);
        self
    }

    pub fn with_origin(mut self, origin: RemoteOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn wants_cache(&self) -> bool {
        self.options
            .use_cache
            .unwrap_or_else(|| self.provenance.caches_by_default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILED ARTIFACT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledArtifact {
    pub compiled_code: String,
    pub input_hash: String,
    pub output_hash: String,
    pub compiled_at: DateTime<Utc>,
    pub compiler_version_tag: String,
    /// Ephemeral handle; must be released when the artifact is discarded
    pub load_url: Option<String>,
    pub byte_size: usize,
    pub dependencies: Vec<String>,
    /// Export chosen as the component, e.g. `default` or `default.Button`
    #[serde(default)]
    pub component_export: Option<String>,
    #[serde(default)]
    pub metadata: Option<ComponentMetadata>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESSING RESULT
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub success: bool,
    pub artifact: Option<CompiledArtifact>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub warnings: Vec<String>,
    pub elapsed_ms: f64,
    pub from_cache: bool,
}

impl ProcessingResult {
    pub fn success(artifact: CompiledArtifact, warnings: Vec<String>, from_cache: bool) -> Self {
        Self {
            success: true,
            artifact: Some(artifact),
            error: None,
            error_kind: None,
            warnings,
            elapsed_ms: 0.0,
            from_cache,
        }
    }

    /// Failure result. `artifact` is only ever attached for execution-stage
    /// failures, where it holds the pre-execution code for debugging.
    pub fn failure(
        error: &PipelineError,
        warnings: Vec<String>,
        artifact: Option<CompiledArtifact>,
    ) -> Self {
        Self {
            success: false,
            artifact,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            warnings,
            elapsed_ms: 0.0,
            from_cache: false,
        }
    }
}
