//! Error taxonomy for the component pipeline.
//!
//! Every stage reports a [`PipelineError`]. The orchestrator collapses them into a
//! `ProcessingResult`, so nothing here ever crosses the `process` boundary as a panic.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PipelineError {
    /// Empty or absent component source
    #[error("no component source was provided")]
    MissingSource,

    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("import normalization failed: {0}")]
    ImportNormalization(String),

    /// Markup lowering failed; carries the warnings gathered before the failure
    #[error("markup transpilation failed: {message}")]
    Transpile {
        message: String,
        warnings: Vec<String>,
    },

    #[error("cannot resolve module specifier \"{specifier}\": {reason}")]
    ModuleResolution { specifier: String, reason: String },

    #[error("module load timed out after {0} ms")]
    LoadTimeout(u64),

    /// Module loaded but threw, or could not be instantiated
    #[error("module failed validation: {0}")]
    ExecutionValidation(String),

    #[error("module does not export a renderable component")]
    NoComponentFound,

    /// Always recovered inside the cache; surfaced only through logs and stats
    #[error("cache storage error: {0}")]
    CacheIo(String),

    #[error("failed to fetch component source from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Stable, serializable names for each error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "MissingSourceError")]
    MissingSource,
    #[serde(rename = "UnsupportedFormatError")]
    UnsupportedFormat,
    #[serde(rename = "ImportNormalizationError")]
    ImportNormalization,
    #[serde(rename = "TranspileError")]
    Transpile,
    #[serde(rename = "ModuleResolutionError")]
    ModuleResolution,
    #[serde(rename = "LoadTimeoutError")]
    LoadTimeout,
    #[serde(rename = "ExecutionValidationError")]
    ExecutionValidation,
    #[serde(rename = "NoComponentFoundError")]
    NoComponentFound,
    #[serde(rename = "CacheIOError")]
    CacheIo,
    #[serde(rename = "FetchError")]
    Fetch,
    #[serde(rename = "ConfigError")]
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingSource => "MissingSourceError",
            ErrorKind::UnsupportedFormat => "UnsupportedFormatError",
            ErrorKind::ImportNormalization => "ImportNormalizationError",
            ErrorKind::Transpile => "TranspileError",
            ErrorKind::ModuleResolution => "ModuleResolutionError",
            ErrorKind::LoadTimeout => "LoadTimeoutError",
            ErrorKind::ExecutionValidation => "ExecutionValidationError",
            ErrorKind::NoComponentFound => "NoComponentFoundError",
            ErrorKind::CacheIo => "CacheIOError",
            ErrorKind::Fetch => "FetchError",
            ErrorKind::Config => "ConfigError",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MissingSource => ErrorKind::MissingSource,
            PipelineError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            PipelineError::ImportNormalization(_) => ErrorKind::ImportNormalization,
            PipelineError::Transpile { .. } => ErrorKind::Transpile,
            PipelineError::ModuleResolution { .. } => ErrorKind::ModuleResolution,
            PipelineError::LoadTimeout(_) => ErrorKind::LoadTimeout,
            PipelineError::ExecutionValidation(_) => ErrorKind::ExecutionValidation,
            PipelineError::NoComponentFound => ErrorKind::NoComponentFound,
            PipelineError::CacheIo(_) => ErrorKind::CacheIo,
            PipelineError::Fetch { .. } => ErrorKind::Fetch,
            PipelineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Warnings carried by the error itself (only transpile failures have any).
    pub fn warnings(&self) -> &[String] {
        match self {
            PipelineError::Transpile { warnings, .. } => warnings,
            _ => &[],
        }
    }

    /// Whether the failure happened at or after module resolution, where the
    /// pre-execution code is still meaningful for debugging.
    pub fn is_execution_stage(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ModuleResolution
                | ErrorKind::LoadTimeout
                | ErrorKind::ExecutionValidation
                | ErrorKind::NoComponentFound
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            PipelineError::NoComponentFound.kind().as_str(),
            "NoComponentFoundError"
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::CacheIo).unwrap(),
            "\"CacheIOError\""
        );
    }

    #[test]
    fn test_execution_stage_classification() {
        assert!(PipelineError::LoadTimeout(10).is_execution_stage());
        assert!(PipelineError::NoComponentFound.is_execution_stage());
        assert!(!PipelineError::ImportNormalization("x".into()).is_execution_stage());
        assert!(!PipelineError::Transpile {
            message: "x".into(),
            warnings: vec![]
        }
        .is_execution_stage());
    }

    #[test]
    fn test_transpile_warnings_are_exposed() {
        let err = PipelineError::Transpile {
            message: "bad".into(),
            warnings: vec!["w1".into()],
        };
        assert_eq!(err.warnings(), &["w1".to_string()]);
        assert!(PipelineError::MissingSource.warnings().is_empty());
    }
}
