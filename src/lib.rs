//! # Canvas Component Compiler
//!
//! Turns component source text from an AI canvas into a loadable, validated
//! module:
//!
//! 1. **Classify**: ES module or legacy script, plain, typed or markup dialect.
//! 2. **Normalize**: patch the framework import with every primitive the code
//!    calls, and guard unsafe teardown statements.
//! 3. **Transpile**: lower embedded markup to factory calls, only when present.
//! 4. **Resolve**: rewrite import specifiers to shims, paths or a CDN mirror.
//! 5. **Execute**: materialize an ephemeral module, import it under a timeout
//!    and extract the component export.
//! 6. **Cache**: content-addressed by provenance and input hash, persisted
//!    through an injectable store.
//!
//! [`ComponentPipeline::process`] runs the whole sequence and always returns a
//! [`ProcessingResult`].

pub mod cache;
pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod jsx_lowerer;
pub mod loader;
pub mod normalize;
pub mod persistence;
pub mod pipeline;
pub mod resolve;
pub mod source;

#[cfg(feature = "napi")]
mod bridge;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod pipeline_tests;

pub use cache::{CacheEntry, CacheService};
pub use classify::{classify, is_module, Classification, Dialect};
pub use config::{FrameworkConfig, PipelineConfig};
pub use error::{ErrorKind, PipelineError, Result};
pub use executor::{
    extract_component, ExecuteOptions, ExecutedModule, ExecutionFailure, ExecutionResult,
    ExecutionStage, LoadMetadata, ModuleExecutor,
};
pub use fetch::{HttpFetcher, SourceFetcher};
pub use jsx_lowerer::{contains_markup, transpile, TranspileOptions, TranspileOutcome};
pub use loader::{
    EphemeralModuleLoader, HandleRegistry, ModuleHandle, ModuleNamespace, NamespaceValue,
    StaticModuleLoader,
};
pub use normalize::{normalize_imports, ImportNormalizer, NormalizeOutcome};
pub use persistence::{FileStore, MemoryStore, PersistenceStore};
pub use pipeline::{ComponentPipeline, FailureRecord, StatsSnapshot};
pub use resolve::{collect_specifiers, SpecifierResolver};
pub use source::{
    CompileOptions, CompiledArtifact, ComponentMetadata, ModuleFormat, ProcessingResult,
    Provenance, RemoteOrigin, SourceModule,
};

#[cfg(feature = "napi")]
pub use bridge::*;
