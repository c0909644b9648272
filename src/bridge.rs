//! Node bindings over one process-wide pipeline.

use lazy_static::lazy_static;
use napi_derive::napi;

use crate::classify::classify;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::jsx_lowerer::contains_markup;
use crate::pipeline::ComponentPipeline;
use crate::resolve::SpecifierResolver;
use crate::source::SourceModule;

lazy_static! {
    static ref PIPELINE: Result<ComponentPipeline, PipelineError> =
        ComponentPipeline::with_defaults(PipelineConfig::default());
}

fn pipeline() -> napi::Result<&'static ComponentPipeline> {
    PIPELINE
        .as_ref()
        .map_err(|e| napi::Error::from_reason(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> napi::Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| napi::Error::from_reason(e.to_string()))
}

#[napi]
pub async fn process_component_native(module_json: String) -> napi::Result<serde_json::Value> {
    let module: SourceModule = serde_json::from_str(&module_json)
        .map_err(|e| napi::Error::from_reason(format!("invalid source module: {}", e)))?;
    let result = pipeline()?.process(module).await;
    to_json(&result)
}

#[napi]
pub fn resolve_specifier_native(specifier: String) -> napi::Result<String> {
    SpecifierResolver::new(pipeline()?.config())
        .try_resolve(&specifier)
        .map_err(|e| napi::Error::from_reason(e.to_string()))
}

#[napi]
pub fn classify_source_native(code: String) -> napi::Result<serde_json::Value> {
    to_json(&classify(&code))
}

#[napi]
pub fn contains_markup_native(code: String) -> bool {
    contains_markup(&code)
}

#[napi]
pub fn clear_cache_native() -> napi::Result<()> {
    pipeline()?.clear_cache();
    Ok(())
}

#[napi]
pub fn pipeline_stats_native() -> napi::Result<serde_json::Value> {
    to_json(&pipeline()?.stats())
}
