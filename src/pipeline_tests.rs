#[cfg(test)]
mod tests {
    use crate::cache::CacheService;
    use crate::error::ErrorKind;
    use crate::loader::sha256_hex;
    use crate::source::{CompileOptions, ModuleFormat, Provenance, RemoteOrigin, SourceModule};
    use crate::test_support::{
        memory_store, pipeline_with, CountingLoader, FlakyStore, StubFetcher,
    };
    use std::sync::atomic::Ordering;

    const COUNTER: &str = "import React, {} from 'react';\n\
                           const X=()=>{const [s,setS]=useState(0); return null}; \
                           export default X;";

    fn generated(code: &str) -> SourceModule {
        SourceModule::new(code, Provenance::Generated)
    }

    #[tokio::test]
    async fn test_empty_input_is_missing_source() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let result = pipeline.process(generated("   \n")).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::MissingSource));
        assert!(result.artifact.is_none());
    }

    #[tokio::test]
    async fn test_missing_hook_is_imported() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let result = pipeline.process(generated(COUNTER)).await;
        assert!(result.success, "{:?}", result.error);
        let artifact = result.artifact.unwrap();
        assert!(artifact
            .compiled_code
            .starts_with("import React, { useState } from 'react';\n"));
        assert_eq!(artifact.component_export.as_deref(), Some("default"));
        assert_eq!(artifact.dependencies, vec!["/shims/react.js".to_string()]);
        assert!(artifact.load_url.unwrap().starts_with("blob:canvas/"));
    }

    #[tokio::test]
    async fn test_destructured_hook_is_not_imported_twice() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let code = "import React from 'react';\nconst { useState } = React;\n\
                    export default function A() { const [s] = useState(0); return null; }";
        let result = pipeline.process(generated(code)).await;
        assert!(result.success, "{:?}", result.error);
        let compiled = result.artifact.unwrap().compiled_code;
        assert!(compiled.starts_with("import React from 'react';\n"));
        assert_eq!(compiled.matches("useState }").count(), 1);
    }

    #[tokio::test]
    async fn test_identical_compiles_import_once() {
        let loader = CountingLoader::new(40);
        let pipeline = pipeline_with(loader.clone(), memory_store());

        let first = pipeline.process(generated(COUNTER)).await;
        let second = pipeline.process(generated(COUNTER)).await;

        assert!(first.success && second.success);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(loader.loads(), 1);
        assert!(second.elapsed_ms < first.elapsed_ms);

        let key = CacheService::key_for(Provenance::Generated, &sha256_hex(COUNTER));
        assert_eq!(pipeline.cache().get(&key).unwrap().hit_count, 2);
        assert_eq!(pipeline.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_no_component_fails_without_cache_write() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let code = "export const helper = () => 1;\nexport default { size: 2 };";
        let result = pipeline.process(generated(code)).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NoComponentFound));
        let artifact = result.artifact.unwrap();
        assert_eq!(artifact.compiled_code, code);
        assert!(artifact.load_url.is_none());
        assert!(pipeline.cache().is_empty());
        assert_eq!(pipeline.registry().live_count(), 0);

        let failures = pipeline.recent_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error_kind, ErrorKind::NoComponentFound);
    }

    #[tokio::test]
    async fn test_loader_setup_failure_keeps_no_debug_artifact() {
        let loader = CountingLoader::new(0);
        let pipeline = pipeline_with(loader.clone(), memory_store());
        loader.go_offline();
        let result = pipeline.process(generated(COUNTER)).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Config));
        assert!(result.artifact.is_none());
        assert!(pipeline.recent_failures().is_empty());
        assert_eq!(loader.loads(), 0);
    }

    #[tokio::test]
    async fn test_markup_is_lowered() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let code = "import React from 'react';\n\
                    export default function Card() { return <div className=\"card\">hi</div>; }";
        let result = pipeline.process(generated(code)).await;
        assert!(result.success, "{:?}", result.error);
        let compiled = result.artifact.unwrap().compiled_code;
        assert!(compiled.contains("React.createElement(\"div\""));
        assert!(!compiled.contains("<div"));
    }

    #[tokio::test]
    async fn test_transpile_failure_attaches_nothing() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let code = "import React from 'react';\nexport default function A() { return <div>; }";
        let result = pipeline.process(generated(code)).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Transpile));
        assert!(result.artifact.is_none());
        assert!(pipeline.cache().is_empty());
        assert!(pipeline.recent_failures().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_script_is_modularized() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let code = "function Badge() {\n  return <span>new</span>;\n}";
        let result = pipeline.process(generated(code)).await;
        assert!(result.success, "{:?}", result.error);
        let compiled = result.artifact.unwrap().compiled_code;
        assert!(compiled.contains("export default Badge;"));
        assert!(compiled.contains("React.createElement(\"span\""));
    }

    #[tokio::test]
    async fn test_declared_format_overrides_classification() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let module =
            generated("function Panel() { return null; }").with_format(ModuleFormat::Module);
        let result = pipeline.process(module).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NoComponentFound));
    }

    #[tokio::test]
    async fn test_user_provided_is_not_cached() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let result = pipeline
            .process(SourceModule::new(COUNTER, Provenance::UserProvided))
            .await;
        assert!(result.success);
        assert!(result.artifact.unwrap().load_url.is_none());
        assert!(pipeline.cache().is_empty());
        assert_eq!(pipeline.registry().live_count(), 0);
    }

    #[tokio::test]
    async fn test_force_recompile_imports_again() {
        let loader = CountingLoader::new(0);
        let pipeline = pipeline_with(loader.clone(), memory_store());
        pipeline.process(generated(COUNTER)).await;
        let forced = generated(COUNTER).with_options(CompileOptions {
            force_recompile: true,
            ..Default::default()
        });
        let result = pipeline.process(forced).await;
        assert!(result.success);
        assert!(!result.from_cache);
        assert_eq!(loader.loads(), 2);
        assert_eq!(pipeline.cache().len(), 1);
        assert_eq!(pipeline.registry().live_count(), 1);
    }

    #[tokio::test]
    async fn test_same_output_from_another_channel_reuses_module() {
        let loader = CountingLoader::new(0);
        let pipeline = pipeline_with(loader.clone(), memory_store());
        pipeline.process(generated(COUNTER)).await;
        let result = pipeline
            .process(SourceModule::new(COUNTER, Provenance::Library))
            .await;
        assert!(result.success);
        assert!(result.from_cache);
        assert_eq!(loader.loads(), 1);
        assert_eq!(pipeline.cache().len(), 2);
        let url = result.artifact.unwrap().load_url.unwrap();
        assert_eq!(pipeline.registry().ref_count(&url), 2);
    }

    #[tokio::test]
    async fn test_timeout_keeps_code_for_debugging() {
        let pipeline = pipeline_with(CountingLoader::new(200), memory_store());
        let module = generated(COUNTER).with_options(CompileOptions {
            timeout_ms: Some(10),
            ..Default::default()
        });
        let result = pipeline.process(module).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::LoadTimeout));
        assert!(result.artifact.unwrap().compiled_code.contains("useState"));
        assert!(pipeline.cache().is_empty());
        assert_eq!(pipeline.recent_failures().len(), 1);
    }

    #[tokio::test]
    async fn test_url_import_fetches_and_enriches_metadata() {
        let fetcher = StubFetcher::new("export default function Remote() { return null; }");
        let pipeline =
            pipeline_with(CountingLoader::new(0), memory_store()).with_fetcher(fetcher.clone());
        let module = SourceModule::new("", Provenance::UrlImport).with_origin(RemoteOrigin {
            url: Some("https://esm.sh/remote-widget".to_string()),
            name: Some("Remote".to_string()),
            description: Some("a remote widget".to_string()),
            tags: vec!["demo".to_string()],
        });
        let result = pipeline.process(module).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        let metadata = result.artifact.unwrap().metadata.unwrap();
        assert_eq!(metadata.name.as_deref(), Some("Remote"));
        assert_eq!(metadata.source_url.as_deref(), Some("https://esm.sh/remote-widget"));
        assert_eq!(metadata.tags, vec!["demo".to_string()]);
    }

    #[tokio::test]
    async fn test_remote_source_without_fetcher_fails() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        let module = SourceModule::new("", Provenance::Library).with_origin(RemoteOrigin {
            url: Some("https://esm.sh/x".to_string()),
            ..Default::default()
        });
        let result = pipeline.process(module).await;
        assert_eq!(result.error_kind, Some(ErrorKind::Fetch));
    }

    #[tokio::test]
    async fn test_cache_io_failure_never_fails_request() {
        let store = FlakyStore::new();
        let pipeline = pipeline_with(CountingLoader::new(0), Some(store.clone()));
        store.fail();
        let result = pipeline.process(generated(COUNTER)).await;
        assert!(result.success);
        assert!(result.artifact.unwrap().load_url.is_none());
        let stats = pipeline.stats();
        assert!(!stats.caching_enabled);
        assert_eq!(stats.live_handles, 0);
    }

    #[tokio::test]
    async fn test_clear_cache_and_stats() {
        let pipeline = pipeline_with(CountingLoader::new(0), memory_store());
        pipeline.process(generated(COUNTER)).await;
        pipeline.process(generated("")).await;
        let stats = pipeline.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cached_entries, 1);

        pipeline.clear_cache();
        assert_eq!(pipeline.stats().cached_entries, 0);
        assert_eq!(pipeline.registry().live_count(), 0);
    }
}
