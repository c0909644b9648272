//! Module Specifier Resolver
//!
//! Rewrites import specifiers so a dynamically loaded module can find its
//! dependencies: URLs and paths pass through, framework entry points go to local
//! shims sharing one framework instance, and bare packages go to a CDN mirror
//! that is told to leave the framework out of its bundle.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

lazy_static! {
    static ref SCHEME_RE: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").unwrap();

    /// `from '…'`, `import '…'`, `import('…')`
    static ref IMPORT_SPECIFIER_RE: Regex = Regex::new(concat!(
        r"(?P<head>\bfrom\s*|\bimport\s*\(\s*|\bimport\s*)",
        r#"(?P<open>['"])(?P<spec>[^'"\r\n]+)(?P<close>['"])"#,
    ))
    .unwrap();
}

#[derive(Debug, Clone)]
pub struct SpecifierResolver {
    mirror_host: String,
    shims: BTreeMap<String, String>,
    /// `react,react-dom`
    external: String,
}

impl Default for SpecifierResolver {
    fn default() -> Self {
        Self::new(&PipelineConfig::default())
    }
}

impl SpecifierResolver {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            mirror_host: config.mirror_host.clone(),
            shims: config.framework.shims.clone(),
            external: format!(
                "{},{}",
                config.framework.name, config.framework.dom_binding
            ),
        }
    }

    /// Apply the rule table. Idempotent: every output is itself a passthrough.
    pub fn resolve(&self, specifier: &str) -> String {
        if SCHEME_RE.is_match(specifier) || specifier.starts_with("//") {
            return specifier.to_string();
        }
        if specifier.starts_with("./")
            || specifier.starts_with("../")
            || specifier.starts_with('/')
        {
            return specifier.to_string();
        }
        if let Some(shim) = self.shims.get(specifier) {
            return shim.clone();
        }
        let sep = if specifier.contains('?') { '&' } else { '?' };
        format!(
            "https://{}/{}{}external={}",
            self.mirror_host, specifier, sep, self.external
        )
    }

    pub fn try_resolve(&self, specifier: &str) -> Result<String> {
        if specifier.is_empty() {
            return Err(PipelineError::ModuleResolution {
                specifier: specifier.to_string(),
                reason: "empty specifier".to_string(),
            });
        }
        if specifier.chars().any(char::is_whitespace) {
            return Err(PipelineError::ModuleResolution {
                specifier: specifier.to_string(),
                reason: "specifier contains whitespace".to_string(),
            });
        }
        Ok(self.resolve(specifier))
    }

    /// Rewrite every import specifier in `code`, touching only those whose
    /// resolution differs.
    pub fn rewrite_imports(&self, code: &str) -> Result<String> {
        let mut failure = None;
        let out = IMPORT_SPECIFIER_RE.replace_all(code, |caps: &Captures| {
            let spec = &caps["spec"];
            match self.try_resolve(spec) {
                Ok(resolved) if resolved != spec => format!(
                    "{}{}{}{}",
                    &caps["head"], &caps["open"], resolved, &caps["close"]
                ),
                Ok(_) => caps[0].to_string(),
                Err(e) => {
                    failure.get_or_insert(e);
                    caps[0].to_string()
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(out.into_owned()),
        }
    }
}

/// Ordered, de-duplicated import specifiers of `code`.
pub fn collect_specifiers(code: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for caps in IMPORT_SPECIFIER_RE.captures_iter(code) {
        let spec = caps["spec"].to_string();
        if !seen.contains(&spec) {
            seen.push(spec);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_table() {
        let r = SpecifierResolver::default();
        assert_eq!(
            r.resolve("lodash"),
            "https://esm.sh/lodash?external=react,react-dom"
        );
        assert_eq!(r.resolve("./local"), "./local");
        assert_eq!(r.resolve("../up/x.js"), "../up/x.js");
        assert_eq!(r.resolve("react"), "/shims/react.js");
        assert_eq!(r.resolve("react-dom/client"), "/shims/react-dom-client.js");
        assert_eq!(r.resolve("https://unpkg.com/x"), "https://unpkg.com/x");
        assert_eq!(r.resolve("blob:canvas/abc"), "blob:canvas/abc");
    }

    #[test]
    fn test_existing_query_uses_ampersand() {
        let r = SpecifierResolver::default();
        assert_eq!(
            r.resolve("three?target=es2020"),
            "https://esm.sh/three?target=es2020&external=react,react-dom"
        );
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let r = SpecifierResolver::default();
        let specs = [
            "lodash",
            "./a",
            "react",
            "react-dom",
            "@scope/pkg/sub",
            "https://x.dev/m.js",
        ];
        for spec in specs {
            let once = r.resolve(spec);
            assert_eq!(r.resolve(&once), once, "not idempotent for {}", spec);
        }
    }

    #[test]
    fn test_try_resolve_rejects_bad_specifiers() {
        let r = SpecifierResolver::default();
        assert!(matches!(
            r.try_resolve(""),
            Err(PipelineError::ModuleResolution { .. })
        ));
        assert!(r.try_resolve("has space").is_err());
    }

    #[test]
    fn test_rewrite_imports() {
        let r = SpecifierResolver::default();
        let src = "import React, { useState } from 'react';\n\
                   import { chunk } from \"lodash\";\n\
                   import './styles.css';\n\
                   const m = import('date-fns');\n\
                   export { x } from './x.js';";
        let out = r.rewrite_imports(src).unwrap();
        assert!(out.contains("from '/shims/react.js'"));
        assert!(out.contains("from \"https://esm.sh/lodash?external=react,react-dom\""));
        assert!(out.contains("import './styles.css';"));
        assert!(out.contains("import('https://esm.sh/date-fns?external=react,react-dom')"));
        assert!(out.contains("from './x.js'"));
        assert_eq!(r.rewrite_imports(&out).unwrap(), out);
    }

    #[test]
    fn test_collect_specifiers() {
        let src = "import a from 'a';\nimport b from 'b';\nimport a2 from 'a';\nimport('c');";
        assert_eq!(collect_specifiers(src), vec!["a", "b", "c"]);
    }
}
