//! Import Normalizer
//!
//! Makes sure the framework import lists every primitive the component calls, and
//! wraps known-unsafe teardown calls in guards. The import is patched textually;
//! the teardown statements are located with oxc so strings, comments and
//! look-alike code are never touched.

use lazy_static::lazy_static;
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast_visit::walk::walk_expression_statement;
use oxc_ast_visit::Visit;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType, Span};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::classify::is_typed;
use crate::config::FrameworkConfig;
use crate::error::PipelineError;

/// Framework primitives that may be referenced without being imported.
pub const PRIMITIVE_WHITELIST: &[&str] = &[
    "createContext",
    "forwardRef",
    "lazy",
    "memo",
    "startTransition",
    "useCallback",
    "useContext",
    "useDeferredValue",
    "useEffect",
    "useId",
    "useImperativeHandle",
    "useLayoutEffect",
    "useMemo",
    "useReducer",
    "useRef",
    "useState",
];

lazy_static! {
    /// (name, call-style usage, local declaration) per whitelisted primitive.
    /// The declaration pattern is only used when the source does not parse.
    static ref PRIMITIVE_PATTERNS: Vec<(&'static str, Regex, Regex)> = PRIMITIVE_WHITELIST
        .iter()
        .map(|name| {
            let usage = Regex::new(&format!(r"(?:^|[^.\w$]){}\s*\(", name)).unwrap();
            let local = Regex::new(&format!(
                r"\b(?:function|const|let|var|class)\s+{}\b",
                name
            ))
            .unwrap();
            (*name, usage, local)
        })
        .collect();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizeOutcome {
    pub success: bool,
    pub code: String,
    pub added_symbols: Vec<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
}

impl NormalizeOutcome {
    pub fn into_result(self) -> Result<(String, Vec<String>), PipelineError> {
        if self.success {
            Ok((self.code, self.warnings))
        } else {
            Err(PipelineError::ImportNormalization(
                self.error
                    .unwrap_or_else(|| "unknown normalization failure".to_string()),
            ))
        }
    }
}

pub struct ImportNormalizer {
    framework_import_re: Regex,
}

impl Default for ImportNormalizer {
    fn default() -> Self {
        Self::new(&FrameworkConfig::default())
    }
}

impl ImportNormalizer {
    pub fn new(framework: &FrameworkConfig) -> Self {
        let pattern = format!(
            concat!(
                r"(?m)^(?P<indent>[ \t]*)import\s+",
                r"(?:(?P<default>[A-Za-z_$][\w$]*)\s*,?\s*)?",
                r"(?:\{{(?P<named>[^}}]*)\}})?",
                r#"\s*from\s*(?P<quote>['"]){}['"][ \t]*;?"#,
            ),
            regex::escape(&framework.name)
        );
        Self {
            // The pattern is assembled from an escaped module name.
            framework_import_re: Regex::new(&pattern).unwrap(),
        }
    }

    pub fn normalize(&self, code: &str) -> NormalizeOutcome {
        match catch_unwind(AssertUnwindSafe(|| self.normalize_inner(code))) {
            Ok(outcome) => outcome,
            Err(_) => NormalizeOutcome {
                success: false,
                code: code.to_string(),
                added_symbols: Vec::new(),
                warnings: Vec::new(),
                error: Some("internal error while normalizing imports".to_string()),
            },
        }
    }

    fn normalize_inner(&self, code: &str) -> NormalizeOutcome {
        let mut warnings = Vec::new();

        let found = self
            .framework_import_re
            .captures_iter(code)
            .find(binds_values);

        let Some(caps) = found else {
            warnings
                .push("no framework import statement found; imports left unchanged".to_string());
            return NormalizeOutcome {
                success: true,
                code: code.to_string(),
                added_symbols: Vec::new(),
                warnings,
                error: None,
            };
        };

        if self
            .framework_import_re
            .captures_iter(code)
            .filter(binds_values)
            .count()
            > 1
        {
            warnings
                .push("multiple framework imports found; only the first is normalized".to_string());
        }

        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        let current: Vec<String> = caps
            .name("named")
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let imported: BTreeSet<String> = current.iter().map(|s| imported_name(s)).collect();

        let body = format!("{}{}", &code[..whole.start], &code[whole.end..]);
        let declared = declared_names(&body);
        let missing: Vec<String> = PRIMITIVE_PATTERNS
            .iter()
            .filter(|(name, usage, local)| {
                let is_local = match &declared {
                    Some(names) => names.contains(*name),
                    None => local.is_match(&body),
                };
                !imported.contains(*name) && usage.is_match(&body) && !is_local
            })
            .map(|(name, _, _)| name.to_string())
            .collect();

        let mut output = code.to_string();
        if !missing.is_empty() {
            let merged: BTreeSet<String> = current
                .iter()
                .cloned()
                .chain(missing.iter().cloned())
                .collect();
            let list = merged.into_iter().collect::<Vec<_>>().join(", ");
            let quote = caps.name("quote").map(|m| m.as_str()).unwrap_or("'");
            let indent = caps.name("indent").map(|m| m.as_str()).unwrap_or("");
            let head = match caps.name("default") {
                Some(default) => format!("{}, {{ {} }}", default.as_str(), list),
                None => format!("{{ {} }}", list),
            };
            let rebuilt = format!(
                "{}import {} from {}{}{};",
                indent,
                head,
                quote,
                self.module_name(&caps),
                quote
            );
            output.replace_range(whole, &rebuilt);
            debug!(added = ?missing, "patched framework import");
        }

        let (output, cleanup_warnings) = apply_cleanup_rewrites(&output);
        warnings.extend(cleanup_warnings);

        NormalizeOutcome {
            success: true,
            code: output,
            added_symbols: missing,
            warnings,
            error: None,
        }
    }

    fn module_name(&self, caps: &regex::Captures) -> String {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or("");
        let quote = caps.name("quote").map(|m| m.as_str()).unwrap_or("'");
        whole
            .rsplit(quote)
            .nth(1)
            .unwrap_or("react")
            .to_string()
    }
}

/// Normalize with the default framework configuration.
pub fn normalize_imports(code: &str) -> NormalizeOutcome {
    ImportNormalizer::default().normalize(code)
}

/// A framework import that binds values. `import type { .. }` only brings in types.
fn binds_values(caps: &regex::Captures) -> bool {
    let default = caps.name("default").map(|m| m.as_str());
    default != Some("type") && (default.is_some() || caps.name("named").is_some())
}

#[derive(Default)]
struct DeclaredNames {
    names: BTreeSet<String>,
}

impl<'a> Visit<'a> for DeclaredNames {
    fn visit_binding_identifier(&mut self, it: &BindingIdentifier<'a>) {
        self.names.insert(it.name.to_string());
    }
}

/// Every name the module binds: declarations, destructuring patterns,
/// parameters, catch clauses and import specifiers. `None` if `code` does not parse.
fn declared_names(code: &str) -> Option<BTreeSet<String>> {
    let allocator = Allocator::default();
    let source_type = SourceType::default()
        .with_module(true)
        .with_jsx(true)
        .with_typescript(is_typed(code));
    let ret = Parser::new(&allocator, code, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        return None;
    }
    let mut collector = DeclaredNames::default();
    collector.visit_program(&ret.program);
    Some(collector.names)
}

/// `useState as useS` -> `useState`, `type FC` -> `FC`
fn imported_name(entry: &str) -> String {
    let entry = entry.strip_prefix("type ").unwrap_or(entry);
    entry.split_whitespace().next().unwrap_or(entry).to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLEANUP REWRITES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupPattern {
    RemoveChild,
    DomListener,
    Dispose,
}

struct CleanupCollector<'s> {
    source: &'s str,
    guard_tests: Vec<String>,
    try_depth: usize,
    edits: Vec<(u32, u32, String, CleanupPattern)>,
}

impl<'s> CleanupCollector<'s> {
    fn text(&self, span: Span) -> &'s str {
        &self.source[span.start as usize..span.end as usize]
    }

    fn is_guarded(&self, test: &str) -> bool {
        let wanted = squash_ws(test);
        self.guard_tests.iter().any(|t| *t == wanted)
    }

    fn rewrite<'a>(&self, stmt: &ExpressionStatement<'a>) -> Option<(CleanupPattern, String)> {
        let Expression::CallExpression(call) = &stmt.expression else {
            return None;
        };
        let Expression::StaticMemberExpression(member) = &call.callee else {
            return None;
        };
        let call_text = self.text(call.span);

        match member.property.name.as_str() {
            "removeChild" if call.arguments.len() == 1 => {
                let parent = self.text(member.object.span());
                let child = self.text(call.arguments[0].span());
                let test = format!("{} && {} && {}.contains({})", parent, child, parent, child);
                if self.is_guarded(&test) {
                    return None;
                }
                Some((
                    CleanupPattern::RemoveChild,
                    format!("if ({}) {{ {}; }}", test, call_text),
                ))
            }
            "removeEventListener" => {
                let Expression::StaticMemberExpression(inner) = &member.object else {
                    return None;
                };
                if inner.property.name.as_str() != "domElement" {
                    return None;
                }
                let owner = self.text(inner.object.span());
                let test = format!("{} && {}.domElement", owner, owner);
                if self.is_guarded(&test) {
                    return None;
                }
                Some((
                    CleanupPattern::DomListener,
                    format!("if ({}) {{ {}; }}", test, call_text),
                ))
            }
            "dispose" if call.arguments.is_empty() => {
                if self.try_depth > 0 {
                    return None;
                }
                Some((
                    CleanupPattern::Dispose,
                    format!(
                        concat!(
                            "try {{ {}; }} catch (disposeError) ",
                            "{{ console.warn(\"dispose failed\", disposeError); }}"
                        ),
                        call_text
                    ),
                ))
            }
            _ => None,
        }
    }
}

impl<'a, 's> Visit<'a> for CleanupCollector<'s> {
    fn visit_if_statement(&mut self, it: &IfStatement<'a>) {
        self.visit_expression(&it.test);
        self.guard_tests
            .push(squash_ws(self.text(it.test.span())));
        self.visit_statement(&it.consequent);
        self.guard_tests.pop();
        if let Some(alternate) = &it.alternate {
            self.visit_statement(alternate);
        }
    }

    fn visit_try_statement(&mut self, it: &TryStatement<'a>) {
        self.try_depth += 1;
        self.visit_block_statement(&it.block);
        self.try_depth -= 1;
        if let Some(handler) = &it.handler {
            self.visit_catch_clause(handler);
        }
        if let Some(finalizer) = &it.finalizer {
            self.visit_block_statement(finalizer);
        }
    }

    fn visit_expression_statement(&mut self, it: &ExpressionStatement<'a>) {
        if let Some((pattern, replacement)) = self.rewrite(it) {
            self.edits
                .push((it.span.start, it.span.end, replacement, pattern));
            return;
        }
        walk_expression_statement(self, it);
    }
}

fn squash_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Guard unsafe DOM/resource teardown statements. Returns the new code and warnings.
pub fn apply_cleanup_rewrites(code: &str) -> (String, Vec<String>) {
    let mut warnings = Vec::new();
    let allocator = Allocator::default();
    let source_type = SourceType::default()
        .with_module(true)
        .with_jsx(true)
        .with_typescript(is_typed(code));
    let ret = Parser::new(&allocator, code, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        warn!("cleanup rewrites skipped: source does not parse");
        warnings.push("cleanup rewrites skipped: source does not parse".to_string());
        return (code.to_string(), warnings);
    }

    let mut collector = CleanupCollector {
        source: code,
        guard_tests: Vec::new(),
        try_depth: 0,
        edits: Vec::new(),
    };
    collector.visit_program(&ret.program);

    if collector.edits.is_empty() {
        return (code.to_string(), warnings);
    }

    let mut output = code.to_string();
    collector.edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (start, end, replacement, pattern) in &collector.edits {
        debug!(?pattern, "guarded teardown call");
        output.replace_range(*start as usize..*end as usize, replacement);
    }
    warnings.push(format!(
        "guarded {} unsafe teardown call(s)",
        collector.edits.len()
    ));
    (output, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_single_missing_hook() {
        let src = "import React, {} from 'react';\n\
                   const X=()=>{const [s,setS]=useState(0); return null}; export default X;";
        let out = normalize_imports(src);
        assert!(out.success);
        assert_eq!(out.added_symbols, vec!["useState".to_string()]);
        assert!(out
            .code
            .starts_with("import React, { useState } from 'react';\n"));
    }

    #[test]
    fn test_merged_list_is_sorted_union() {
        let src = "import { useRef } from \"react\";\n\
                   export default function A() {\n\
                   const r = useRef();\n\
                   useEffect(() => {}, []);\n\
                   const [v] = useState(1);\n\
                   const m = useMemo(() => v, [v]);\n\
                   return null;\n\
                   }";
        let out = normalize_imports(src);
        assert_eq!(out.added_symbols.len(), 3);
        assert!(out.code.starts_with(
            "import { useEffect, useMemo, useRef, useState } from \"react\";\n"
        ));
    }

    #[test]
    fn test_member_calls_and_local_definitions_are_not_missing() {
        let src = "import React from 'react';\nfunction memo(x) { return x; }\n\
                   export default function A() { const [v] = React.useState(0); return memo(v); }";
        let out = normalize_imports(src);
        assert!(out.added_symbols.is_empty());
        assert_eq!(out.code, src);
    }

    #[test]
    fn test_destructured_primitive_is_not_missing() {
        let src = "import React from 'react';\nconst { useState } = React;\n\
                   export default function A() { const [s] = useState(0); return null; }";
        let out = normalize_imports(src);
        assert!(out.success);
        assert!(out.added_symbols.is_empty());
        assert_eq!(out.code, src);
    }

    #[test]
    fn test_parameters_and_import_bindings_are_not_missing() {
        let src = "import React from 'react';\nimport { memo } from './local.js';\n\
                   export default function A({ useRef }) { useRef(); return memo(null); }";
        let out = normalize_imports(src);
        assert!(out.added_symbols.is_empty());
        assert_eq!(out.code, src);
    }

    #[test]
    fn test_type_only_import_is_left_alone() {
        let src = "import type { FC } from 'react';\nimport React from 'react';\n\
                   const A: FC = () => { const [s] = useState(0); return null; };\n\
                   export default A;";
        let out = normalize_imports(src);
        assert!(out.success);
        assert_eq!(out.added_symbols, vec!["useState".to_string()]);
        assert!(out.code.starts_with(
            "import type { FC } from 'react';\nimport React, { useState } from 'react';\n"
        ));
        assert!(out.warnings.iter().all(|w| !w.contains("multiple")));
    }

    #[test]
    fn test_default_only_import_gains_named_list() {
        let src = "import React from 'react';\n\
                   export default () => { useEffect(() => {}); return null; };";
        let out = normalize_imports(src);
        assert!(out
            .code
            .starts_with("import React, { useEffect } from 'react';\n"));
    }

    #[test]
    fn test_missing_import_is_noop_with_warning() {
        let src = "export default function A() { useState(0); return null; }";
        let out = normalize_imports(src);
        assert!(out.success);
        assert_eq!(out.code, src);
        assert_eq!(out.warnings.len(), 1);
    }

    #[test]
    fn test_aliases_are_preserved() {
        let src = "import { useState as useS } from 'react';\n\
                   export default () => { useS(1); useRef(); return null; };";
        let out = normalize_imports(src);
        assert!(out
            .code
            .starts_with("import { useRef, useState as useS } from 'react';"));
    }

    #[test]
    fn test_remove_child_guard() {
        let src = "export function teardown(parent, el) {\n  parent.removeChild(el);\n}";
        let (out, warnings) = apply_cleanup_rewrites(src);
        assert!(
            out.contains("if (parent && el && parent.contains(el)) { parent.removeChild(el); }")
        );
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_dom_listener_and_dispose_guards() {
        let src = "export function stop(controls, renderer) {\n\
                   controls.domElement.removeEventListener('wheel', onWheel);\n\
                   renderer.dispose();\n\
                   }";
        let (out, _) = apply_cleanup_rewrites(src);
        assert!(out.contains(concat!(
            "if (controls && controls.domElement) ",
            "{ controls.domElement.removeEventListener('wheel', onWheel); }"
        )));
        assert!(out.contains("try { renderer.dispose(); } catch (disposeError)"));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let src = "export function t(p, c, r) {\n  p.removeChild(c);\n  r.dispose();\n}";
        let (once, _) = apply_cleanup_rewrites(src);
        let (twice, warnings) = apply_cleanup_rewrites(&once);
        assert_eq!(once, twice);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_strings_and_comments_untouched() {
        let src = "// parent.removeChild(el);\nexport const msg = \"renderer.dispose();\";";
        let (out, warnings) = apply_cleanup_rewrites(src);
        assert_eq!(out, src);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_unparsable_source_skips_cleanup() {
        let src = "export default function (";
        let (out, warnings) = apply_cleanup_rewrites(src);
        assert_eq!(out, src);
        assert_eq!(warnings.len(), 1);
    }
}
