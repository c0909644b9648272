//! Ephemeral module loading
//!
//! `EphemeralModuleLoader` is the capability that turns source text into a
//! one-shot loadable module. `HandleRegistry` reference-counts the handles it
//! hands out so each one is released to the loader exactly once.
//!
//! `StaticModuleLoader` is the in-process implementation: it keeps materialized
//! code in memory under `blob:canvas/<sha256>` and instantiates a module by
//! parsing it with oxc and evaluating its export surface statically.

use async_trait::async_trait;
use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_parser::Parser;
use oxc_span::{GetSpan, SourceType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::classify::is_typed;
use crate::error::{PipelineError, Result};

pub const EPHEMERAL_SCHEME: &str = "blob:";
const HANDLE_PREFIX: &str = "blob:canvas/";

pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLES & NAMESPACES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleHandle {
    pub url: String,
    pub byte_size: usize,
}

/// Shape of an exported value, as far as instantiation can tell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NamespaceValue {
    Function { name: Option<String> },
    Class { name: Option<String> },
    /// Properties in source order.
    Object { entries: Vec<(String, NamespaceValue)> },
    Primitive { repr: String },
    Opaque,
}

impl NamespaceValue {
    pub fn is_callable(&self) -> bool {
        matches!(self, NamespaceValue::Function { .. } | NamespaceValue::Class { .. })
    }
}

/// Exports in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleNamespace {
    exports: Vec<(String, NamespaceValue)>,
}

impl ModuleNamespace {
    pub fn new(exports: Vec<(String, NamespaceValue)>) -> Self {
        Self { exports }
    }

    pub fn get(&self, name: &str) -> Option<&NamespaceValue> {
        self.exports
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NamespaceValue)> {
        self.exports.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

#[async_trait]
pub trait EphemeralModuleLoader: Send + Sync {
    /// Make `code` loadable. Identical code may yield the identical handle.
    fn materialize(&self, code: &str) -> Result<ModuleHandle>;

    /// Instantiate the module behind `handle`.
    async fn load(&self, handle: &ModuleHandle) -> Result<ModuleNamespace>;

    fn release(&self, url: &str);

    /// Whether handles at `url` die with the process.
    fn is_ephemeral(&self, url: &str) -> bool {
        url.starts_with(EPHEMERAL_SCHEME)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

/// Live-handle set with reference counts. The loader sees one `release` per
/// handle, when the last reference is dropped.
pub struct HandleRegistry {
    loader: Arc<dyn EphemeralModuleLoader>,
    refs: Mutex<HashMap<String, usize>>,
}

impl HandleRegistry {
    pub fn new(loader: Arc<dyn EphemeralModuleLoader>) -> Self {
        Self {
            loader,
            refs: Mutex::new(HashMap::new()),
        }
    }

    pub fn loader(&self) -> &Arc<dyn EphemeralModuleLoader> {
        &self.loader
    }

    /// Materialize `code` and take one reference on the resulting handle.
    ///
    /// The `refs` lock is held across the loader call so a concurrent final
    /// `release` of the same handle cannot drop the module after it was reused.
    pub fn acquire(&self, code: &str) -> Result<ModuleHandle> {
        let mut refs = lock(&self.refs);
        let handle = self.loader.materialize(code)?;
        *refs.entry(handle.url.clone()).or_insert(0) += 1;
        trace!(url = %handle.url, "handle acquired");
        Ok(handle)
    }

    /// Take another reference on a handle that is still live.
    pub fn retain(&self, url: &str) -> bool {
        match lock(&self.refs).get_mut(url) {
            Some(count) => {
                *count += 1;
                true
            }
            None => !self.loader.is_ephemeral(url),
        }
    }

    pub fn release(&self, url: &str) {
        let mut refs = lock(&self.refs);
        match refs.get_mut(url) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                refs.remove(url);
                debug!(url = %url, "releasing module handle");
                self.loader.release(url);
            }
            None => {}
        }
    }

    pub fn is_live(&self, url: &str) -> bool {
        !self.loader.is_ephemeral(url) || lock(&self.refs).contains_key(url)
    }

    pub fn live_count(&self) -> usize {
        lock(&self.refs).len()
    }

    pub fn ref_count(&self, url: &str) -> usize {
        lock(&self.refs).get(url).copied().unwrap_or(0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATIC MODULE LOADER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct StaticModuleLoader {
    modules: Mutex<HashMap<String, Arc<String>>>,
}

impl StaticModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident_count(&self) -> usize {
        lock(&self.modules).len()
    }

    pub fn is_resident(&self, url: &str) -> bool {
        lock(&self.modules).contains_key(url)
    }
}

#[async_trait]
impl EphemeralModuleLoader for StaticModuleLoader {
    fn materialize(&self, code: &str) -> Result<ModuleHandle> {
        let url = format!("{}{}", HANDLE_PREFIX, sha256_hex(code));
        lock(&self.modules)
            .entry(url.clone())
            .or_insert_with(|| Arc::new(code.to_string()));
        Ok(ModuleHandle {
            url,
            byte_size: code.len(),
        })
    }

    async fn load(&self, handle: &ModuleHandle) -> Result<ModuleNamespace> {
        let code = lock(&self.modules).get(&handle.url).cloned().ok_or_else(|| {
            PipelineError::ExecutionValidation(format!(
                "module handle {} was released",
                handle.url
            ))
        })?;
        tokio::task::spawn_blocking(move || evaluate_exports(&code))
            .await
            .map_err(|e| {
                PipelineError::ExecutionValidation(format!("module evaluation aborted: {}", e))
            })?
    }

    fn release(&self, url: &str) {
        lock(&self.modules).remove(url);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATIC EXPORT EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Parse `code` and work out what each export would evaluate to.
pub fn evaluate_exports(code: &str) -> Result<ModuleNamespace> {
    let allocator = Allocator::default();
    let source_type = SourceType::default()
        .with_module(true)
        .with_jsx(true)
        .with_typescript(is_typed(code));
    let ret = Parser::new(&allocator, code, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        let detail = ret
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "parser gave up".to_string());
        return Err(PipelineError::ExecutionValidation(format!(
            "module failed to parse: {}",
            detail
        )));
    }

    let mut bindings: HashMap<String, NamespaceValue> = HashMap::new();

    // Function declarations are hoisted.
    for stmt in &ret.program.body {
        let func = match stmt {
            Statement::FunctionDeclaration(f) => Some(f),
            Statement::ExportNamedDeclaration(e) => match &e.declaration {
                Some(Declaration::FunctionDeclaration(f)) => Some(f),
                _ => None,
            },
            _ => None,
        };
        if let Some(id) = func.and_then(|f| f.id.as_ref()) {
            bindings.insert(
                id.name.to_string(),
                NamespaceValue::Function {
                    name: Some(id.name.to_string()),
                },
            );
        }
    }

    for stmt in &ret.program.body {
        match stmt {
            Statement::ThrowStatement(t) => {
                let span = t.argument.span();
                let thrown = &code[span.start as usize..span.end as usize];
                return Err(PipelineError::ExecutionValidation(format!(
                    "module threw during evaluation: {}",
                    thrown
                )));
            }
            Statement::ClassDeclaration(c) => bind_class(c, &mut bindings),
            Statement::VariableDeclaration(v) => bind_variables(v, &mut bindings),
            Statement::ExportNamedDeclaration(e) => match &e.declaration {
                Some(Declaration::ClassDeclaration(c)) => bind_class(c, &mut bindings),
                Some(Declaration::VariableDeclaration(v)) => bind_variables(v, &mut bindings),
                _ => {}
            },
            _ => {}
        }
    }

    let mut exports = Vec::new();
    for stmt in &ret.program.body {
        match stmt {
            Statement::ExportNamedDeclaration(e) => {
                match &e.declaration {
                    Some(Declaration::FunctionDeclaration(f)) => {
                        if let Some(id) = &f.id {
                            push_binding(&mut exports, &bindings, id.name.as_str());
                        }
                    }
                    Some(Declaration::ClassDeclaration(c)) => {
                        if let Some(id) = &c.id {
                            push_binding(&mut exports, &bindings, id.name.as_str());
                        }
                    }
                    Some(Declaration::VariableDeclaration(v)) => {
                        for d in &v.declarations {
                            if let BindingPattern::BindingIdentifier(id) = &d.id {
                                push_binding(&mut exports, &bindings, id.name.as_str());
                            }
                        }
                    }
                    _ => {}
                }
                for spec in &e.specifiers {
                    let exported = spec.exported.name().to_string();
                    let value = if e.source.is_some() {
                        NamespaceValue::Opaque
                    } else {
                        bindings
                            .get(spec.local.name().as_str())
                            .cloned()
                            .unwrap_or(NamespaceValue::Opaque)
                    };
                    exports.push((exported, value));
                }
            }
            Statement::ExportDefaultDeclaration(e) => {
                let value = match &e.declaration {
                    ExportDefaultDeclarationKind::FunctionDeclaration(f) => {
                        NamespaceValue::Function {
                            name: f.id.as_ref().map(|id| id.name.to_string()),
                        }
                    }
                    ExportDefaultDeclarationKind::ClassDeclaration(c) => NamespaceValue::Class {
                        name: c.id.as_ref().map(|id| id.name.to_string()),
                    },
                    other => other
                        .as_expression()
                        .map(|expr| value_of(expr, &bindings))
                        .unwrap_or(NamespaceValue::Opaque),
                };
                exports.push(("default".to_string(), value));
            }
            _ => {}
        }
    }

    trace!(count = exports.len(), "evaluated module exports");
    Ok(ModuleNamespace::new(exports))
}

fn push_binding(
    exports: &mut Vec<(String, NamespaceValue)>,
    bindings: &HashMap<String, NamespaceValue>,
    name: &str,
) {
    let value = bindings.get(name).cloned().unwrap_or(NamespaceValue::Opaque);
    exports.push((name.to_string(), value));
}

fn bind_class(class: &Class, bindings: &mut HashMap<String, NamespaceValue>) {
    if let Some(id) = &class.id {
        bindings.insert(
            id.name.to_string(),
            NamespaceValue::Class {
                name: Some(id.name.to_string()),
            },
        );
    }
}

fn bind_variables(decl: &VariableDeclaration, bindings: &mut HashMap<String, NamespaceValue>) {
    for d in &decl.declarations {
        if let BindingPattern::BindingIdentifier(id) = &d.id {
            let value = d
                .init
                .as_ref()
                .map(|init| value_of(init, bindings))
                .unwrap_or(NamespaceValue::Primitive {
                    repr: "undefined".to_string(),
                });
            bindings.insert(id.name.to_string(), value);
        }
    }
}

fn value_of(expr: &Expression, bindings: &HashMap<String, NamespaceValue>) -> NamespaceValue {
    match expr {
        Expression::ArrowFunctionExpression(_) => NamespaceValue::Function { name: None },
        Expression::FunctionExpression(f) => NamespaceValue::Function {
            name: f.id.as_ref().map(|id| id.name.to_string()),
        },
        Expression::ClassExpression(c) => NamespaceValue::Class {
            name: c.id.as_ref().map(|id| id.name.to_string()),
        },
        Expression::ObjectExpression(obj) => {
            let mut entries: Vec<(String, NamespaceValue)> = Vec::new();
            for prop in &obj.properties {
                let ObjectPropertyKind::ObjectProperty(p) = prop else {
                    continue;
                };
                let Some(key) = p.key.static_name() else {
                    continue;
                };
                let value = value_of(&p.value, bindings);
                // A repeated key keeps its first position and takes the last value.
                match entries.iter_mut().find(|(k, _)| *k == key) {
                    Some(slot) => slot.1 = value,
                    None => entries.push((key.to_string(), value)),
                }
            }
            NamespaceValue::Object { entries }
        }
        Expression::Identifier(id) => bindings
            .get(id.name.as_str())
            .cloned()
            .unwrap_or(NamespaceValue::Opaque),
        Expression::StringLiteral(s) => NamespaceValue::Primitive {
            repr: format!("{:?}", s.value.as_str()),
        },
        Expression::NumericLiteral(n) => NamespaceValue::Primitive {
            repr: n.value.to_string(),
        },
        Expression::BooleanLiteral(b) => NamespaceValue::Primitive {
            repr: b.value.to_string(),
        },
        Expression::NullLiteral(_) => NamespaceValue::Primitive {
            repr: "null".to_string(),
        },
        Expression::ParenthesizedExpression(p) => value_of(&p.expression, bindings),
        Expression::TSAsExpression(t) => value_of(&t.expression, bindings),
        Expression::TSSatisfiesExpression(t) => value_of(&t.expression, bindings),
        _ => NamespaceValue::Opaque,
    }
}
