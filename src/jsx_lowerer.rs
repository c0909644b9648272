//! JSX Lowering for the Component Pipeline
//!
//! Detects embedded markup in component source and lowers it to plain factory
//! calls. Only the markup spans are rewritten; everything else, in particular the
//! module's import/export statements, is left byte-identical.

use lazy_static::lazy_static;
use oxc_allocator::{Allocator, Box as oxc_box, CloneIn};
use oxc_ast::ast::*;
use oxc_ast::AstBuilder;
use oxc_ast_visit::walk_mut::walk_expression;
use oxc_ast_visit::{Visit, VisitMut};
use oxc_codegen::Codegen;
use oxc_parser::Parser;
use oxc_span::{SourceType, SPAN};
use oxc_syntax::identifier::is_identifier_name;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::{is_module, is_typed};
use crate::config::FrameworkConfig;
use crate::error::PipelineError;

// ═══════════════════════════════════════════════════════════════════════════════
// MARKUP DETECTION
// ═══════════════════════════════════════════════════════════════════════════════

const COMMON_TAGS: &[&str] = &[
    "<div", "<span", "<button", "<input", "<svg", "<section", "</div>", "</span>", "</button>",
];

lazy_static! {
    static ref CAPITALIZED_TAG_RE: Regex = Regex::new(r"<[A-Z][\w$.]*[\s/>]").unwrap();
    static ref KNOWN_TAG_RE: Regex = Regex::new(concat!(
        r"<(?:div|span|p|a|ul|ol|li|img|h[1-6]|button|input|label|form|section|header|footer",
        r"|main|nav|svg|path|canvas|textarea|select|option|table|tr|td|th)[\s/>]",
    ))
    .unwrap();
    static ref RETURN_MARKUP_RE: Regex = Regex::new(r"return\s*\(?\s*<[A-Za-z>]").unwrap();
    static ref ATTRIBUTE_EXPR_RE: Regex = Regex::new(r"\s[A-Za-z][\w-]*=\{").unwrap();
    static ref FRAGMENT_RE: Regex = Regex::new(r"<>|</>").unwrap();
    static ref IMPORT_BINDING_RE: Regex = Regex::new(
        r"(?m)^[ \t]*import\s+(?:\*\s*as\s+)?([A-Za-z_$][\w$]*)"
    )
    .unwrap();
    static ref DIRECTIVE_RE: Regex =
        Regex::new(r#"^\s*(?:"use [\w ]+"|'use [\w ]+');?[ \t]*\r?\n"#).unwrap();
}

/// Heuristic markup check; false positives only cost a no-op transpile.
pub fn contains_markup(code: &str) -> bool {
    CAPITALIZED_TAG_RE.is_match(code)
        || KNOWN_TAG_RE.is_match(code)
        || RETURN_MARKUP_RE.is_match(code)
        || (ATTRIBUTE_EXPR_RE.is_match(code) && code.contains('<'))
        || FRAGMENT_RE.is_match(code)
        || COMMON_TAGS.iter().any(|tag| code.contains(tag))
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPILE OPTIONS / OUTCOME
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspileOptions {
    pub factory: String,
    pub fragment: String,
    /// Module the factory's root binding is imported from when missing
    pub framework_module: String,
    /// Force TypeScript parsing; `None` sniffs the source
    pub typescript: Option<bool>,
}

impl Default for TranspileOptions {
    fn default() -> Self {
        Self::from_framework(&FrameworkConfig::default())
    }
}

impl TranspileOptions {
    pub fn from_framework(framework: &FrameworkConfig) -> Self {
        Self {
            factory: framework.jsx_factory.clone(),
            fragment: framework.jsx_fragment.clone(),
            framework_module: framework.name.clone(),
            typescript: None,
        }
    }

    fn factory_root(&self) -> &str {
        self.factory.split('.').next().unwrap_or(&self.factory)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspileOutcome {
    pub success: bool,
    pub code: Option<String>,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl TranspileOutcome {
    fn failed(error: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            code: None,
            error: Some(error.into()),
            warnings,
        }
    }

    pub fn into_result(self) -> Result<(String, Vec<String>), PipelineError> {
        match (self.success, self.code) {
            (true, Some(code)) => Ok((code, self.warnings)),
            _ => Err(PipelineError::Transpile {
                message: self.error.unwrap_or_else(|| "unknown transpile failure".to_string()),
                warnings: self.warnings,
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPILE
// ═══════════════════════════════════════════════════════════════════════════════

/// Lower every markup expression in `code` into factory calls.
pub fn transpile(code: &str, opts: &TranspileOptions) -> TranspileOutcome {
    let mut warnings = Vec::new();
    let typescript = opts.typescript.unwrap_or_else(|| is_typed(code));

    let allocator = Allocator::default();
    let source_type = SourceType::default()
        .with_module(true)
        .with_jsx(true)
        .with_typescript(typescript);

    let ret = Parser::new(&allocator, code, source_type).parse();
    if ret.panicked || !ret.errors.is_empty() {
        let first = ret
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "parser aborted".to_string());
        if ret.errors.len() > 1 {
            warnings.push(format!("{} additional syntax errors", ret.errors.len() - 1));
        }
        return TranspileOutcome::failed(format!("syntax error: {}", first), warnings);
    }

    let mut splicer = MarkupSplicer {
        lowerer: JsxLowerer::new(&allocator, &opts.factory, &opts.fragment),
        source_type,
        edits: Vec::new(),
    };
    splicer.visit_program(&ret.program);

    if splicer.edits.is_empty() {
        warnings.push("no markup found; source left unchanged".to_string());
        return TranspileOutcome {
            success: true,
            code: Some(code.to_string()),
            error: None,
            warnings,
        };
    }

    let lowered_count = splicer.edits.len();
    let mut output = code.to_string();
    // Outermost elements only, so spans never overlap; apply back to front.
    splicer.edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (start, end, replacement) in &splicer.edits {
        output.replace_range(*start as usize..*end as usize, replacement);
    }
    debug!(lowered = lowered_count, "lowered markup expressions");

    if !is_module(&output) {
        return TranspileOutcome::failed("unexpectedly removed module structure", warnings);
    }

    let root = opts.factory_root();
    if !has_binding(&output, root) {
        output = insert_after_directives(
            &output,
            &format!("import {} from \"{}\";\n", root, opts.framework_module),
        );
        warnings.push(format!(
            "added missing `{}` import for lowered markup",
            root
        ));
    }

    TranspileOutcome {
        success: true,
        code: Some(output),
        error: None,
        warnings,
    }
}

fn has_binding(code: &str, name: &str) -> bool {
    if IMPORT_BINDING_RE
        .captures_iter(code)
        .any(|caps| &caps[1] == name)
    {
        return true;
    }
    let local = Regex::new(&format!(
        r"\b(?:const|let|var|function|class)\s+{}\b",
        regex::escape(name)
    ));
    local.map(|re| re.is_match(code)).unwrap_or(false)
}

fn insert_after_directives(code: &str, line: &str) -> String {
    match DIRECTIVE_RE.find(code) {
        Some(m) => format!("{}{}{}", &code[..m.end()], line, &code[m.end()..]),
        None => format!("{}{}", line, code),
    }
}

/// JSX text whitespace rules: lines are trimmed at their inner edges, blank
/// lines dropped, the rest joined with single spaces.
fn clean_jsx_text(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw.split('\n').collect();
    let last = lines.len().saturating_sub(1);
    let mut parts = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let mut text = line.trim_end_matches('\r').replace('\t', " ");
        if i != 0 {
            text = text.trim_start().to_string();
        }
        if i != last {
            text = text.trim_end().to_string();
        }
        if !text.is_empty() {
            parts.push(text);
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(decode_entities(&parts.join(" ")))
    }
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&nbsp;", "\u{a0}")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

// ═══════════════════════════════════════════════════════════════════════════════
// MARKUP SPLICER
// Collects outermost JSX nodes and their lowered replacement text
// ═══════════════════════════════════════════════════════════════════════════════

struct MarkupSplicer<'a> {
    lowerer: JsxLowerer<'a>,
    source_type: SourceType,
    edits: Vec<(u32, u32, String)>,
}

impl<'a> Visit<'a> for MarkupSplicer<'a> {
    fn visit_jsx_element(&mut self, it: &JSXElement<'a>) {
        let lowered = self.lowerer.lower_jsx_element(it);
        let text = self.lowerer.print_expression(lowered, self.source_type);
        self.edits.push((it.span.start, it.span.end, text));
    }

    fn visit_jsx_fragment(&mut self, it: &JSXFragment<'a>) {
        let lowered = self.lowerer.lower_jsx_fragment(it);
        let text = self.lowerer.print_expression(lowered, self.source_type);
        self.edits.push((it.span.start, it.span.end, text));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// JSX LOWERER
// Transforms JSX elements into factory(type, props, ...children) calls
// ═══════════════════════════════════════════════════════════════════════════════

pub struct JsxLowerer<'a> {
    pub ast: AstBuilder<'a>,
    factory: &'a str,
    fragment: &'a str,
}

impl<'a> JsxLowerer<'a> {
    pub fn new(allocator: &'a Allocator, factory: &str, fragment: &str) -> Self {
        Self {
            ast: AstBuilder::new(allocator),
            factory: allocator.alloc_str(factory),
            fragment: allocator.alloc_str(fragment),
        }
    }

    fn lower_jsx_element(&mut self, element: &JSXElement<'a>) -> Expression<'a> {
        let element_type = self.element_type(&element.opening_element.name);

        let mut current_obj_props = self.ast.vec();
        for item in &element.opening_element.attributes {
            match item {
                JSXAttributeItem::Attribute(attr) => {
                    let raw_name = match &attr.name {
                        JSXAttributeName::Identifier(id) => id.name.to_string(),
                        JSXAttributeName::NamespacedName(ns) => {
                            format!("{}:{}", ns.namespace.name, ns.name.name)
                        }
                    };
                    let key = self.property_key(&raw_name);

                    let value = match &attr.value {
                        Some(JSXAttributeValue::StringLiteral(s)) => {
                            self.ast.expression_string_literal(SPAN, s.value, None)
                        }
                        Some(JSXAttributeValue::Element(el)) => self.lower_jsx_element(el),
                        Some(JSXAttributeValue::ExpressionContainer(container)) => {
                            self.lower_jsx_expression(&container.expression)
                        }
                        Some(JSXAttributeValue::Fragment(frag)) => self.lower_jsx_fragment(frag),
                        None => self.ast.expression_boolean_literal(SPAN, true),
                    };

                    current_obj_props.push(self.ast.object_property_kind_object_property(
                        SPAN,
                        PropertyKind::Init,
                        key,
                        value,
                        false,
                        false,
                        false,
                    ));
                }
                JSXAttributeItem::SpreadAttribute(spread) => {
                    let mut spread_expr = spread.argument.clone_in(self.ast.allocator);
                    self.visit_expression(&mut spread_expr);
                    current_obj_props.push(
                        self.ast
                            .object_property_kind_spread_property(SPAN, spread_expr),
                    );
                }
            }
        }

        let props_expr = if current_obj_props.is_empty() {
            self.ast.expression_null_literal(SPAN)
        } else {
            self.ast.expression_object(SPAN, current_obj_props)
        };

        let mut args = self.ast.vec();
        args.push(Argument::from(element_type));
        args.push(Argument::from(props_expr));
        self.push_children(&element.children, &mut args);
        self.factory_call(args)
    }

    fn lower_jsx_fragment(&mut self, fragment: &JSXFragment<'a>) -> Expression<'a> {
        let mut args = self.ast.vec();
        args.push(Argument::from(self.path_expression(self.fragment)));
        args.push(Argument::from(self.ast.expression_null_literal(SPAN)));
        self.push_children(&fragment.children, &mut args);
        self.factory_call(args)
    }

    fn push_children(
        &mut self,
        children: &oxc_allocator::Vec<'a, JSXChild<'a>>,
        args: &mut oxc_allocator::Vec<'a, Argument<'a>>,
    ) {
        for child in children {
            match child {
                JSXChild::Text(t) => {
                    if let Some(text) = clean_jsx_text(&t.value) {
                        let text_atom = self.ast.allocator.alloc_str(&text);
                        args.push(Argument::from(
                            self.ast.expression_string_literal(SPAN, text_atom, None),
                        ));
                    }
                }
                JSXChild::Element(el) => {
                    args.push(Argument::from(self.lower_jsx_element(el)));
                }
                JSXChild::Fragment(frag) => {
                    args.push(Argument::from(self.lower_jsx_fragment(frag)));
                }
                JSXChild::ExpressionContainer(container) => {
                    // `{/* comment */}` lowers to nothing
                    if container.expression.as_expression().is_some() {
                        args.push(Argument::from(
                            self.lower_jsx_expression(&container.expression),
                        ));
                    }
                }
                JSXChild::Spread(spread) => {
                    let mut arg = spread.expression.clone_in(self.ast.allocator);
                    self.visit_expression(&mut arg);
                    args.push(self.ast.argument_spread_element(SPAN, arg));
                }
            }
        }
    }

    fn factory_call(&self, args: oxc_allocator::Vec<'a, Argument<'a>>) -> Expression<'a> {
        let callee = self.path_expression(self.factory);
        self.ast.expression_call(
            SPAN,
            callee,
            None::<oxc_box<TSTypeParameterInstantiation>>,
            args,
            false,
        )
    }

    /// `React.createElement` -> nested static member expressions
    fn path_expression(&self, path: &str) -> Expression<'a> {
        let mut parts = path.split('.');
        let root = parts.next().unwrap_or(path);
        let mut expr = self
            .ast
            .expression_identifier(SPAN, self.ast.allocator.alloc_str(root));
        for part in parts {
            expr = Expression::from(self.ast.member_expression_static(
                SPAN,
                expr,
                self.ast
                    .identifier_name(SPAN, self.ast.allocator.alloc_str(part)),
                false,
            ));
        }
        expr
    }

    fn property_key(&self, name: &str) -> PropertyKey<'a> {
        let atom = self.ast.allocator.alloc_str(name);
        if is_identifier_name(name) {
            PropertyKey::StaticIdentifier(self.ast.alloc(self.ast.identifier_name(SPAN, atom)))
        } else {
            PropertyKey::StringLiteral(self.ast.alloc(self.ast.string_literal(SPAN, atom, None)))
        }
    }

    /// Intrinsic tags become strings; components become references.
    fn element_type(&self, name: &JSXElementName<'a>) -> Expression<'a> {
        match name {
            JSXElementName::Identifier(id) => {
                let tag = self.ast.allocator.alloc_str(&id.name);
                self.ast.expression_string_literal(SPAN, tag, None)
            }
            JSXElementName::IdentifierReference(id) => {
                let tag = self.ast.allocator.alloc_str(&id.name);
                self.ast.expression_identifier(SPAN, tag)
            }
            JSXElementName::NamespacedName(ns) => {
                let tag = format!("{}:{}", ns.namespace.name, ns.name.name);
                let tag = self.ast.allocator.alloc_str(&tag);
                self.ast.expression_string_literal(SPAN, tag, None)
            }
            JSXElementName::MemberExpression(me) => {
                let path = self.get_member_name(me);
                self.path_expression(&path)
            }
            JSXElementName::ThisExpression(_) => self.ast.expression_this(SPAN),
        }
    }

    fn get_member_name(&self, me: &JSXMemberExpression<'a>) -> String {
        let object = match &me.object {
            JSXMemberExpressionObject::IdentifierReference(id) => id.name.to_string(),
            JSXMemberExpressionObject::MemberExpression(inner) => self.get_member_name(inner),
            _ => "this".to_string(),
        };
        format!("{}.{}", object, me.property.name)
    }

    fn lower_jsx_expression(&mut self, jsx_expr: &JSXExpression<'a>) -> Expression<'a> {
        if let Some(mut e) = jsx_expr
            .as_expression()
            .map(|e| e.clone_in(self.ast.allocator))
        {
            self.visit_expression(&mut e);
            e
        } else {
            self.ast.expression_identifier(SPAN, "undefined")
        }
    }

    fn print_expression(&self, expr: Expression<'a>, source_type: SourceType) -> String {
        let code = Codegen::new()
            .build(&Program {
                span: SPAN,
                source_type,
                hashbang: None,
                directives: self.ast.vec(),
                body: {
                    let mut b = self.ast.vec();
                    b.push(self.ast.statement_expression(SPAN, expr));
                    b
                },
                source_text: "",
                comments: self.ast.vec(),
                scope_id: std::cell::Cell::new(None),
            })
            .code;
        let trimmed = code.trim_end();
        trimmed.strip_suffix(';').unwrap_or(trimmed).to_string()
    }
}

impl<'a> VisitMut<'a> for JsxLowerer<'a> {
    fn visit_expression(&mut self, expr: &mut Expression<'a>) {
        match expr {
            Expression::JSXElement(element) => {
                let lowered = self.lower_jsx_element(element);
                *expr = lowered;
            }
            Expression::JSXFragment(fragment) => {
                let lowered = self.lower_jsx_fragment(fragment);
                *expr = lowered;
            }
            _ => {
                walk_expression(self, expr);
            }
        }
    }
}
