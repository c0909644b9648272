//! Format Classifier
//!
//! Guesses whether component source is already an ES module or a legacy script,
//! and which dialect it is written in. Pure text heuristics; never fails.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::jsx_lowerer::contains_markup;
use crate::source::ModuleFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Plain,
    Typed,
    Markup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub format: ModuleFormat,
    pub dialect: Dialect,
}

lazy_static! {
    /// Top-level import/export statement at the start of a line
    static ref MODULE_SYNTAX_RE: Regex = Regex::new(concat!(
        r"(?m)^[ \t]*(?:",
        r"import\s+[\w$*{]|",
        r#"import\s*['"{*]|"#,
        r"export\s+(?:default\b|const\b|let\b|var\b|function\b|async\b|class\b",
        r"|type\b|interface\b|enum\b)|",
        r"export\s*[{*])",
    ))
    .unwrap();

    /// `interface X`, `type X = ..`, `import type { .. }`
    static ref TYPE_DECL_RE: Regex = Regex::new(concat!(
        r"(?m)^[ \t]*(?:",
        r"(?:export\s+)?interface\s+[A-Za-z_$][\w$]*|",
        r"(?:export\s+)?type\s+[A-Za-z_$][\w$]*\s*(?:<[^>]*>)?\s*=|",
        r"import\s+type\s+[\w${])",
    ))
    .unwrap();

    /// `(props: Props)`, `value: string`, `const A: FC =`, `useState<number>(`
    static ref TYPE_ANNOTATION_RE: Regex = Regex::new(concat!(
        r"(?:[(,]\s*[A-Za-z_$][\w$]*\??\s*:\s*",
        r"(?:[A-Z][\w$.]*|string|number|boolean|any|unknown|void)\b)|",
        r"(?::\s*(?:string|number|boolean|any|unknown|void)(?:\[\])?\s*[=;,)])|",
        r"(?:\b(?:const|let|var)\s+[A-Za-z_$][\w$]*\s*:\s*[A-Z][\w$.]*(?:<[^=]*>)?\s*=)|",
        r"(?:\buse[A-Z]\w*<[A-Za-z\[])",
    ))
    .unwrap();

    static ref CAPITALIZED_DECL_RE: Regex = Regex::new(concat!(
        r"(?m)^[ \t]*(?:",
        r"(?:async\s+)?function\s*\*?\s*([A-Z][\w$]*)|",
        r"class\s+([A-Z][\w$]*)|",
        r"(?:const|let|var)\s+([A-Z][\w$]*)\s*=)",
    ))
    .unwrap();

    static ref REACT_BINDING_RE: Regex =
        Regex::new(r"(?:\b(?:const|let|var)\s+React\s*=|\bimport\s+React\b)").unwrap();
}

/// Infer module format and dialect.
pub fn classify(code: &str) -> Classification {
    let format = if MODULE_SYNTAX_RE.is_match(code) {
        ModuleFormat::Module
    } else {
        ModuleFormat::LegacyScript
    };

    let dialect = if is_typed(code) {
        Dialect::Typed
    } else if contains_markup(code) {
        Dialect::Markup
    } else {
        Dialect::Plain
    };

    Classification { format, dialect }
}

pub fn is_module(code: &str) -> bool {
    classify(code).format == ModuleFormat::Module
}

pub(crate) fn is_typed(code: &str) -> bool {
    TYPE_DECL_RE.is_match(code) || TYPE_ANNOTATION_RE.is_match(code)
}

/// Turn a legacy script into a module: prepend the framework default import and
/// export the last capitalized top-level declaration as the default.
pub fn modularize_legacy(code: &str) -> Result<String> {
    let name = CAPITALIZED_DECL_RE
        .captures_iter(code)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string())
        })
        .last()
        .ok_or_else(|| {
            PipelineError::UnsupportedFormat(
                "legacy script declares no capitalized component to export".to_string(),
            )
        })?;

    let mut out = String::with_capacity(code.len() + 64);
    if !REACT_BINDING_RE.is_match(code) {
        out.push_str("import React from \"react\";\n");
    }
    out.push_str(code.trim_end());
    out.push_str(&format!("\n\nexport default {};\n", name));
    Ok(out)
}
