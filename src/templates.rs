//! Module File Templates - Explicit Placeholder Contracts
//!
//! A template is literal Tcl text plus a declared placeholder schema.
//! Rendering is one pass: every `{{ key }}` must be declared and bound, or
//! rendering fails. Guards such as `is-loaded` are emitted as text for the
//! module runtime; nothing is evaluated here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::hashing::sha256_hex;
use crate::package::Package;

pub const MODULE_MAGIC: &str = "#%Module";

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("Unresolved placeholder: {0}")]
    UnresolvedPlaceholder(String),

    #[error("Placeholder not declared in template schema: {0}")]
    UndeclaredPlaceholder(String),

    #[error("Empty placeholder at byte {offset}")]
    EmptyPlaceholder { offset: usize },

    #[error("Unterminated placeholder starting at byte {offset}")]
    Unterminated { offset: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleTemplate {
    /// Every key the body and directives may reference.
    #[serde(default = "default_placeholders")]
    pub placeholders: Vec<String>,
    #[serde(default = "default_body")]
    pub body: String,
}

fn default_placeholders() -> Vec<String> {
    vec!["name".into(), "version".into(), "prefix".into()]
}

fn default_body() -> String {
    String::from(
        r#"#%Module
proc ModulesHelp { } {
   puts stderr "{{ name }} {{ version }}"
   puts stderr ""
}
# One line description
module-whatis "{{ name }} {{ version }}"
"#,
    )
}

impl Default for ModuleTemplate {
    fn default() -> Self {
        Self {
            placeholders: default_placeholders(),
            body: default_body(),
        }
    }
}

/// One Tcl directive appended after the template body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Directive {
    Setenv { name: String, value: String },
    PrependPath { var: String, path: String },
    AppendPath { var: String, path: String },
    SetAlias { name: String, expansion: String },
    Load { name: String },
    Unload { name: String },
    /// Load a dependency only if the user does not already have it.
    LoadIfMissing { name: String },
    /// Kept for compatibility with the modules it replaces. The condition
    /// only holds when the module is not loaded, so the unload never fires.
    ReloadGuard { name: String },
}

impl Directive {
    /// Raw fields, placeholders included.
    fn fields(&self) -> Vec<&str> {
        match self {
            Directive::Setenv { name, value } => vec![name.as_str(), value.as_str()],
            Directive::PrependPath { var, path } | Directive::AppendPath { var, path } => {
                vec![var.as_str(), path.as_str()]
            }
            Directive::SetAlias { name, expansion } => vec![name.as_str(), expansion.as_str()],
            Directive::Load { name }
            | Directive::Unload { name }
            | Directive::LoadIfMissing { name }
            | Directive::ReloadGuard { name } => vec![name.as_str()],
        }
    }

    /// Tcl for this directive with placeholders bound.
    ///
    /// Values are quoted after substitution. Alias expansions are Tcl text,
    /// so only the substituted parts of them are escaped.
    fn to_tcl(&self, bindings: &Bindings<'_>) -> Result<String, RenderError> {
        let word = |s: &str| bindings.fill(s, str::to_string, str::to_string);
        Ok(match self {
            Directive::Setenv { name, value } => {
                format!("setenv {} {}", word(name)?, tcl_word(&word(value)?))
            }
            Directive::PrependPath { var, path } => {
                format!("prepend-path {} {}", word(var)?, tcl_word(&word(path)?))
            }
            Directive::AppendPath { var, path } => {
                format!("append-path {} {}", word(var)?, tcl_word(&word(path)?))
            }
            Directive::SetAlias { name, expansion } => format!(
                "set-alias {} \"{}\"",
                word(name)?,
                bindings.fill(expansion, escape_quotes, escape_tcl)?
            ),
            Directive::Load { name } => format!("module load {}", word(name)?),
            Directive::Unload { name } => format!("module unload {}", word(name)?),
            Directive::LoadIfMissing { name } => {
                let name = word(name)?;
                format!("if {{ ![is-loaded {name}] }} {{\n  module load {name}\n}}")
            }
            Directive::ReloadGuard { name } => {
                let name = word(name)?;
                format!(
                    "if {{ ! [ is-loaded {name} ] }} {{\n  puts stderr \"reloading {name}\"\n  module unload {name}\n}}"
                )
            }
        })
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escape everything Tcl substitutes inside a double-quoted word.
fn escape_tcl(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '"' | '$' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn tcl_word(s: &str) -> String {
    let plain = !s.is_empty()
        && !s
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\\' | '"' | '$' | '[' | ']' | '{' | '}' | ';'));
    if plain {
        s.to_string()
    } else {
        format!("\"{}\"", escape_tcl(s))
    }
}

/// Extra render inputs: cluster literals and the formula's directives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleDirectives {
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub directives: Vec<Directive>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedModuleFile {
    pub name: String,
    pub version: String,
    pub text: String,
}

impl RenderedModuleFile {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn sha256(&self) -> String {
        sha256_hex(self.text.as_bytes())
    }

    /// `{root}/{name}/{version}`, where the module runtime looks it up.
    pub fn path_under(&self, root: &Path) -> PathBuf {
        root.join(&self.name).join(&self.version)
    }

    pub fn write_to(&self, root: &Path) -> io::Result<PathBuf> {
        let path = self.path_under(root);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &self.text)?;
        Ok(path)
    }
}

enum Segment<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

fn split_placeholders(text: &str) -> Result<Vec<Segment<'_>>, RenderError> {
    let mut segments = vec![];
    let mut rest = text;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        segments.push(Segment::Literal(&rest[..start]));
        let inner = &rest[start + OPEN.len()..];
        let end = inner
            .find(CLOSE)
            .ok_or(RenderError::Unterminated { offset: offset + start })?;
        let key = inner[..end].trim();
        if key.is_empty() {
            return Err(RenderError::EmptyPlaceholder { offset: offset + start });
        }
        segments.push(Segment::Placeholder(key));

        let consumed = start + OPEN.len() + end + CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }
    segments.push(Segment::Literal(rest));

    Ok(segments)
}

/// Keys referenced by `text`, in order of appearance.
pub fn placeholder_keys(text: &str) -> Result<Vec<String>, RenderError> {
    Ok(split_placeholders(text)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Placeholder(key) => Some(key.to_string()),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Declared keys and their values for one render.
struct Bindings<'a> {
    declared: &'a [String],
    values: BTreeMap<String, String>,
}

impl Bindings<'_> {
    /// Substitute every placeholder in `text` in one pass.
    fn fill(
        &self,
        text: &str,
        literal: fn(&str) -> String,
        value: fn(&str) -> String,
    ) -> Result<String, RenderError> {
        let mut out = String::with_capacity(text.len());
        for segment in split_placeholders(text)? {
            match segment {
                Segment::Literal(s) => out.push_str(&literal(s)),
                Segment::Placeholder(key) => {
                    if !self.declared.iter().any(|k| k == key) {
                        return Err(RenderError::UndeclaredPlaceholder(key.to_string()));
                    }
                    let bound = self
                        .values
                        .get(key)
                        .ok_or_else(|| RenderError::UnresolvedPlaceholder(key.to_string()))?;
                    out.push_str(&value(bound));
                }
            }
        }
        Ok(out)
    }
}

impl ModuleTemplate {
    /// Body followed by the raw directive fields, for placeholder scanning.
    pub fn source_text(&self, extra: &ModuleDirectives) -> String {
        let mut text = self.body.clone();
        for directive in &extra.directives {
            text.push('\n');
            text.push_str(&directive.fields().join(" "));
        }
        text
    }

    pub fn render(
        &self,
        pkg: &Package,
        extra: &ModuleDirectives,
    ) -> Result<RenderedModuleFile, RenderError> {
        render(self, pkg, extra)
    }
}

/// Substitute package fields and cluster vars into the template.
///
/// Package fields win over vars of the same name. The body is literal Tcl
/// and takes values as-is; directive values are quoted once bound.
pub fn render(
    template: &ModuleTemplate,
    pkg: &Package,
    extra: &ModuleDirectives,
) -> Result<RenderedModuleFile, RenderError> {
    let mut values = extra.vars.clone();
    values.insert("name".into(), pkg.name.clone());
    values.insert("version".into(), pkg.version.clone());
    values.insert("prefix".into(), pkg.prefix.to_string_lossy().into_owned());

    if let Some(missing) = template.placeholders.iter().find(|k| !values.contains_key(*k)) {
        return Err(RenderError::UnresolvedPlaceholder(missing.clone()));
    }
    let bindings = Bindings {
        declared: &template.placeholders,
        values,
    };

    let mut text = String::new();
    if !template.body.trim_start().starts_with(MODULE_MAGIC) {
        text.push_str(MODULE_MAGIC);
        text.push('\n');
    }
    text.push_str(&bindings.fill(&template.body, str::to_string, str::to_string)?);
    if !extra.directives.is_empty() {
        if !text.ends_with('\n') {
            text.push('\n');
        }
        text.push('\n');
        for directive in &extra.directives {
            text.push_str(&directive.to_tcl(&bindings)?);
            text.push('\n');
        }
    }

    Ok(RenderedModuleFile {
        name: pkg.name.clone(),
        version: pkg.version.clone(),
        text,
    })
}
