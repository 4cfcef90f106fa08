//! Formula System - One Recipe Per Package
//!
//! Formulas are TOML files. They are loaded once and never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::package::Package;
use crate::templates::{Directive, ModuleDirectives, ModuleTemplate, RenderError, RenderedModuleFile};
use crate::variant::{ModuleCommandList, Variant};

pub type FormulaName = String;

#[derive(Debug, Error)]
pub enum FormulaError {
    #[error("Formula not found: {0}")]
    NotFound(String),

    #[error("Duplicate formula name: {0}")]
    Duplicate(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid formula {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid formula {origin}: build root {root} leaves the checkout")]
    BuildRoot { origin: String, root: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    /// Branch or tag to check out instead of the default branch.
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build root, relative to the checkout. Empty means the checkout itself.
    #[serde(default)]
    pub root: PathBuf,
    #[serde(default)]
    pub configure_args: Vec<String>,
}

impl BuildSpec {
    /// True when `root` names a directory inside the checkout.
    pub fn is_contained(&self) -> bool {
        self.root
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    }

    /// The build root within `checkout`, or None if it would leave it.
    pub fn root_in(&self, checkout: &Path) -> Option<PathBuf> {
        self.is_contained().then(|| checkout.join(&self.root))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Formula {
    pub name: FormulaName,
    pub homepage: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub build: BuildSpec,
    pub variants: BTreeMap<String, Variant>,
    #[serde(default)]
    pub modulefile: ModuleTemplate,
    #[serde(default)]
    pub directives: Vec<Directive>,
}

impl Formula {
    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.get(name)
    }

    pub fn variant_names(&self) -> Vec<&str> {
        self.variants.keys().map(String::as_str).collect()
    }

    /// Module commands for `build` under the named variant.
    pub fn module_commands(&self, variant: &str, build: &str) -> Option<ModuleCommandList> {
        self.variant(variant).map(|v| v.resolve(build))
    }

    pub fn module_directives(&self, vars: &BTreeMap<String, String>) -> ModuleDirectives {
        ModuleDirectives {
            vars: vars.clone(),
            directives: self.directives.clone(),
        }
    }

    pub fn render_modulefile(
        &self,
        pkg: &Package,
        vars: &BTreeMap<String, String>,
    ) -> Result<RenderedModuleFile, RenderError> {
        self.modulefile.render(pkg, &self.module_directives(vars))
    }
}

pub fn parse_formula(content: &str, origin: &str) -> Result<Formula, FormulaError> {
    let formula: Formula = toml::from_str(content).map_err(|source| FormulaError::Parse {
        origin: origin.to_string(),
        source,
    })?;
    if !formula.build.is_contained() {
        return Err(FormulaError::BuildRoot {
            origin: origin.to_string(),
            root: formula.build.root,
        });
    }
    Ok(formula)
}

const BUILTIN: &[(&str, &str)] = &[
    ("interval_check.toml", include_str!("../formulas/interval_check.toml")),
    ("gpu_check.toml", include_str!("../formulas/gpu_check.toml")),
    ("file_progress.toml", include_str!("../formulas/file_progress.toml")),
];

/// Formula registry - loads formulas and looks them up by name
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    formulas: BTreeMap<FormulaName, Formula>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The formulas shipped with this crate.
    pub fn builtin() -> Result<Self, FormulaError> {
        let mut registry = Self::new();
        for (origin, content) in BUILTIN {
            registry.register(parse_formula(content, origin)?)?;
        }
        Ok(registry)
    }

    /// Load every `*.toml` in `dir`. A missing directory yields an empty registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self, FormulaError> {
        let mut registry = Self::new();
        if !dir.exists() {
            return Ok(registry);
        }

        let io_err = |source: std::io::Error| FormulaError::Io {
            path: dir.to_path_buf(),
            source,
        };
        let mut paths = vec![];
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().is_some_and(|e| e == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            let content = fs::read_to_string(&path).map_err(|source| FormulaError::Io {
                path: path.clone(),
                source,
            })?;
            let formula = parse_formula(&content, &path.display().to_string())?;
            debug!("Loaded formula {} from {}", formula.name, path.display());
            registry.register(formula)?;
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Formula> {
        self.formulas.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Formula, FormulaError> {
        self.get(name)
            .ok_or_else(|| FormulaError::NotFound(name.to_string()))
    }

    /// Formulas in name order.
    pub fn list(&self) -> Vec<&Formula> {
        self.formulas.values().collect()
    }

    pub fn register(&mut self, formula: Formula) -> Result<(), FormulaError> {
        if self.formulas.contains_key(&formula.name) {
            return Err(FormulaError::Duplicate(formula.name));
        }
        self.formulas.insert(formula.name.clone(), formula);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "demo"
homepage = "https://example.org/demo"

[source]
url = "https://example.org/demo.git"
ref = "v1.2"

[build]
root = "plugins/Demo"

[variants.dev]
baseline = ["unload PrgEnv-gnu"]
tail = ["load cmake3"]

[[variants.dev.rules]]
contains = "gnu"
emit = ["load PrgEnv-gnu"]

[[variants.dev.rules]]
matches = 'gnu([\d.]+)'
emit = ["swap gcc gcc/$1"]

[[directives]]
kind = "setenv"
name = "DEMO_ROOT"
value = "{{prefix}}"
"#;

    #[test]
    fn test_parse_minimal() {
        let formula = parse_formula(MINIMAL, "inline").unwrap();
        assert_eq!(formula.source.reference.as_deref(), Some("v1.2"));
        assert_eq!(formula.build.root, PathBuf::from("plugins/Demo"));
        assert_eq!(formula.variant_names(), vec!["dev"]);

        let commands = formula.module_commands("dev", "gnu6.1").unwrap();
        let lines: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            lines,
            vec!["unload PrgEnv-gnu", "load PrgEnv-gnu", "swap gcc gcc/6.1", "load cmake3"]
        );
        assert!(formula.module_commands("prod", "gnu").is_none());
    }

    #[test]
    fn test_bad_command_rejected_at_load() {
        let broken = MINIMAL.replace("\"load cmake3\"", "\"reload cmake3\"");
        let err = parse_formula(&broken, "inline").unwrap_err();
        assert!(err.to_string().contains("Unknown module command verb: reload"));
    }

    #[test]
    fn test_bad_regex_rejected_at_load() {
        let broken = MINIMAL.replace(r"gnu([\d.]+)", "gnu([");
        assert!(matches!(
            parse_formula(&broken, "inline"),
            Err(FormulaError::Parse { .. })
        ));
    }

    #[test]
    fn test_escaping_build_root_rejected_at_load() {
        for root in ["/var/tmp", "../elsewhere", "plugins/../../up"] {
            let broken = MINIMAL.replace("\"plugins/Demo\"", &format!("\"{}\"", root));
            assert!(
                matches!(
                    parse_formula(&broken, "inline"),
                    Err(FormulaError::BuildRoot { .. })
                ),
                "{}",
                root
            );
        }
    }

    #[test]
    fn test_build_root_in_checkout() {
        let checkout = Path::new("/sw/x/ic/source");
        let build = |root: &str| BuildSpec {
            root: PathBuf::from(root),
            configure_args: vec![],
        };
        assert_eq!(build("").root_in(checkout), Some(checkout.to_path_buf()));
        assert_eq!(
            build("./plugins/File_Progress").root_in(checkout),
            Some(checkout.join("plugins/File_Progress"))
        );
        assert_eq!(build("/etc").root_in(checkout), None);
        assert_eq!(build("a/../..").root_in(checkout), None);
    }

    #[test]
    fn test_builtin_registry() {
        let registry = FormulaRegistry::builtin().unwrap();
        let names: Vec<_> = registry.list().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["file_progress", "gpu_check", "interval_check"]);
        assert!(matches!(
            registry.require("nope"),
            Err(FormulaError::NotFound(n)) if n == "nope"
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = FormulaRegistry::new();
        registry.register(parse_formula(MINIMAL, "a").unwrap()).unwrap();
        let err = registry.register(parse_formula(MINIMAL, "b").unwrap()).unwrap_err();
        assert!(matches!(err, FormulaError::Duplicate(n) if n == "demo"));
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("demo.toml"), MINIMAL).unwrap();
        fs::write(dir.path().join("notes.txt"), "not a formula").unwrap();

        let registry = FormulaRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(registry.list().len(), 1);
        assert!(registry.get("demo").is_some());

        let empty = FormulaRegistry::load_from_dir(&dir.path().join("missing")).unwrap();
        assert!(empty.list().is_empty());
    }
}
