//! Driver settings
//!
//! Read from a TOML file; every field can be overridden on the command line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::formula::{FormulaError, FormulaRegistry};
use crate::pipeline::InstallPipeline;
use crate::shell::{CMakeBuild, GitFetcher, ShellModuleSystem};

/// Where Cray systems keep the `module` shell function.
pub const DEFAULT_MODULE_INIT: &str = "/opt/modules/default/init/sh";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory of formula TOML files; the built-in set when unset.
    pub formulas_dir: Option<PathBuf>,
    /// Root of the module search path, e.g. `/sw/xk6/modulefiles`.
    pub modulefiles_root: Option<PathBuf>,
    pub module_init: Option<PathBuf>,
    pub shell: PathBuf,
    pub make_jobs: Option<usize>,
    /// Cluster literals available to module templates.
    pub vars: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            formulas_dir: None,
            modulefiles_root: None,
            module_init: Some(PathBuf::from(DEFAULT_MODULE_INIT)),
            shell: PathBuf::from("sh"),
            make_jobs: None,
            vars: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn registry(&self) -> Result<FormulaRegistry, FormulaError> {
        match &self.formulas_dir {
            Some(dir) => FormulaRegistry::load_from_dir(dir),
            None => FormulaRegistry::builtin(),
        }
    }

    /// A pipeline driving the real module runtime, git, and cmake.
    pub fn pipeline(&self) -> InstallPipeline {
        InstallPipeline::new(
            Box::new(ShellModuleSystem::new(&self.shell, self.module_init.clone())),
            Box::new(GitFetcher::default()),
            Box::new(CMakeBuild {
                jobs: self.make_jobs,
                ..CMakeBuild::default()
            }),
        )
    }
}

/// Parse `KEY=VALUE`, as used by `--var`.
pub fn parse_var(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_keep_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(
            &path,
            "modulefiles_root = \"/sw/xk6/modulefiles\"\nmake_jobs = 8\n\n[vars]\nsw_root = \"/sw/xk6\"\n",
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.modulefiles_root, Some(PathBuf::from("/sw/xk6/modulefiles")));
        assert_eq!(settings.make_jobs, Some(8));
        assert_eq!(settings.module_init, Some(PathBuf::from(DEFAULT_MODULE_INIT)));
        assert_eq!(settings.vars.get("sw_root").map(String::as_str), Some("/sw/xk6"));
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::load(Path::new("/nonexistent/settings.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_parse_var() {
        assert_eq!(parse_var("sw_root=/sw/x=1"), Ok(("sw_root".into(), "/sw/x=1".into())));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_default_registry_is_builtin() {
        let registry = Settings::default().registry().unwrap();
        assert!(registry.get("gpu_check").is_some());
    }
}
