//! Install Pipeline - Single Entry Point
//!
//! Steps run strictly in order and the first failure aborts the install.
//! Every step gets its working directory as a parameter; the process CWD is
//! never touched. There is no lock on the prefix: one install per prefix at
//! a time is the caller's responsibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::formula::{Formula, SourceSpec};
use crate::hashing::{compute_report_hash, compute_request_hash};
use crate::package::Package;
use crate::templates::RenderedModuleFile;
use crate::variant::ModuleCommandList;
use crate::TOOL_VERSION;

/// Environment the build steps run under, as left by the module commands.
pub type BuildEnv = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallStep {
    Prepare,
    ResetWorkspace,
    Fetch,
    SelectBuildRoot,
    ResetBuildDir,
    Configure,
    Compile,
    Install,
}

impl InstallStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStep::Prepare => "prepare",
            InstallStep::ResetWorkspace => "reset-workspace",
            InstallStep::Fetch => "fetch",
            InstallStep::SelectBuildRoot => "select-build-root",
            InstallStep::ResetBuildDir => "reset-build-dir",
            InstallStep::Configure => "configure",
            InstallStep::Compile => "compile",
            InstallStep::Install => "install",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an external tool reported when it failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Exit code; None if the tool could not be started or was killed.
    pub status: Option<i32>,
    pub output: String,
}

impl StepFailure {
    pub fn new(status: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            status,
            output: output.into(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "exit status {}", code)?,
            None => f.write_str("no exit status")?,
        }
        if !self.output.is_empty() {
            write!(f, ": {}", self.output)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Unknown variant '{variant}' for formula {formula}")]
    UnknownVariant { formula: String, variant: String },

    #[error("Environment preparation failed: {0}")]
    EnvironmentPrep(StepFailure),

    #[error("Fetch failed: {0}")]
    Fetch(StepFailure),

    #[error("Build step '{step}' failed: {failure}")]
    BuildStep {
        step: InstallStep,
        failure: StepFailure,
    },

    #[error("Build root not found after fetch: {0}")]
    BuildRootMissing(PathBuf),

    #[error("Build root {0} leaves the checkout")]
    BuildRootEscapes(PathBuf),

    #[error("Step '{step}' could not reset {path}: {source}")]
    Workspace {
        step: InstallStep,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InstallError {
    /// The step the install died in, if it got that far.
    pub fn step(&self) -> Option<InstallStep> {
        match self {
            InstallError::UnknownVariant { .. } | InstallError::Serialization(_) => None,
            InstallError::EnvironmentPrep(_) => Some(InstallStep::Prepare),
            InstallError::Fetch(_) => Some(InstallStep::Fetch),
            InstallError::BuildStep { step, .. } => Some(*step),
            InstallError::BuildRootMissing(_) | InstallError::BuildRootEscapes(_) => {
                Some(InstallStep::SelectBuildRoot)
            }
            InstallError::Workspace { step, .. } => Some(*step),
        }
    }
}

/// Applies module commands and reports the resulting environment.
pub trait ModuleSystem {
    fn apply(&self, commands: &ModuleCommandList) -> Result<BuildEnv, StepFailure>;
}

/// Version-control client. `dest` exists and is empty.
pub trait SourceFetcher {
    fn fetch(&self, source: &SourceSpec, dest: &Path, env: &BuildEnv) -> Result<(), StepFailure>;
}

/// Out-of-tree configure / compile / install, all run from `build_dir`.
pub trait BuildSystem {
    fn configure(
        &self,
        build_dir: &Path,
        source_root: &Path,
        prefix: &Path,
        args: &[String],
        env: &BuildEnv,
    ) -> Result<(), StepFailure>;

    fn compile(&self, build_dir: &Path, env: &BuildEnv) -> Result<(), StepFailure>;

    fn install(&self, build_dir: &Path, env: &BuildEnv) -> Result<(), StepFailure>;
}

/// One install invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub formula: String,
    pub variant: String,
    pub build: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulefileRecord {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReport {
    pub id: String,
    pub request: BuildRequest,
    pub package: Package,
    pub tool_version: String,
    pub request_hash: String,
    pub commands: ModuleCommandList,
    pub steps: Vec<InstallStep>,
    pub build_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub modulefile: Option<ModulefileRecord>,
    pub report_hash: String,
}

impl InstallReport {
    /// Record the module file written for this install and re-seal the report.
    pub fn attach_modulefile(
        &mut self,
        rendered: &RenderedModuleFile,
        path: PathBuf,
    ) -> Result<(), serde_json::Error> {
        self.modulefile = Some(ModulefileRecord {
            path,
            sha256: rendered.sha256(),
        });
        self.seal()
    }

    fn seal(&mut self) -> Result<(), serde_json::Error> {
        self.report_hash = String::new();
        self.report_hash = compute_report_hash(&*self)?;
        Ok(())
    }
}

/// Remove whatever is at `path` and leave an empty directory there.
fn reset_dir(step: InstallStep, path: &Path) -> Result<(), InstallError> {
    let workspace = |source: io::Error| InstallError::Workspace {
        step,
        path: path.to_path_buf(),
        source,
    };
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).map_err(workspace)?,
        Ok(_) => fs::remove_file(path).map_err(workspace)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(workspace(e)),
    }
    fs::create_dir_all(path).map_err(workspace)
}

/// The install pipeline - sequencing, working directories, and failure attribution
pub struct InstallPipeline {
    modules: Box<dyn ModuleSystem>,
    fetcher: Box<dyn SourceFetcher>,
    builder: Box<dyn BuildSystem>,
}

impl InstallPipeline {
    pub fn new(
        modules: Box<dyn ModuleSystem>,
        fetcher: Box<dyn SourceFetcher>,
        builder: Box<dyn BuildSystem>,
    ) -> Self {
        Self {
            modules,
            fetcher,
            builder,
        }
    }

    /// Install `pkg` from `formula` using the named variant.
    ///
    /// An aborted install can leave a half-populated prefix; the resets at
    /// the start of the next run clear it.
    pub fn install(
        &self,
        formula: &Formula,
        pkg: &Package,
        variant: &str,
        build: &str,
    ) -> Result<InstallReport, InstallError> {
        let started_at = Utc::now();
        let selected = formula
            .variant(variant)
            .ok_or_else(|| InstallError::UnknownVariant {
                formula: formula.name.clone(),
                variant: variant.to_string(),
            })?;
        let mut steps = vec![];

        info!("Installing {} {} into {}", pkg.name, pkg.version, pkg.prefix.display());

        // 1. prepare
        let commands = selected.resolve(build);
        info!("Step {}: {} module commands", InstallStep::Prepare, commands.len());
        for command in &commands {
            debug!("module {}", command);
        }
        let env = self
            .modules
            .apply(&commands)
            .map_err(InstallError::EnvironmentPrep)?;
        steps.push(InstallStep::Prepare);

        // 2. reset-workspace
        let source_dir = pkg.source_dir();
        info!("Step {}: {}", InstallStep::ResetWorkspace, source_dir.display());
        reset_dir(InstallStep::ResetWorkspace, &source_dir)?;
        steps.push(InstallStep::ResetWorkspace);

        // 3. fetch
        info!("Step {}: {}", InstallStep::Fetch, formula.source.url);
        self.fetcher
            .fetch(&formula.source, &source_dir, &env)
            .map_err(InstallError::Fetch)?;
        steps.push(InstallStep::Fetch);

        // 4. select-build-root
        let build_root = formula
            .build
            .root_in(&source_dir)
            .ok_or_else(|| InstallError::BuildRootEscapes(formula.build.root.clone()))?;
        info!("Step {}: {}", InstallStep::SelectBuildRoot, build_root.display());
        if !build_root.is_dir() {
            return Err(InstallError::BuildRootMissing(build_root));
        }
        steps.push(InstallStep::SelectBuildRoot);

        // 5. reset-build-dir
        let build_dir = build_root.join("build");
        info!("Step {}: {}", InstallStep::ResetBuildDir, build_dir.display());
        reset_dir(InstallStep::ResetBuildDir, &build_dir)?;
        steps.push(InstallStep::ResetBuildDir);

        // 6-8. configure, compile, install
        let build_step =
            |step: InstallStep| move |failure: StepFailure| InstallError::BuildStep { step, failure };

        info!("Step {}", InstallStep::Configure);
        self.builder
            .configure(&build_dir, &build_root, &pkg.prefix, &formula.build.configure_args, &env)
            .map_err(build_step(InstallStep::Configure))?;
        steps.push(InstallStep::Configure);

        info!("Step {}", InstallStep::Compile);
        self.builder
            .compile(&build_dir, &env)
            .map_err(build_step(InstallStep::Compile))?;
        steps.push(InstallStep::Compile);

        info!("Step {}", InstallStep::Install);
        self.builder
            .install(&build_dir, &env)
            .map_err(build_step(InstallStep::Install))?;
        steps.push(InstallStep::Install);

        let request = BuildRequest {
            formula: formula.name.clone(),
            variant: variant.to_string(),
            build: build.to_string(),
        };
        let request_hash = compute_request_hash(
            &request.formula,
            &request.variant,
            &request.build,
            pkg,
            TOOL_VERSION,
        )?;

        let mut report = InstallReport {
            id: Uuid::new_v4().to_string(),
            request,
            package: pkg.clone(),
            tool_version: TOOL_VERSION.to_string(),
            request_hash,
            commands,
            steps,
            build_dir,
            started_at,
            finished_at: Utc::now(),
            modulefile: None,
            report_hash: String::new(),
        };
        report.seal()?;

        info!("Installed {} {}", pkg.name, pkg.version);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_dir_clears_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("source");
        fs::create_dir_all(target.join("nested")).unwrap();
        fs::write(target.join("nested/stale.o"), b"old").unwrap();

        reset_dir(InstallStep::ResetWorkspace, &target).unwrap();
        assert!(target.is_dir());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn test_reset_dir_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("build");
        fs::write(&target, b"not a dir").unwrap();

        reset_dir(InstallStep::ResetBuildDir, &target).unwrap();
        assert!(target.is_dir());
    }

    #[test]
    fn test_reset_failure_names_step() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"a file, not a directory").unwrap();

        let err = reset_dir(InstallStep::ResetBuildDir, &blocker.join("build")).unwrap_err();
        assert!(matches!(err, InstallError::Workspace { .. }));
        assert_eq!(err.step(), Some(InstallStep::ResetBuildDir));
        assert!(err.to_string().starts_with("Step 'reset-build-dir' could not reset"));
    }

    #[test]
    fn test_step_failure_display() {
        let failure = StepFailure::new(Some(2), "make: *** [all] Error 2");
        let err = InstallError::BuildStep { step: InstallStep::Compile, failure };
        assert_eq!(
            err.to_string(),
            "Build step 'compile' failed: exit status 2: make: *** [all] Error 2"
        );
        assert_eq!(err.step(), Some(InstallStep::Compile));
        assert_eq!(StepFailure::new(None, "").to_string(), "no exit status");
    }
}
