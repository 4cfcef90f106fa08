//! HPC Formula - recipes for building cluster libraries and their modules
//!
//! # Ground Rules
//! 1. Formulas Are Data
//! 2. Compiler Environments Are Unloaded Before Anything Loads
//! 3. Every Placeholder Resolves Or Rendering Fails
//! 4. Steps Run In Order, First Failure Wins
//! 5. Resets Make Reinstalls Idempotent

pub mod config;
pub mod formula;
pub mod hashing;
pub mod package;
pub mod pipeline;
pub mod shell;
pub mod templates;
pub mod validation;
pub mod variant;

pub use config::Settings;
pub use formula::{Formula, FormulaError, FormulaRegistry};
pub use hashing::{canonical_json, compute_report_hash, compute_request_hash, sha256_hex};
pub use package::{Package, PackageError};
pub use pipeline::{
    BuildEnv, BuildRequest, BuildSystem, InstallError, InstallPipeline, InstallReport,
    InstallStep, ModuleSystem, SourceFetcher, StepFailure,
};
pub use templates::{render, Directive, ModuleDirectives, ModuleTemplate, RenderError, RenderedModuleFile};
pub use validation::{LintPolicy, LintResult, LintRule, Linter, LintViolation, ViolationSeverity};
pub use variant::{ModuleCommand, ModuleCommandList, ModuleRule, Predicate, Variant};

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
