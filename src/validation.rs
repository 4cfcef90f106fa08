//! Formula Lint - Rule/Policy Separation
//!
//! Rules produce structured violations.
//! Policy decides whether warnings block.

use serde::{Deserialize, Serialize};

use crate::formula::Formula;
use crate::templates::placeholder_keys;
use crate::variant::ModuleCommand;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LintResult {
    pub valid: bool,
    pub violations: Vec<LintViolation>,
    pub formula: String,
}

impl LintResult {
    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }
}

/// Lint rule trait - produces violations
pub trait LintRule {
    fn name(&self) -> &'static str;
    fn check(&self, formula: &Formula) -> Vec<LintViolation>;
}

fn violation(
    rule: &dyn LintRule,
    severity: ViolationSeverity,
    message: String,
    remediation: &str,
) -> LintViolation {
    LintViolation {
        rule: rule.name().to_string(),
        severity,
        message,
        remediation: vec![remediation.to_string()],
    }
}

// --- Concrete Rules ---

/// Every `{{ key }}` in the body and directives is declared in the schema.
pub struct PlaceholderSchemaRule;

impl LintRule for PlaceholderSchemaRule {
    fn name(&self) -> &'static str { "placeholder_schema" }

    fn check(&self, formula: &Formula) -> Vec<LintViolation> {
        let text = formula
            .modulefile
            .source_text(&formula.module_directives(&Default::default()));
        let keys = match placeholder_keys(&text) {
            Ok(keys) => keys,
            Err(e) => {
                return vec![violation(
                    self,
                    ViolationSeverity::Error,
                    e.to_string(),
                    "Close every '{{' with '}}'",
                )]
            }
        };

        let mut violations = vec![];
        let mut seen: Vec<&str> = vec![];
        for key in &keys {
            if seen.contains(&key.as_str()) {
                continue;
            }
            seen.push(key);
            if !formula.modulefile.placeholders.contains(key) {
                violations.push(violation(
                    self,
                    ViolationSeverity::Error,
                    format!("Placeholder '{}' is not declared", key),
                    "Add it to modulefile.placeholders",
                ));
            }
        }
        for declared in &formula.modulefile.placeholders {
            if !keys.contains(declared) {
                violations.push(violation(
                    self,
                    ViolationSeverity::Info,
                    format!("Placeholder '{}' is declared but never used", declared),
                    "Drop it from modulefile.placeholders",
                ));
            }
        }
        violations
    }
}

/// The baseline only unloads, so no stale compiler survives into the build.
pub struct BaselineRule;

impl LintRule for BaselineRule {
    fn name(&self) -> &'static str { "baseline" }

    fn check(&self, formula: &Formula) -> Vec<LintViolation> {
        let mut violations = vec![];
        for (name, variant) in &formula.variants {
            if variant.baseline.is_empty() {
                violations.push(violation(
                    self,
                    ViolationSeverity::Warning,
                    format!("Variant '{}' has no baseline unload", name),
                    "Unload every programming environment first",
                ));
            }
            if let Some(load) = variant
                .baseline
                .iter()
                .find(|c| !matches!(c, ModuleCommand::Unload(_)))
            {
                violations.push(violation(
                    self,
                    ViolationSeverity::Error,
                    format!("Variant '{}' baseline contains '{}'", name, load),
                    "Move loads and swaps into rules or the tail",
                ));
            }
        }
        violations
    }
}

/// The build root is a plain relative path inside the checkout.
pub struct BuildRootRule;

impl LintRule for BuildRootRule {
    fn name(&self) -> &'static str { "build_root" }

    fn check(&self, formula: &Formula) -> Vec<LintViolation> {
        if !formula.build.is_contained() {
            vec![violation(
                self,
                ViolationSeverity::Error,
                format!("Build root {} leaves the checkout", formula.build.root.display()),
                "Use a path relative to the repository root without '..'",
            )]
        } else {
            vec![]
        }
    }
}

pub struct SourceRule;

impl LintRule for SourceRule {
    fn name(&self) -> &'static str { "source" }

    fn check(&self, formula: &Formula) -> Vec<LintViolation> {
        let url = formula.source.url.trim();
        if url.is_empty() || url == "none" {
            vec![violation(
                self,
                ViolationSeverity::Error,
                "No source URL".to_string(),
                "Set source.url to a clonable repository",
            )]
        } else {
            vec![]
        }
    }
}

pub struct VariantsRule;

impl LintRule for VariantsRule {
    fn name(&self) -> &'static str { "variants" }

    fn check(&self, formula: &Formula) -> Vec<LintViolation> {
        if formula.variants.is_empty() {
            vec![violation(
                self,
                ViolationSeverity::Error,
                "Formula defines no variants".to_string(),
                "Add at least a [variants.dev] table",
            )]
        } else {
            vec![]
        }
    }
}

/// Whether warnings block a formula.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LintPolicy {
    #[default]
    Block,
    Pedantic,
}

/// Linter orchestrates rules and applies policy
pub struct Linter {
    rules: Vec<Box<dyn LintRule>>,
    policy: LintPolicy,
}

impl Linter {
    pub fn new(policy: LintPolicy) -> Self {
        Self {
            rules: vec![
                Box::new(VariantsRule),
                Box::new(SourceRule),
                Box::new(BuildRootRule),
                Box::new(BaselineRule),
                Box::new(PlaceholderSchemaRule),
            ],
            policy,
        }
    }

    pub fn check(&self, formula: &Formula) -> LintResult {
        let violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.check(formula))
            .collect();

        let blocking = |v: &LintViolation| match self.policy {
            LintPolicy::Block => v.severity == ViolationSeverity::Error,
            LintPolicy::Pedantic => v.severity != ViolationSeverity::Info,
        };

        LintResult {
            valid: !violations.iter().any(blocking),
            violations,
            formula: formula.name.clone(),
        }
    }
}

impl Default for Linter {
    fn default() -> Self {
        Self::new(LintPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::FormulaRegistry;
    use std::path::PathBuf;

    fn interval_check() -> Formula {
        FormulaRegistry::builtin()
            .unwrap()
            .get("interval_check")
            .unwrap()
            .clone()
    }

    #[test]
    fn test_builtin_formulas_are_clean() {
        let linter = Linter::new(LintPolicy::Pedantic);
        for formula in FormulaRegistry::builtin().unwrap().list() {
            let result = linter.check(formula);
            assert!(result.valid, "{}: {:?}", formula.name, result.violations);
        }
    }

    #[test]
    fn test_escaping_build_root() {
        let mut formula = interval_check();
        formula.build.root = PathBuf::from("../elsewhere");
        let result = Linter::default().check(&formula);
        assert!(!result.valid);
        assert!(result.violations.iter().any(|v| v.rule == "build_root"));
    }

    #[test]
    fn test_undeclared_placeholder() {
        let mut formula = interval_check();
        formula.modulefile.body.push_str("set ROOT {{ sw_root }}\n");
        let result = Linter::default().check(&formula);
        assert!(!result.valid);
        assert!(result
            .violations
            .iter()
            .any(|v| v.rule == "placeholder_schema" && v.message.contains("sw_root")));
    }

    #[test]
    fn test_load_in_baseline() {
        let mut formula = interval_check();
        let dev = formula.variants.get_mut("dev").unwrap();
        dev.baseline.push("load PrgEnv-gnu".parse().unwrap());
        let result = Linter::default().check(&formula);
        assert!(result.has_errors());
    }

    #[test]
    fn test_policy_controls_warnings() {
        let mut formula = interval_check();
        formula.variants.get_mut("dev").unwrap().baseline.clear();

        assert!(Linter::new(LintPolicy::Block).check(&formula).valid);
        assert!(!Linter::new(LintPolicy::Pedantic).check(&formula).valid);
    }
}
