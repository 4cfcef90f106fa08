//! Variant Matcher - Build Identifier to Module Commands
//!
//! A variant is data: a baseline, an ordered list of predicate -> commands
//! rules, and a fixed tail. Adding a compiler family means adding a rule to
//! the formula file, never touching this module.

use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandParseError {
    #[error("Empty module command")]
    Empty,

    #[error("Unknown module command verb: {0}")]
    UnknownVerb(String),

    #[error("'{verb}' expects {expected}, got: {command}")]
    Arity {
        verb: &'static str,
        expected: &'static str,
        command: String,
    },
}

/// A single directive for the module runtime, e.g. `swap gcc gcc/4.9.3`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModuleCommand {
    Unload(Vec<String>),
    Load(String),
    Swap { from: String, to: String },
}

impl ModuleCommand {
    pub fn verb(&self) -> &'static str {
        match self {
            ModuleCommand::Unload(_) => "unload",
            ModuleCommand::Load(_) => "load",
            ModuleCommand::Swap { .. } => "swap",
        }
    }

    /// Load and swap both bring a module into the environment.
    pub fn is_load(&self) -> bool {
        matches!(self, ModuleCommand::Load(_) | ModuleCommand::Swap { .. })
    }

    pub fn args(&self) -> Vec<&str> {
        match self {
            ModuleCommand::Unload(names) => names.iter().map(String::as_str).collect(),
            ModuleCommand::Load(name) => vec![name.as_str()],
            ModuleCommand::Swap { from, to } => vec![from.as_str(), to.as_str()],
        }
    }

    /// Substitute `$1`, `${name}` etc. in every argument from regex captures.
    fn expand(&self, caps: &Captures<'_>) -> ModuleCommand {
        let expand = |arg: &str| {
            let mut out = String::new();
            caps.expand(arg, &mut out);
            out
        };
        match self {
            ModuleCommand::Unload(names) => {
                ModuleCommand::Unload(names.iter().map(|n| expand(n)).collect())
            }
            ModuleCommand::Load(name) => ModuleCommand::Load(expand(name)),
            ModuleCommand::Swap { from, to } => ModuleCommand::Swap {
                from: expand(from),
                to: expand(to),
            },
        }
    }
}

impl fmt::Display for ModuleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.verb(), self.args().join(" "))
    }
}

impl FromStr for ModuleCommand {
    type Err = CommandParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next().ok_or(CommandParseError::Empty)?;
        let args: Vec<String> = words.map(str::to_string).collect();

        let arity = |verb: &'static str, expected: &'static str| CommandParseError::Arity {
            verb,
            expected,
            command: s.trim().to_string(),
        };

        match verb {
            "unload" if args.is_empty() => Err(arity("unload", "at least one module")),
            "unload" => Ok(ModuleCommand::Unload(args)),
            "load" => match <[String; 1]>::try_from(args) {
                Ok([name]) => Ok(ModuleCommand::Load(name)),
                Err(_) => Err(arity("load", "exactly one module")),
            },
            "swap" => match <[String; 2]>::try_from(args) {
                Ok([from, to]) => Ok(ModuleCommand::Swap { from, to }),
                Err(_) => Err(arity("swap", "an old and a new module")),
            },
            other => Err(CommandParseError::UnknownVerb(other.to_string())),
        }
    }
}

impl TryFrom<String> for ModuleCommand {
    type Error = CommandParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModuleCommand> for String {
    fn from(command: ModuleCommand) -> Self {
        command.to_string()
    }
}

/// Ordered commands to run before a build. Order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleCommandList(Vec<ModuleCommand>);

impl ModuleCommandList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, command: ModuleCommand) {
        self.0.push(command);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ModuleCommand> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[ModuleCommand] {
        &self.0
    }

    /// True when no load/swap appears before the first unload.
    pub fn unload_precedes_loads(&self) -> bool {
        let first_unload = self
            .0
            .iter()
            .position(|c| matches!(c, ModuleCommand::Unload(_)));
        let first_load = self.0.iter().position(ModuleCommand::is_load);
        match (first_unload, first_load) {
            (Some(unload), Some(load)) => unload < load,
            _ => true,
        }
    }
}

impl<'a> IntoIterator for &'a ModuleCommandList {
    type Item = &'a ModuleCommand;
    type IntoIter = std::slice::Iter<'a, ModuleCommand>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<Vec<ModuleCommand>> for ModuleCommandList {
    fn from(commands: Vec<ModuleCommand>) -> Self {
        Self(commands)
    }
}

/// Compiled regex that round-trips through its source string.
#[derive(Debug, Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Regex::new(source).map(Pattern)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn regex(&self) -> &Regex {
        &self.0
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

/// A regex that must cover the whole text it is tested against.
#[derive(Debug, Clone)]
pub struct FullPattern {
    source: String,
    anchored: Regex,
}

impl FullPattern {
    pub fn new(source: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: source.to_string(),
            anchored: Regex::new(&format!("^(?:{})$", source))?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.anchored.is_match(text)
    }
}

impl Serialize for FullPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for FullPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        FullPattern::new(&source).map_err(serde::de::Error::custom)
    }
}

/// When a rule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Plain substring test.
    Contains(String),
    /// Regex test; capture groups feed `$1`.. in the emitted commands.
    Matches(Pattern),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRule {
    #[serde(flatten)]
    pub when: Predicate,
    pub emit: Vec<ModuleCommand>,
    /// Captures must fully match this before they reach a command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captures_must_match: Option<FullPattern>,
}

impl ModuleRule {
    /// Commands this rule contributes for `build`, or None if it does not fire.
    pub fn apply(&self, build: &str) -> Option<Vec<ModuleCommand>> {
        match &self.when {
            Predicate::Contains(token) => build.contains(token.as_str()).then(|| self.emit.clone()),
            Predicate::Matches(pattern) => {
                let caps = pattern.regex().captures(build)?;
                if let Some(check) = &self.captures_must_match {
                    let rejected = caps
                        .iter()
                        .skip(1)
                        .flatten()
                        .find(|m| !check.is_match(m.as_str()));
                    if let Some(bad) = rejected {
                        warn!(
                            "Skipping rule '{}': captured '{}' does not match {}",
                            pattern.as_str(),
                            bad.as_str(),
                            check.as_str()
                        );
                        return None;
                    }
                }
                Some(self.emit.iter().map(|c| c.expand(&caps)).collect())
            }
        }
    }
}

/// A named build configuration; resolves a build identifier into commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub baseline: Vec<ModuleCommand>,
    #[serde(default)]
    pub rules: Vec<ModuleRule>,
    #[serde(default)]
    pub tail: Vec<ModuleCommand>,
}

impl Variant {
    /// Baseline, then every firing rule in order, then the fixed tail.
    ///
    /// An identifier that matches nothing yields baseline + tail.
    pub fn resolve(&self, build: &str) -> ModuleCommandList {
        let mut commands = ModuleCommandList::new();

        for command in &self.baseline {
            commands.push(command.clone());
        }

        for rule in &self.rules {
            if let Some(emitted) = rule.apply(build) {
                debug!("Rule {:?} fired for '{}'", rule.when, build);
                for command in emitted {
                    commands.push(command);
                }
            }
        }

        for command in &self.tail {
            commands.push(command.clone());
        }

        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(s: &str) -> ModuleCommand {
        s.parse().unwrap()
    }

    fn gnu_variant() -> Variant {
        Variant {
            description: None,
            baseline: vec![cmd("unload PrgEnv-gnu PrgEnv-pgi PrgEnv-cray PrgEnv-intel")],
            rules: vec![
                ModuleRule {
                    when: Predicate::Contains("gnu".into()),
                    emit: vec![cmd("load PrgEnv-gnu")],
                    captures_must_match: None,
                },
                ModuleRule {
                    when: Predicate::Matches(Pattern::new(r"gnu([\d\.]+)").unwrap()),
                    emit: vec![cmd("swap gcc gcc/$1")],
                    captures_must_match: None,
                },
            ],
            tail: vec![cmd("load cmake3"), cmd("load git")],
        }
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!(cmd("unload a  b").to_string(), "unload a b");
        assert_eq!(
            cmd("swap gcc gcc/4.9.3"),
            ModuleCommand::Swap { from: "gcc".into(), to: "gcc/4.9.3".into() }
        );
        assert_eq!(
            "load".parse::<ModuleCommand>().unwrap_err().to_string(),
            "'load' expects exactly one module, got: load"
        );
        assert!(matches!(
            "purge".parse::<ModuleCommand>(),
            Err(CommandParseError::UnknownVerb(v)) if v == "purge"
        ));
        assert_eq!("   ".parse::<ModuleCommand>(), Err(CommandParseError::Empty));
    }

    #[test]
    fn test_gnu_with_version() {
        let list = gnu_variant().resolve("sles11.3_gnu4.9.3");
        let rendered: Vec<String> = list.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "unload PrgEnv-gnu PrgEnv-pgi PrgEnv-cray PrgEnv-intel",
                "load PrgEnv-gnu",
                "swap gcc gcc/4.9.3",
                "load cmake3",
                "load git",
            ]
        );
        assert!(list.unload_precedes_loads());
    }

    #[test]
    fn test_family_without_version() {
        let list = gnu_variant().resolve("gnu");
        assert_eq!(list.len(), 4);
        assert!(!list.iter().any(|c| c.verb() == "swap"));
    }

    #[test]
    fn test_unrecognized_is_baseline_plus_tail() {
        let variant = gnu_variant();
        for build in ["", "pgi15.3", "intel"] {
            let list = variant.resolve(build);
            let expected: Vec<ModuleCommand> =
                variant.baseline.iter().chain(&variant.tail).cloned().collect();
            assert_eq!(list.as_slice(), expected.as_slice());
        }
    }

    #[test]
    fn test_capture_validation_skips_rule() {
        let mut variant = gnu_variant();
        variant.rules[1] = ModuleRule {
            when: Predicate::Matches(Pattern::new(r"gnu(\S+)").unwrap()),
            emit: vec![cmd("swap gcc gcc/$1")],
            captures_must_match: Some(FullPattern::new(r"\d+(\.\d+)*").unwrap()),
        };

        let ok = variant.resolve("gnu5.3.0");
        assert!(ok.iter().any(|c| c.to_string() == "swap gcc gcc/5.3.0"));

        let rejected = variant.resolve("gnu5.3.0;rm");
        assert!(!rejected.iter().any(|c| c.verb() == "swap"));
        assert!(rejected.iter().any(|c| c.to_string() == "load PrgEnv-gnu"));
    }

    #[test]
    fn test_capture_check_covers_whole_capture() {
        let check = FullPattern::new(r"4|4\.9").unwrap();
        assert!(check.is_match("4"));
        assert!(check.is_match("4.9"));
        assert!(!check.is_match("4.9.3"));
        assert_eq!(check.as_str(), r"4|4\.9");

        let rule = ModuleRule {
            when: Predicate::Matches(Pattern::new(r"gnu(\S+)").unwrap()),
            emit: vec![cmd("swap gcc gcc/$1")],
            captures_must_match: Some(check),
        };
        assert_eq!(rule.apply("gnu4.9"), Some(vec![cmd("swap gcc gcc/4.9")]));
        assert_eq!(rule.apply("gnu4.9.3"), None);
    }

    #[test]
    fn test_ordering_check() {
        let bad = ModuleCommandList::from(vec![cmd("load gcc"), cmd("unload PrgEnv-gnu")]);
        assert!(!bad.unload_precedes_loads());
        assert!(ModuleCommandList::new().unload_precedes_loads());
    }
}
