//! Shell collaborators - the real module runtime, git, and cmake/make
//!
//! Each tool runs as a child process with an explicit working directory and
//! the environment captured by the module step. Output is captured and a
//! non-zero exit becomes a [`StepFailure`].

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::formula::SourceSpec;
use crate::pipeline::{BuildEnv, BuildSystem, ModuleSystem, SourceFetcher, StepFailure};
use crate::variant::ModuleCommandList;

/// Separates module chatter on stdout from the `env -0` dump.
const ENV_MARKER: &str = "__HPC_FORMULA_ENV__";

/// Longest stderr tail kept in a failure.
const MAX_FAILURE_OUTPUT: usize = 4096;

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:+@%".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn tail(text: &str) -> String {
    let text = text.trim();
    if text.len() <= MAX_FAILURE_OUTPUT {
        return text.to_string();
    }
    let mut start = text.len() - MAX_FAILURE_OUTPUT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Run `cmd` to completion and return its stdout.
fn run_tool(what: &str, cmd: &mut Command, env: &BuildEnv) -> Result<String, StepFailure> {
    if !env.is_empty() {
        cmd.env_clear().envs(env);
    }
    debug!("Running {}: {:?}", what, cmd);

    let output = cmd
        .output()
        .map_err(|e| StepFailure::new(None, format!("Failed to run {}: {}", what, e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        warn!("{} exited with {:?}", what, output.status.code());
        let detail = if stderr.trim().is_empty() { stdout.as_str() } else { stderr.as_ref() };
        return Err(StepFailure::new(output.status.code(), tail(detail)));
    }

    Ok(stdout)
}

/// Parse the `env -0` dump that follows [`ENV_MARKER`].
fn parse_env_dump(stdout: &str) -> Option<BuildEnv> {
    let marker = format!("{}\0", ENV_MARKER);
    let (_, dump) = stdout.split_once(marker.as_str())?;
    Some(
        dump.split('\0')
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// Environment Modules via `sh`: sources the init script, runs each command,
/// then captures the resulting environment.
#[derive(Debug, Clone)]
pub struct ShellModuleSystem {
    pub shell: PathBuf,
    /// Script defining the `module` function, e.g. `/opt/modules/default/init/sh`.
    pub init_script: Option<PathBuf>,
}

impl ShellModuleSystem {
    pub fn new(shell: impl Into<PathBuf>, init_script: Option<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            init_script,
        }
    }

    /// The script handed to the shell; stops at the first failing command.
    pub fn script(&self, commands: &ModuleCommandList) -> String {
        let mut script = String::from("set -e\n");
        if let Some(init) = &self.init_script {
            script.push_str(&format!(". {}\n", shell_quote(&init.to_string_lossy())));
        }
        for command in commands {
            let args: Vec<String> = command.args().iter().map(|a| shell_quote(a)).collect();
            script.push_str(&format!("module {} {}\n", command.verb(), args.join(" ")));
        }
        script.push_str(&format!("printf '%s\\0' {}\nenv -0\n", ENV_MARKER));
        script
    }
}

impl ModuleSystem for ShellModuleSystem {
    fn apply(&self, commands: &ModuleCommandList) -> Result<BuildEnv, StepFailure> {
        let script = self.script(commands);
        let stdout = run_tool(
            "module commands",
            Command::new(&self.shell).arg("-c").arg(&script),
            &BuildEnv::new(),
        )?;
        parse_env_dump(&stdout).ok_or_else(|| {
            StepFailure::new(Some(0), "module shell exited without reporting its environment")
        })
    }
}

/// `git clone` into the reset workspace.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    pub git: PathBuf,
}

impl Default for GitFetcher {
    fn default() -> Self {
        Self { git: PathBuf::from("git") }
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&self, source: &SourceSpec, dest: &Path, env: &BuildEnv) -> Result<(), StepFailure> {
        let mut cmd = Command::new(&self.git);
        cmd.arg("clone");
        if let Some(reference) = &source.reference {
            cmd.arg("--branch").arg(reference);
        }
        cmd.arg(&source.url).arg(dest);
        if let Some(parent) = dest.parent() {
            cmd.current_dir(parent);
        }
        run_tool("git clone", &mut cmd, env).map(|_| ())
    }
}

/// CMake configure with `make` / `make install`.
#[derive(Debug, Clone)]
pub struct CMakeBuild {
    pub cmake: PathBuf,
    pub make: PathBuf,
    pub jobs: Option<usize>,
}

impl Default for CMakeBuild {
    fn default() -> Self {
        Self {
            cmake: PathBuf::from("cmake"),
            make: PathBuf::from("make"),
            jobs: None,
        }
    }
}

impl BuildSystem for CMakeBuild {
    fn configure(
        &self,
        build_dir: &Path,
        source_root: &Path,
        prefix: &Path,
        args: &[String],
        env: &BuildEnv,
    ) -> Result<(), StepFailure> {
        let mut cmd = Command::new(&self.cmake);
        cmd.current_dir(build_dir)
            .arg(format!("-DCMAKE_INSTALL_PREFIX={}", prefix.display()))
            .args(args)
            .arg(source_root);
        run_tool("cmake", &mut cmd, env).map(|_| ())
    }

    fn compile(&self, build_dir: &Path, env: &BuildEnv) -> Result<(), StepFailure> {
        let mut cmd = Command::new(&self.make);
        cmd.current_dir(build_dir);
        if let Some(jobs) = self.jobs {
            cmd.arg(format!("-j{}", jobs));
        }
        run_tool("make", &mut cmd, env).map(|_| ())
    }

    fn install(&self, build_dir: &Path, env: &BuildEnv) -> Result<(), StepFailure> {
        let mut cmd = Command::new(&self.make);
        cmd.current_dir(build_dir).arg("install");
        run_tool("make install", &mut cmd, env).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::ModuleCommand;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("gcc/4.9.3"), "gcc/4.9.3");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("x;rm -rf"), "'x;rm -rf'");
    }

    #[test]
    fn test_module_script() {
        let commands = ModuleCommandList::from(vec![
            "unload PrgEnv-gnu PrgEnv-pgi".parse::<ModuleCommand>().unwrap(),
            "swap gcc gcc/4.9.3".parse::<ModuleCommand>().unwrap(),
        ]);
        let system = ShellModuleSystem::new("sh", Some(PathBuf::from("/opt/modules/default/init/sh")));
        assert_eq!(
            system.script(&commands),
            "set -e\n\
             . /opt/modules/default/init/sh\n\
             module unload PrgEnv-gnu PrgEnv-pgi\n\
             module swap gcc gcc/4.9.3\n\
             printf '%s\\0' __HPC_FORMULA_ENV__\n\
             env -0\n"
        );
    }

    #[test]
    fn test_parse_env_dump() {
        let stdout = "noise from module\n__HPC_FORMULA_ENV__\0PATH=/usr/bin\0CRAY_CPU=a=b\0";
        let env = parse_env_dump(stdout).unwrap();
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
        assert_eq!(env.get("CRAY_CPU").map(String::as_str), Some("a=b"));
        assert!(parse_env_dump("no marker").is_none());
    }

    #[test]
    fn test_tail_keeps_end() {
        let long = "x".repeat(MAX_FAILURE_OUTPUT) + "END";
        let kept = tail(&long);
        assert_eq!(kept.len(), MAX_FAILURE_OUTPUT);
        assert!(kept.ends_with("END"));
    }

    #[cfg(unix)]
    #[test]
    fn test_module_system_captures_env() {
        let system = ShellModuleSystem::new("sh", None);
        let env = system.apply(&ModuleCommandList::new()).unwrap();
        assert!(env.contains_key("PATH"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_tool_reports_status() {
        let failure = run_tool(
            "false",
            Command::new("sh").arg("-c").arg("echo boom >&2; exit 3"),
            &BuildEnv::new(),
        )
        .unwrap_err();
        assert_eq!(failure.status, Some(3));
        assert_eq!(failure.output, "boom");
    }
}
