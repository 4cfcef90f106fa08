//! Formula CLI - driver for the cluster software team
//!
//! Commands: formulas, lint, commands, render, install
//! Outputs JSON to stdout, logs to stderr
//! Returns 1 on usage/config errors, 2 on lint/render/install failure

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use hpc_formula::{
    config::{parse_var, Settings},
    Formula, FormulaRegistry, LintPolicy, Linter, Package,
};

#[derive(Parser)]
#[command(name = "formula-cli", version)]
#[command(about = "Build HPC libraries from formulas and generate their module files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of formula files; overrides the built-in formulas
    #[arg(short, long)]
    formulas_dir: Option<PathBuf>,

    /// Root of the module search path
    #[arg(short, long)]
    modulefiles_root: Option<PathBuf>,

    /// Script that defines the `module` shell function
    #[arg(long)]
    module_init: Option<PathBuf>,

    /// Parallel make jobs
    #[arg(short, long)]
    jobs: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available formulas
    Formulas,

    /// Check formulas for mistakes
    Lint {
        /// Formula name; all formulas when omitted
        #[arg(long)]
        formula: Option<String>,

        /// Treat warnings as failures
        #[arg(long)]
        pedantic: bool,
    },

    /// Show the module commands a build would run
    #[command(name = "commands")]
    ModuleCommands {
        #[arg(long)]
        formula: String,

        #[arg(long, default_value = "dev")]
        variant: String,

        /// Build identifier, e.g. sles11.3_gnu4.9.3
        #[arg(long, default_value = "")]
        build: String,
    },

    /// Render a module file
    Render {
        #[arg(long)]
        formula: String,

        #[arg(long, default_value = "dev")]
        version: String,

        /// Absolute install prefix
        #[arg(long)]
        prefix: PathBuf,

        /// Extra template value, KEY=VALUE
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Write under the modulefiles root instead of printing
        #[arg(long)]
        write: bool,
    },

    /// Fetch, build, and install a formula, then write its module file
    Install {
        #[arg(long)]
        formula: String,

        #[arg(long, default_value = "dev")]
        variant: String,

        /// Build identifier, e.g. sles11.3_gnu4.9.3
        #[arg(long, default_value = "")]
        build: String,

        /// Package version; the variant name when omitted
        #[arg(long)]
        version: Option<String>,

        /// Absolute install prefix
        #[arg(long)]
        prefix: PathBuf,

        /// Extra template value, KEY=VALUE
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
}

fn print_json<T: Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!(r#"{{"error": "Failed to serialize output: {}"}}"#, e);
            ExitCode::FAILURE
        }
    }
}

fn fail(code: u8, message: impl std::fmt::Display) -> ExitCode {
    let output = serde_json::json!({
        "success": false,
        "error": message.to_string(),
    });
    println!("{}", output);
    ExitCode::from(code)
}

fn settings(cli: &Cli) -> Result<Settings, String> {
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path).map_err(|e| e.to_string())?,
        None => Settings::default(),
    };
    if let Some(dir) = &cli.formulas_dir {
        settings.formulas_dir = Some(dir.clone());
    }
    if let Some(root) = &cli.modulefiles_root {
        settings.modulefiles_root = Some(root.clone());
    }
    if let Some(init) = &cli.module_init {
        settings.module_init = Some(init.clone());
    }
    if cli.jobs.is_some() {
        settings.make_jobs = cli.jobs;
    }
    Ok(settings)
}

fn lookup<'a>(registry: &'a FormulaRegistry, name: &str) -> Result<&'a Formula, ExitCode> {
    registry.require(name).map_err(|e| fail(1, e))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match settings(&cli) {
        Ok(s) => s,
        Err(e) => return fail(1, e),
    };

    // Load formulas
    let registry = match settings.registry() {
        Ok(r) => r,
        Err(e) => return fail(1, format!("Failed to load formulas: {}", e)),
    };

    match cli.command {
        Commands::Formulas => {
            let formulas: Vec<_> = registry
                .list()
                .iter()
                .map(|f| serde_json::json!({
                    "name": f.name,
                    "homepage": f.homepage,
                    "source": f.source.url,
                    "variants": f.variant_names(),
                }))
                .collect();
            print_json(&formulas)
        }

        Commands::Lint { formula, pedantic } => {
            let policy = if pedantic { LintPolicy::Pedantic } else { LintPolicy::Block };
            let linter = Linter::new(policy);

            let targets = match &formula {
                Some(name) => match lookup(&registry, name) {
                    Ok(f) => vec![f],
                    Err(code) => return code,
                },
                None => registry.list(),
            };

            let results: Vec<_> = targets.into_iter().map(|f| linter.check(f)).collect();
            let all_valid = results.iter().all(|r| r.valid);
            let code = print_json(&results);
            if all_valid {
                code
            } else {
                ExitCode::from(2)
            }
        }

        Commands::ModuleCommands { formula, variant, build } => {
            let formula = match lookup(&registry, &formula) {
                Ok(f) => f,
                Err(code) => return code,
            };
            match formula.module_commands(&variant, &build) {
                Some(commands) => print_json(&serde_json::json!({
                    "formula": formula.name,
                    "variant": variant,
                    "build": build,
                    "commands": commands,
                })),
                None => fail(1, format!("Unknown variant '{}' for formula {}", variant, formula.name)),
            }
        }

        Commands::Render { formula, version, prefix, vars, write } => {
            let formula = match lookup(&registry, &formula) {
                Ok(f) => f,
                Err(code) => return code,
            };
            let package = match Package::new(&formula.name, version, prefix) {
                Ok(p) => p,
                Err(e) => return fail(1, e),
            };
            let mut all_vars = settings.vars.clone();
            all_vars.extend(vars);

            let rendered = match formula.render_modulefile(&package, &all_vars) {
                Ok(r) => r,
                Err(e) => return fail(2, e),
            };

            if !write {
                return print_json(&serde_json::json!({
                    "success": true,
                    "sha256": rendered.sha256(),
                    "modulefile": rendered.text,
                }));
            }

            let Some(root) = &settings.modulefiles_root else {
                return fail(1, "--write needs a modulefiles root");
            };
            match rendered.write_to(root) {
                Ok(path) => print_json(&serde_json::json!({
                    "success": true,
                    "sha256": rendered.sha256(),
                    "path": path,
                })),
                Err(e) => fail(2, format!("Failed to write module file: {}", e)),
            }
        }

        Commands::Install { formula, variant, build, version, prefix, vars } => {
            let formula = match lookup(&registry, &formula) {
                Ok(f) => f,
                Err(code) => return code,
            };
            let version = version.unwrap_or_else(|| variant.clone());
            let package = match Package::new(&formula.name, version, prefix) {
                Ok(p) => p,
                Err(e) => return fail(1, e),
            };
            let mut all_vars = settings.vars.clone();
            all_vars.extend(vars);

            // Render first so a broken template never costs a build
            let rendered = match formula.render_modulefile(&package, &all_vars) {
                Ok(r) => r,
                Err(e) => return fail(2, e),
            };

            let pipeline = settings.pipeline();
            let mut report = match pipeline.install(formula, &package, &variant, &build) {
                Ok(r) => r,
                Err(e) => {
                    error!("Install of {} failed: {}", formula.name, e);
                    let output = serde_json::json!({
                        "success": false,
                        "step": e.step(),
                        "error": e.to_string(),
                    });
                    println!("{}", output);
                    return ExitCode::from(2);
                }
            };

            match &settings.modulefiles_root {
                Some(root) => {
                    let path = match rendered.write_to(root) {
                        Ok(p) => p,
                        Err(e) => return fail(2, format!("Failed to write module file: {}", e)),
                    };
                    info!("Wrote module file {}", path.display());
                    if let Err(e) = report.attach_modulefile(&rendered, path) {
                        return fail(2, e);
                    }
                    print_json(&serde_json::json!({ "success": true, "report": report }))
                }
                None => print_json(&serde_json::json!({
                    "success": true,
                    "report": report,
                    "modulefile": rendered.text,
                })),
            }
        }
    }
}
