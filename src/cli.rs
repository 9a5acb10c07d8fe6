use crate::config::harness::HarnessConfig;
use crate::observability::metrics::HarnessMetrics;
use crate::runtime::environment::EnvironmentDefinition;
use crate::runtime::registry::RuntimeRegistry;
use crate::safety::janitor::Janitor;
use crate::safety::workspace::WorkspaceManager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Operator tools for the runbox execution harness", long_about = None)]
struct Cli {
    /// Harness configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Environment registry file (JSON), overriding the configured one
    #[arg(long, global = true)]
    registry: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the registered environments as JSON
    Languages,
    /// Check that every enabled environment's toolchain is installed
    CheckDeps {
        /// Show the version line reported by each probe
        #[arg(long)]
        verbose: bool,
    },
    /// Remove workspaces left behind by earlier runs
    Sweep {
        /// Minimum age in seconds; defaults to the configured stale age
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

extern "C" fn signal_handler(sig: libc::c_int) {
    // Only async-signal-safe calls here.
    let msg = b"runbox: signal received, exiting\n";
    // SAFETY: write and _exit are async-signal-safe; msg is a static buffer.
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + sig);
    }
}

fn setup_signal_handlers() {
    let handler = signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only makes async-signal-safe calls.
    unsafe {
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
}

fn load_config(path: Option<&PathBuf>, registry: Option<PathBuf>) -> Result<HarnessConfig> {
    let mut config = match path {
        Some(path) => HarnessConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    if registry.is_some() {
        config.registry_path = registry;
    }
    Ok(config)
}

pub fn run() -> Result<()> {
    setup_signal_handlers();
    env_logger::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.registry)?;

    match cli.command {
        Commands::Languages => {
            let registry = RuntimeRegistry::load(&config).context("loading environment registry")?;
            let definitions: Vec<&EnvironmentDefinition> = registry.definitions().collect();
            println!("{}", serde_json::to_string_pretty(&definitions)?);
            Ok(())
        }
        Commands::CheckDeps { verbose } => {
            let registry = RuntimeRegistry::load(&config).context("loading environment registry")?;
            check_dependencies(&registry, verbose)
        }
        Commands::Sweep { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.stale_workspace_age());
            let metrics = Arc::new(HarnessMetrics::new());
            let janitor = Janitor::spawn(Arc::clone(&metrics))?;
            let workspaces = WorkspaceManager::new(&config, janitor, metrics)?;
            let removed = workspaces.sweep_stale(max_age)?;
            println!(
                "Removed {} stale workspaces from {}",
                removed,
                workspaces.base_dir().display()
            );
            Ok(())
        }
    }
}

/// First line of a probe's output, falling back to stderr (`java -version`).
fn probe(argv: &[String]) -> std::result::Result<String, String> {
    let (program, args) = argv.split_first().ok_or_else(|| "empty probe".to_string())?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|_| "NOT FOUND".to_string())?;
    if !output.status.success() {
        return Err("FAILED".to_string());
    }
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    Ok(text.lines().next().unwrap_or("").trim().to_string())
}

fn check_dependencies(registry: &RuntimeRegistry, verbose: bool) -> Result<()> {
    println!("Checking language dependencies...");
    println!();

    let mut missing = Vec::new();
    for environment in registry.definitions().filter(|env| env.enabled) {
        let mut ok = true;
        let mut lines = Vec::new();
        for argv in &environment.probes {
            let command = argv.first().map(String::as_str).unwrap_or("?");
            match probe(argv) {
                Ok(version) => lines.push(format!("  {} -> {}", command, version)),
                Err(reason) => {
                    ok = false;
                    lines.push(format!("  {} -> {}", command, reason));
                }
            }
        }

        let verdict = if ok { "OK" } else { "MISSING" };
        println!("{} ({}) - {}", environment.display_name(), environment.language, verdict);
        if verbose {
            for line in &lines {
                println!("{}", line);
            }
            println!();
        }
        if !ok {
            missing.push(environment.language.clone());
        }
    }

    println!();
    if missing.is_empty() {
        println!("All language dependencies are installed");
        Ok(())
    } else {
        anyhow::bail!("missing language dependencies: {}", missing.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["runbox", "check-deps", "--verbose", "--registry", "/etc/runbox/envs.json"])
            .unwrap();
        assert_eq!(cli.registry, Some(PathBuf::from("/etc/runbox/envs.json")));
        assert!(matches!(cli.command, Commands::CheckDeps { verbose: true }));
    }

    #[test]
    fn test_probe_reports_missing_binaries() {
        assert_eq!(
            probe(&["runbox-no-such-binary".to_string()]),
            Err("NOT FOUND".to_string())
        );
        assert_eq!(probe(&["/bin/false".to_string()]), Err("FAILED".to_string()));
        assert_eq!(
            probe(&["/bin/sh".to_string(), "-c".to_string(), "echo v1.2; echo more".to_string()]),
            Ok("v1.2".to_string())
        );
    }

    #[test]
    fn test_registry_flag_overrides_config() {
        let config = load_config(None, Some(PathBuf::from("/tmp/envs.json"))).unwrap();
        assert_eq!(config.registry_path, Some(PathBuf::from("/tmp/envs.json")));
        assert!(load_config(None, None).unwrap().registry_path.is_none());
    }
}
