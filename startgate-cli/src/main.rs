//! startgate - container entrypoint
//!
//! Without a subcommand this runs the startup sequence and hands the process
//! over to the server. The subcommands are the container's other entrypoints:
//! the health check, the privilege gate and build planning.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::unistd::{getuid, User};
use startgate::bootstrap::{BootstrapOrchestrator, StartupFlags};
use startgate::cancellation::{cancel_on_termination, CancellationToken};
use startgate::config::StartupConfig;
use startgate::core::{EXIT_CONFIG, EXIT_PRIVILEGE_DENIED};
use startgate::errors::PrivilegeError;
use startgate::events::LoggingEventSink;
use startgate::graph::{resolve, service_image_family, BuildGraphBuilder, BuildGraphDefinition};
use startgate::health::{check_with_timeout, HttpHealthChecker};
use startgate::observability::{init_tracing, LogFormat};
use startgate::privilege::{AllowList, PrivilegeGate, PrivilegedCommand};
use startgate::process::{LaunchOutcome, ProcessExecutor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

/// startgate - readiness-gated container startup
#[derive(Parser, Debug)]
#[command(name = "startgate")]
#[command(version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Run one-time provisioning (database, keys, admin user) before starting
    #[arg(long)]
    with_bootstrap: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe the server's status endpoint once; exit 0 when healthy
    Healthcheck {
        /// Status URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,
    },

    /// Run an allow-listed command as root
    RunAsRoot {
        /// Program to run
        program: String,

        /// Arguments, passed through unchanged
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the resolved build order and a stage's image contents as JSON
    BuildPlan {
        /// Graph definition file (defaults to the built-in image family)
        #[arg(long)]
        graph: Option<PathBuf>,

        /// Stage to plan for (defaults to the whole graph)
        #[arg(long)]
        target: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        None => start(StartupFlags {
            with_bootstrap: cli.with_bootstrap,
        })
        .await,
        Some(Commands::Healthcheck { url }) => healthcheck(url).await,
        Some(Commands::RunAsRoot { program, args }) => run_as_root(program, args).await,
        Some(Commands::BuildPlan { graph, target }) => {
            install_logging("warn", LogFormat::Text);
            match build_plan(graph, target.as_deref()) {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("startgate: {e:#}");
                    1
                }
            }
        }
    };
    std::process::exit(code);
}

/// Installs the subscriber, reporting a failure on stderr. Returns whether
/// the subscriber is now installed.
fn install_logging(level: &str, format: LogFormat) -> bool {
    match init_tracing(level, format) {
        Ok(()) => true,
        Err(e) => {
            eprintln!("startgate: logging setup failed: {e}");
            false
        }
    }
}

/// Loads the configuration and installs logging according to it.
fn load_config() -> Result<StartupConfig, i32> {
    match StartupConfig::load() {
        Ok(config) => {
            install_logging(&config.log_level, config.log_format);
            Ok(config)
        }
        Err(e) => {
            install_logging("info", LogFormat::Text);
            error!(error = %e, "Invalid configuration");
            Err(EXIT_CONFIG)
        }
    }
}

async fn start(flags: StartupFlags) -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };

    let cancel = Arc::new(CancellationToken::new());
    if let Err(e) = cancel_on_termination(cancel.clone()) {
        warn!(error = %e, "Could not install termination handlers");
    }

    let orchestrator = match BootstrapOrchestrator::for_config(Arc::new(config)) {
        Ok(orchestrator) => orchestrator.with_cancellation(cancel),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return EXIT_CONFIG;
        }
    };

    match orchestrator.run_startup_sequence(flags).await {
        Ok(LaunchOutcome::HandedOff) => 0,
        Ok(LaunchOutcome::Exited(code)) => code,
        Err(failure) => failure.exit_code(),
    }
}

async fn healthcheck(url: Option<String>) -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };
    let url = url.unwrap_or_else(|| config.healthcheck_url.clone());

    let checker = match HttpHealthChecker::new(&url, config.health.timeout) {
        Ok(checker) => checker,
        Err(e) => {
            eprintln!("unhealthy: {e}");
            return 1;
        }
    };
    match check_with_timeout(&checker, config.health.timeout).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("unhealthy: {url}: {e}");
            1
        }
    }
}

async fn run_as_root(program: String, args: Vec<String>) -> i32 {
    let config = match load_config() {
        Ok(config) => config,
        Err(code) => return code,
    };

    let uid = getuid();
    let invoker = match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        Ok(None) | Err(_) => uid.to_string(),
    };

    let gate = PrivilegeGate::new(
        Arc::new(AllowList::default_for(&config.service_user)),
        Arc::new(ProcessExecutor),
        Arc::new(LoggingEventSink::default()),
    );
    let command = PrivilegedCommand::new(program, args);

    match gate.run_as_root(&invoker, &command).await {
        Ok(output) => {
            print!("{}", output.stdout);
            0
        }
        Err(e) if e.is_denial() => {
            eprintln!("startgate: {e}");
            EXIT_PRIVILEGE_DENIED
        }
        Err(PrivilegeError::NonZeroExit { code, stderr, .. }) => {
            eprint!("{stderr}");
            code.unwrap_or(1)
        }
        Err(e) => {
            eprintln!("startgate: {e}");
            1
        }
    }
}

fn build_plan(graph: Option<PathBuf>, target: Option<&str>) -> Result<()> {
    let definition = match &graph {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            BuildGraphDefinition::from_json(&json)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => service_image_family(),
    };

    let order = resolve(&definition).map_err(|e| {
        let info = e.info();
        anyhow::anyhow!("{} {}{}", info.code, info.summary, hint(info.fix_hint.as_deref()))
    })?;
    let name = definition.name.clone();
    let graph = BuildGraphBuilder::from_definition(definition).build()?;

    let plan = match target {
        Some(stage) => {
            if graph.stage(stage).is_none() {
                bail!("unknown stage '{stage}'");
            }
            serde_json::json!({
                "graph": name,
                "target": stage,
                "order": graph.plan(stage)?,
                "image": graph.image(stage)?,
            })
        }
        None => serde_json::json!({"graph": name, "order": order}),
    };
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn hint(fix_hint: Option<&str>) -> String {
    fix_hint.map(|h| format!(" ({h})")).unwrap_or_default()
}
