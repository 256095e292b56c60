mod demo;
mod exit_codes;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use phasegate_core::config::AppConfig;
use phasegate_core::error::PhasegateError;
use phasegate_core::gate::VoteDecision;
use phasegate_core::types::{RunId, RunStatus};
use phasegate_engine::audit::verify_audit_lines;
use phasegate_engine::checkpoint::verify_file;
use phasegate_engine::{AuditFilter, AuditKind, DagDefinition, Orchestrator};
use phasegate_gateway::GatewayServer;

const DEFAULT_CONFIG: &str = "phasegate.toml";

#[derive(Parser)]
#[command(
    name = "phasegate",
    version,
    about = "Phase-gated DAG orchestrator with human review gates"
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Override a config option, e.g. `--set budget.run_cost_cap=25` (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run and drive it until it completes or waits on a gate
    Run {
        /// DAG definition file (TOML or JSON)
        #[arg(long)]
        target: PathBuf,
        /// JSON file with the initial run context
        #[arg(long)]
        input: Option<PathBuf>,
        /// Inline JSON object merged over --input
        #[arg(long)]
        inputs: Option<String>,
        /// Run id (generated if not provided)
        #[arg(long)]
        run_id: Option<String>,
        /// Seed recorded for reproducibility
        #[arg(long)]
        seed: Option<u64>,
        /// Auto-resolve review gates
        #[arg(long)]
        no_hrg: bool,
    },
    /// Show a run's status
    Status {
        #[arg(long)]
        run_id: String,
    },
    /// Verify a run's checkpoint and audit chains
    Audit {
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        run_id: Option<String>,
        /// Verify a checkpoints.jsonl or audit.jsonl file directly
        #[arg(long)]
        file: Option<PathBuf>,
        /// Also print audit entries
        #[arg(long)]
        entries: bool,
        /// Only print entries of this kind (e.g. vote_cast)
        #[arg(long, requires = "entries")]
        kind: Option<String>,
    },
    /// Cast a vote on a review gate, then continue its run
    Vote {
        /// Gate id or unique prefix
        #[arg(long)]
        gate: String,
        #[arg(long)]
        voter: String,
        /// approve | reject | modify
        #[arg(long)]
        decision: String,
        /// JSON amendment for `modify`
        #[arg(long)]
        amendment: Option<String>,
    },
    /// Resume a paused run
    Resume {
        #[arg(long)]
        run_id: String,
    },
    /// Pause a run at the next transition
    Pause {
        #[arg(long)]
        run_id: String,
    },
    /// Kill a run immediately
    Kill {
        #[arg(long)]
        run_id: String,
    },
    /// Start the HTTP gateway and the gate SLA ticker
    Serve,
    /// Run the eight-phase demo pipeline with scripted approvals
    Demo,
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { exit_codes::USAGE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_codes::for_error(&e))
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "phasegate", &mut std::io::stdout());
        return Ok(0);
    }

    let mut config = load_config(&cli.config)?;
    config.apply_env_overrides(std::env::vars())?;
    for raw in &cli.overrides {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| PhasegateError::Config(format!("--set expects KEY=VALUE, got {}", raw)))?;
        config.set_option(key, value)?;
    }
    match &cli.command {
        Commands::Run { seed, no_hrg, .. } => {
            if let Some(seed) = seed {
                config.orchestration.seed = Some(*seed);
            }
            if *no_hrg {
                config.hrg.enabled = false;
            }
        }
        Commands::Demo => demo::prepare(&mut config),
        _ => {}
    }
    config.validate()?;
    init_tracing(&config.observability.log_format);

    if let Commands::Config = cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(0);
    }

    let orchestrator = Arc::new(Orchestrator::builder(Arc::new(config)).build()?);

    match cli.command {
        Commands::Run {
            target,
            input,
            inputs,
            run_id,
            ..
        } => {
            let definition = DagDefinition::load(&target)?;
            let context = initial_context(input.as_deref(), inputs.as_deref())?;
            let run_id = match run_id {
                Some(id) => {
                    orchestrator
                        .start_run_with_id(RunId::parse(&id)?, definition, context)
                        .await?
                }
                None => orchestrator.start_run(definition, context).await?,
            };
            info!(run_id = %run_id, "Run started");
            let status = drive(&orchestrator, &run_id).await?;
            report(&orchestrator, &run_id, status).await
        }
        Commands::Status { run_id } => {
            let view = orchestrator.status(&RunId::parse(&run_id)?).await?;
            print_json(&view)?;
            Ok(exit_codes::for_status(view.status))
        }
        Commands::Audit {
            run_id,
            file,
            entries,
            kind,
        } => audit(&orchestrator, run_id, file, entries, kind),
        Commands::Vote {
            gate,
            voter,
            decision,
            amendment,
        } => {
            let amendment = amendment
                .map(|a| serde_json::from_str(&a))
                .transpose()
                .context("--amendment must be JSON")?;
            let decision = VoteDecision::parse(&decision, amendment)
                .ok_or_else(|| anyhow::anyhow!("unknown decision: {}", decision))?;

            let (run_id, gate_id) = orchestrator.locate_gate(&gate)?;
            orchestrator.recover(&run_id).await?;

            let gate_status = orchestrator.cast_vote(&gate_id, &voter, decision).await?;
            info!(gate_id = %gate_id, voter = %voter, status = ?gate_status, "Vote recorded");
            let status = drive(&orchestrator, &run_id).await?;
            report(&orchestrator, &run_id, status).await
        }
        Commands::Resume { run_id } => {
            let run_id = RunId::parse(&run_id)?;
            orchestrator.recover(&run_id).await?;
            orchestrator.resume(&run_id).await?;
            let status = drive(&orchestrator, &run_id).await?;
            report(&orchestrator, &run_id, status).await
        }
        Commands::Pause { run_id } => {
            let run_id = RunId::parse(&run_id)?;
            orchestrator.recover(&run_id).await?;
            let status = orchestrator.pause(&run_id).await?;
            report(&orchestrator, &run_id, status).await
        }
        Commands::Kill { run_id } => {
            let run_id = RunId::parse(&run_id)?;
            orchestrator.recover(&run_id).await?;
            let status = orchestrator.kill(&run_id).await?;
            report(&orchestrator, &run_id, status).await
        }
        Commands::Serve => serve(orchestrator).await.map(|_| 0),
        Commands::Demo => demo::run(orchestrator).await,
        Commands::Config | Commands::Completions { .. } => Ok(0),
    }
}

fn init_tracing(log_format: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("phasegate=info,warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    if path == Path::new(DEFAULT_CONFIG) {
        // No file: defaults plus environment and --set overrides.
        return Ok(AppConfig::default());
    }
    Err(PhasegateError::ConfigNotFound(path.display().to_string()).into())
}

fn initial_context(input: Option<&Path>, inline: Option<&str>) -> anyhow::Result<serde_json::Value> {
    let mut context = match input {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => serde_json::json!({}),
    };
    if let Some(inline) = inline {
        let overlay: serde_json::Value =
            serde_json::from_str(inline).context("--inputs must be a JSON object")?;
        match (context.as_object_mut(), overlay) {
            (Some(base), serde_json::Value::Object(overlay)) => base.extend(overlay),
            (_, overlay) => context = overlay,
        }
    }
    Ok(context)
}

/// Advance a run, killing it on Ctrl-C.
async fn drive(orchestrator: &Orchestrator, run_id: &RunId) -> anyhow::Result<RunStatus> {
    let advance = orchestrator.advance(run_id);
    tokio::pin!(advance);
    tokio::select! {
        status = &mut advance => return Ok(status?),
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted, killing run");
        }
    }
    // Keep polling advance so it observes the kill and releases the run.
    let (status, killed) = tokio::join!(advance, orchestrator.kill(run_id));
    if let Err(e) = killed {
        warn!(run_id = %run_id, error = %e, "Kill after interrupt failed");
    }
    Ok(status?)
}

async fn report(orchestrator: &Orchestrator, run_id: &RunId, status: RunStatus) -> anyhow::Result<u8> {
    let view = orchestrator.status(run_id).await?;
    print_json(&view)?;
    if status == RunStatus::Paused {
        for gate in &view.open_gates {
            eprintln!(
                "Waiting on gate {} ({}) until {}",
                gate.gate_id, gate.node_id, gate.sla_deadline
            );
        }
    }
    Ok(exit_codes::for_status(status))
}

fn audit(
    orchestrator: &Orchestrator,
    run_id: Option<String>,
    file: Option<PathBuf>,
    entries: bool,
    kind: Option<String>,
) -> anyhow::Result<u8> {
    let valid = if let Some(path) = file {
        let report = if path.file_name().is_some_and(|n| n == "audit.jsonl") {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            verify_audit_lines(&text)
        } else {
            verify_file(&path)?
        };
        print_json(&report)?;
        report.is_valid()
    } else {
        let run_id = RunId::parse(run_id.as_deref().unwrap_or_default())?;
        let store = orchestrator.store();
        let checkpoints = store.verify_chain(&run_id)?;
        let audit = store.verify_audit(&run_id)?;
        let valid = checkpoints.is_valid() && audit.is_valid();
        let mut doc = serde_json::json!({
            "run_id": run_id,
            "valid": valid,
            "checkpoints": checkpoints,
            "audit": audit,
        });
        if entries {
            let kind: Option<AuditKind> = kind
                .map(|k| serde_json::from_value(serde_json::Value::String(k)))
                .transpose()
                .context("unknown audit kind")?;
            let filter = AuditFilter {
                kind,
                ..Default::default()
            };
            doc["entries"] = serde_json::to_value(store.query_audit(&run_id, &filter)?)?;
        }
        print_json(&doc)?;
        valid
    };
    Ok(if valid { 0 } else { exit_codes::CHAIN_INTEGRITY })
}

async fn recover_all(orchestrator: &Orchestrator) {
    for (run_id, result) in orchestrator.recover_all().await {
        if let Err(e) = result {
            warn!(run_id = %run_id, error = %e, "Run not recovered");
        }
    }
}

/// Spawn a background advance for every loaded run that is not terminal.
async fn advance_open_runs(orchestrator: &Arc<Orchestrator>) {
    let Ok(runs) = orchestrator.list_runs() else {
        return;
    };
    for run_id in runs {
        if !orchestrator.is_loaded(&run_id) {
            continue;
        }
        match orchestrator.snapshot(&run_id).await {
            Ok(snapshot) if !snapshot.status.is_terminal() => {}
            _ => continue,
        }
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.advance(&run_id).await {
                warn!(run_id = %run_id, error = %e, "Advance failed");
            }
        });
    }
}

async fn serve(orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    recover_all(&orchestrator).await;
    advance_open_runs(&orchestrator).await;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        cancel_clone.cancel();
    });

    // SLA ticker
    let ticker = orchestrator.clone();
    let tick_cancel = cancel.clone();
    let interval_ms = ticker.config().orchestration.tick_interval_ms.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            tokio::select! {
                _ = tick_cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match ticker.tick().await {
                Ok(0) => {}
                Ok(resolved) => {
                    info!(resolved, "Gate SLA sweep resolved gates");
                    advance_open_runs(&ticker).await;
                }
                Err(e) => warn!(error = %e, "Gate SLA sweep failed"),
            }
        }
    });

    let gateway_config = orchestrator.config().gateway.clone().unwrap_or_default();
    info!(bind = %gateway_config.bind, "Starting gateway");
    GatewayServer::new(gateway_config, orchestrator).run(cancel).await
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
