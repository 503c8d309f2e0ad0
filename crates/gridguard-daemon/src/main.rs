//! gridguard - UPS-triggered shutdown orchestration for virtualization
//! hosts.
//!
//! The daemon monitors a UPS through NUT and, when battery thresholds are
//! crossed, executes the operator's phased shutdown plan across guests,
//! remote hosts, and the local host. When line power returns it replays
//! recovery commands in reverse to restart what was stopped.

mod config;
mod lock;
mod notify;
mod nut;
mod virt;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridguard_core::executor::ExecutorFactory;
use gridguard_core::journal::{Journal, SessionStatus};
use gridguard_core::monitor::{Monitor, UpsEvent, UpsEventKind};
use gridguard_core::orchestrator::{Notifier, Orchestrator, SessionSummary};
use gridguard_core::plan::{ExecMode, Plan};
use gridguard_core::recovery::Recovery;
use gridguard_core::stop::{stop_channel, StopController, StopSignal};
use gridguard_core::virt::VirtClient;
use secrecy::SecretString;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::lock::LockFile;
use crate::notify::{Webhook, WebhookNotifier};
use crate::nut::NutClient;
use crate::virt::{VirtApi, VirtApiConfig};

/// UPS-triggered graceful shutdown orchestrator.
#[derive(Parser, Debug)]
#[command(name = "gridguard", version, about, long_about = None)]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "/etc/gridguard/gridguard.yaml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor the UPS continuously and orchestrate on power events.
    Daemon,
    /// Execute the shutdown plan now and exit.
    Run {
        /// Trigger description recorded in the journal.
        #[arg(long, default_value = "manual run")]
        trigger: String,
    },
    /// Load and validate the configuration.
    Validate,
    /// Show the resolved execution plan without running it.
    Plan,
    /// Show the journalled session state.
    Status,
    /// Run a recovery pass now.
    Recover,
    /// Print version information.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Version needs no config file.
    if matches!(cli.command, Command::Version) {
        return cmd_version().map_or(ExitCode::FAILURE, |code| code);
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("gridguard: {e:#}");
            return ExitCode::from(2);
        },
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.options.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("gridguard: starting runtime: {e}");
            return ExitCode::FAILURE;
        },
    };

    let result = runtime.block_on(async {
        match cli.command {
            Command::Daemon => cmd_daemon(config).await,
            Command::Run { trigger } => cmd_run(config, &trigger).await,
            Command::Validate => cmd_validate(&config),
            Command::Plan => cmd_plan(&config),
            Command::Status => cmd_status(&config),
            Command::Recover => cmd_recover(config).await,
            Command::Version => cmd_version(),
        }
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        },
    }
}

/// Wires the configured collaborators: factory, notifier, journal.
struct Wiring {
    journal: Arc<Journal>,
    factory: ExecutorFactory,
    notifier: Arc<dyn Notifier>,
}

fn wire(config: &Config) -> Result<Wiring> {
    let journal = Arc::new(Journal::new(&config.options.state_file));
    journal
        .load()
        .context("loading journal; refusing to start with an unreadable journal")?;

    let factory = match &config.virt {
        Some(virt) => {
            let secret = match &virt.token_secret_env {
                Some(env) => SecretString::from(
                    std::env::var(env)
                        .with_context(|| format!("reading virt token secret from ${env}"))?,
                ),
                None => virt
                    .token_secret
                    .clone()
                    .unwrap_or_else(|| SecretString::from("")),
            };
            let client: Arc<dyn VirtClient> = Arc::new(VirtApi::new(&VirtApiConfig {
                api_url: virt.api_url.clone(),
                token_id: virt.token_id.clone(),
                token_secret: secret,
                insecure_tls: virt.insecure_tls,
            })?);
            ExecutorFactory::with_virt(client)
        },
        None => ExecutorFactory::new(),
    };

    let webhooks = config
        .notifications
        .iter()
        .map(|hook| Webhook {
            url: hook.url.clone(),
            url_env: hook.url_env.clone(),
            events: hook.events.clone(),
        })
        .collect();
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(webhooks)?);

    Ok(Wiring {
        journal,
        factory,
        notifier,
    })
}

/// Spawns SIGINT/SIGTERM forwarding onto the stop controller.
fn wire_signals(ctl: Arc<StopController>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        ctl.stop();
    });
    Ok(())
}

async fn cmd_daemon(config: Config) -> Result<ExitCode> {
    let _lock = LockFile::acquire(&config.options.lock_file)?;
    let wiring = wire(&config)?;
    let plan = Plan::resolve(&config.phase_specs(), &wiring.factory)?;
    info!(
        phases = plan.phases.len(),
        actions = plan.action_count(),
        dry_run = config.options.dry_run,
        "plan resolved"
    );

    let orchestrator = Orchestrator::new(
        plan,
        Arc::clone(&wiring.journal),
        Arc::clone(&wiring.notifier),
    );
    let recovery = Recovery::new(
        config.recovery_config(),
        Arc::clone(&wiring.journal),
        wiring.factory.clone(),
        Arc::clone(&wiring.notifier),
    );

    let (host, port) = config.nut_endpoint();
    let client = NutClient::new(host, port, &config.ups.name);
    let (monitor, mut streams) = Monitor::new(client, config.thresholds()?, config.options.poll_interval);

    let (ctl, mut stop) = stop_channel();
    let ctl = Arc::new(ctl);
    wire_signals(Arc::clone(&ctl))?;
    let monitor_task = tokio::spawn(monitor.run(ctl.signal()));

    // A journal carried over from a previous run means an interrupted
    // session; once we see the mains are healthy, recover before anything
    // else happens.
    let mut startup_recovery_pending = recovery.should_run();
    if startup_recovery_pending {
        warn!("journal holds an interrupted session; will recover once power is confirmed");
    }

    // Latched after the plan fires so battery events re-emitted on later
    // ticks do not retrigger it.
    let mut shutdown_triggered = wiring.journal.snapshot().status != SessionStatus::Idle;

    loop {
        tokio::select! {
            () = stop.stopped() => break,

            sample = streams.samples.recv() => {
                let Some(sample) = sample else { break };
                if startup_recovery_pending && sample.is_online() {
                    startup_recovery_pending = false;
                    run_recovery(&recovery, &ctl).await;
                    shutdown_triggered = wiring.journal.snapshot().status != SessionStatus::Idle;
                }
            },

            event = streams.events.recv() => {
                let Some(event) = event else {
                    error!("monitor stopped unexpectedly");
                    break;
                };

                if is_shutdown_trigger(&event) && !shutdown_triggered {
                    shutdown_triggered = true;
                    if config.options.dry_run {
                        warn!(trigger = %event.message, "dry-run: shutdown plan NOT executed");
                    } else {
                        match orchestrator.execute(&event.message, None, ctl.signal()).await {
                            Ok(summary) => log_summary(&summary),
                            Err(e) => error!(error = %e, "could not open shutdown session"),
                        }
                    }
                }

                if event.kind == UpsEventKind::PowerRestored {
                    startup_recovery_pending = false;
                    if recovery.should_run() {
                        run_recovery(&recovery, &ctl).await;
                        if wiring.journal.snapshot().status == SessionStatus::Idle {
                            shutdown_triggered = false;
                        }
                    } else if shutdown_triggered {
                        info!("power restored; recovery disabled or nothing to recover");
                    }
                }
            },
        }
    }

    ctl.stop();
    let _ = monitor_task.await;
    info!("daemon stopped");
    Ok(ExitCode::SUCCESS)
}

/// The plan fires on critical and emergency battery events, and whenever
/// the UPS itself raises its low-battery flag while on battery.
fn is_shutdown_trigger(event: &UpsEvent) -> bool {
    matches!(
        event.kind,
        UpsEventKind::CriticalBattery | UpsEventKind::Emergency
    ) || (event.sample.is_on_battery() && event.sample.is_low_battery())
}

async fn run_recovery(recovery: &Recovery, ctl: &Arc<StopController>) {
    let mut stop = ctl.signal();
    match recovery.execute(&mut stop).await {
        Ok(report) if report.errors() == 0 => {
            info!(recovered = report.recovered, "recovery finished");
        },
        Ok(report) => {
            error!(
                recovered = report.recovered,
                failed = report.failed,
                skipped = report.skipped,
                "recovery finished with errors; manual intervention required"
            );
        },
        Err(e) => warn!(error = %e, "recovery did not run"),
    }
}

fn log_summary(summary: &SessionSummary) {
    if summary.status == SessionStatus::Completed {
        info!(
            session_id = %summary.session_id,
            actions = summary.actions_run,
            failed = summary.actions_failed,
            "shutdown plan completed"
        );
    } else {
        error!(
            session_id = %summary.session_id,
            status = %summary.status,
            "shutdown plan did not complete"
        );
    }
}

async fn cmd_run(config: Config, trigger: &str) -> Result<ExitCode> {
    let _lock = LockFile::acquire(&config.options.lock_file)?;
    let wiring = wire(&config)?;
    let plan = Plan::resolve(&config.phase_specs(), &wiring.factory)?;

    if config.options.dry_run {
        println!("dry-run: plan not executed");
        return cmd_plan(&config);
    }

    let (ctl, _stop) = stop_channel();
    let ctl = Arc::new(ctl);
    wire_signals(Arc::clone(&ctl))?;

    let orchestrator = Orchestrator::new(
        plan,
        Arc::clone(&wiring.journal),
        Arc::clone(&wiring.notifier),
    );
    let summary = orchestrator.execute(trigger, None, ctl.signal()).await?;

    for action in wiring.journal.snapshot().completed_actions {
        let mark = if action.success { "ok " } else { "FAIL" };
        let detail = if action.success {
            String::new()
        } else {
            format!(" ({})", action.error)
        };
        println!(
            "[{mark}] {}.{} {}{detail}",
            action.phase_index + 1,
            action.action_index + 1,
            action.description
        );
    }
    println!(
        "plan {}: {} actions, {} failed, {:.1}s",
        summary.status,
        summary.actions_run,
        summary.actions_failed,
        summary.duration.as_secs_f64()
    );

    if summary.status == SessionStatus::Completed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(3))
    }
}

fn cmd_validate(config: &Config) -> Result<ExitCode> {
    let thresholds = config.thresholds()?;
    let actions: usize = config.phases.iter().map(|p| p.actions.len()).sum();

    println!("configuration OK");
    println!("  ups:      {}@{}", config.ups.name, config.ups.host);
    println!(
        "  levels:   warning {}% / critical {}% / emergency {}%",
        thresholds.warning(),
        thresholds.critical(),
        thresholds.emergency()
    );
    println!("  phases:   {}", config.phases.len());
    println!("  actions:  {actions}");
    println!(
        "  recovery: {}",
        if config.recovery.enabled { "enabled" } else { "disabled" }
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_plan(config: &Config) -> Result<ExitCode> {
    // Executors are built so descriptions match what would actually run;
    // no connections are opened.
    let wiring = wire(config)?;
    let plan = Plan::resolve(&config.phase_specs(), &wiring.factory)?;

    println!("execution plan:");
    for (i, phase) in plan.phases.iter().enumerate() {
        let mode = match phase.mode {
            ExecMode::Sequential => "sequential",
            ExecMode::Parallel => "parallel",
        };
        let timeout = phase
            .timeout
            .map(|t| format!(", timeout {}", humantime::format_duration(t)))
            .unwrap_or_default();
        println!("\nphase {}: {} ({mode}{timeout})", i + 1, phase.name);
        for (j, action) in phase.actions.iter().enumerate() {
            let recovery = if action.spec.has_recovery() {
                "  [recoverable]"
            } else {
                ""
            };
            println!("  {}.{} {}{recovery}", i + 1, j + 1, action.executor.describe());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(config: &Config) -> Result<ExitCode> {
    let journal = Journal::new(&config.options.state_file);
    journal.load()?;
    let state = journal.snapshot();

    println!("status:        {}", state.status);
    if !state.session_id.is_empty() {
        println!("session:       {}", state.session_id);
        println!("trigger:       {}", state.trigger_event);
        if let Some(started) = state.started_at {
            println!("started:       {started}");
        }
        println!(
            "progress:      phase {} action {}",
            state.current_phase + 1,
            state.current_action + 1
        );
        println!("completed:     {} actions", state.completed_actions.len());
        let failed = state.completed_actions.iter().filter(|a| !a.success).count();
        if failed > 0 {
            println!("failed:        {failed}");
        }
    }
    if !state.last_error.is_empty() {
        println!("last error:    {}", state.last_error);
    }
    if state.needs_recovery() {
        println!("recovery:      pending (run 'gridguard recover')");
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_version() -> Result<ExitCode> {
    println!("gridguard {}", env!("CARGO_PKG_VERSION"));
    Ok(ExitCode::SUCCESS)
}

async fn cmd_recover(config: Config) -> Result<ExitCode> {
    let _lock = LockFile::acquire(&config.options.lock_file)?;
    let wiring = wire(&config)?;

    let mut recovery_config = config.recovery_config();
    // An explicit recover command is the operator's decision; the config
    // toggle only gates the automatic path.
    recovery_config.enabled = true;

    let recovery = Recovery::new(
        recovery_config,
        Arc::clone(&wiring.journal),
        wiring.factory.clone(),
        Arc::clone(&wiring.notifier),
    );

    let (ctl, _stop) = stop_channel();
    let ctl = Arc::new(ctl);
    wire_signals(Arc::clone(&ctl))?;

    let mut stop: StopSignal = ctl.signal();
    let report = recovery.execute(&mut stop).await?;
    println!(
        "recovery: {} recovered, {} failed, {} skipped",
        report.recovered, report.failed, report.skipped
    );
    if report.errors() == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(3))
    }
}
