use clap::{Args as ClapArgs, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use machine_sync_server::db::{JsonFileStore, MachineStore};
use machine_sync_server::model::Machine;
use machine_sync_server::server::config::SyncConfig;
use machine_sync_server::server::reconciler::parse_machine_id;
use machine_sync_server::server::{ActionOutcome, Phase, ReconcileError, Reconciler, SshExecutor};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile every configured machine until interrupted
    Run,
    /// Refresh the recorded process state of one machine
    Sync { machine: String },
    /// Run a single reconciliation pass on one machine
    Cycle { machine: String },
    /// Pull the latest sources of a service
    Pull(ServiceArgs),
    /// Install dependencies and build a service's frontend
    Build(ServiceArgs),
    /// Run a service's backend tests
    Deploy(ServiceArgs),
    /// Start a service
    Start(ServiceArgs),
    /// Stop a service
    Stop(ServiceArgs),
}

#[derive(ClapArgs, Debug)]
struct ServiceArgs {
    /// Machine id, `owner/name`
    machine: String,
    /// Service number within the machine
    no: i32,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "machine-sync.log");
    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .json();

    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

fn print_machine(machine: &Machine) {
    println!("{} ({})", machine.id(), machine.ip);
    println!(
        "{:>4}  {:<20} {:<8} {:<12} {:<8} {:>7}",
        "NO", "NAME", "STATUS", "SUB-STATUS", "EXPECTED", "PID"
    );
    for service in machine.services.values() {
        println!(
            "{:>4}  {:<20} {:<8} {:<12} {:<8} {:>7}",
            service.no,
            service.name,
            service.status.to_string(),
            service.sub_status.to_string(),
            service.expected_status.to_string(),
            service.process_id
        );
        if !service.message.is_empty() {
            println!("      {}", service.message.trim());
        }
    }
}

fn print_outcomes(outcomes: &[ActionOutcome]) {
    for outcome in outcomes {
        match &outcome.result {
            Ok(()) => println!("{} {:?}: ok", outcome.service, outcome.action),
            Err(e) => println!("{} {:?}: {}", outcome.service, outcome.action, e),
        }
    }
}

async fn reconcile_once(reconciler: &Reconciler, machine_id: &str) {
    let machine = match reconciler.sync_observed_state(machine_id).await {
        Ok(machine) => machine,
        Err(e) => {
            warn!(machine = %machine_id, error = %e, "Skipping pass, could not observe machine.");
            return;
        }
    };
    match reconciler.run_one_cycle(&machine).await {
        Ok(report) => {
            let failed = report.actions.iter().filter(|a| a.result.is_err()).count();
            info!(
                machine = %machine_id,
                actions = report.actions.len(),
                failed,
                "Reconciliation pass finished."
            );
        }
        Err(e) => error!(machine = %machine_id, error = %e, "Reconciliation pass failed."),
    }
}

async fn reconcile_loop(
    reconciler: Reconciler,
    machine_id: String,
    period: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(machine = %machine_id, period_secs = period.as_secs(), "Reconcile loop started.");

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!(machine = %machine_id, "Shutdown signal received, stopping reconcile loop.");
                break;
            }
            _ = ticker.tick() => {
                reconcile_once(&reconciler, &machine_id).await;
            }
        }
    }
}

async fn run_daemon(
    reconciler: Reconciler,
    store: Arc<dyn MachineStore>,
    config: &SyncConfig,
) -> Result<(), BoxError> {
    let machine_ids = if config.machines.is_empty() {
        store.list_machine_ids().await?
    } else {
        config.machines.clone()
    };
    if machine_ids.is_empty() {
        warn!("No machines to reconcile.");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let handles: Vec<_> = machine_ids
        .into_iter()
        .map(|id| {
            tokio::spawn(reconcile_loop(
                reconciler.clone(),
                id,
                config.poll_interval(),
                shutdown_rx.clone(),
            ))
        })
        .collect();

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down.");
    // Receivers observe the send as a change.
    let _ = shutdown_tx.send(());

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Reconcile loop panicked.");
        }
    }
    Ok(())
}

async fn run_manual_phase(
    reconciler: &Reconciler,
    phase: Phase,
    args: &ServiceArgs,
) -> Result<(), BoxError> {
    parse_machine_id(&args.machine)?;
    let machine = reconciler.load_machine(&args.machine).await?;
    let service = machine
        .service(args.no)
        .cloned()
        .ok_or_else(|| format!("Service {} not found on machine {}", args.no, args.machine))?;

    let result = reconciler.run_phase(phase, &machine, &service).await;
    let machine = reconciler.load_machine(&args.machine).await?;
    print_machine(&machine);
    result.map_err(Into::into)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let config = SyncConfig::load(args.config.as_deref())?;
    init_logging(&config.log_dir);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting machine-sync.");

    let store: Arc<dyn MachineStore> = Arc::new(JsonFileStore::in_dir(&config.data_dir));
    let executor = Arc::new(SshExecutor::new(
        config.ssh_program.clone(),
        config.sshpass_program.clone(),
        config.command_timeout(),
    ));
    let reconciler = Reconciler::new(store.clone(), executor, config.command_layout());

    let outcome: Result<(), BoxError> = match &args.command {
        Command::Run => run_daemon(reconciler, store, &config).await,
        Command::Sync { machine } => {
            parse_machine_id(machine)?;
            let machine = reconciler.sync_observed_state(machine).await?;
            print_machine(&machine);
            Ok(())
        }
        Command::Cycle { machine } => {
            parse_machine_id(machine)?;
            let snapshot = reconciler.sync_observed_state(machine).await?;
            match reconciler.run_one_cycle(&snapshot).await {
                Ok(report) => {
                    print_outcomes(&report.actions);
                    print_machine(&report.machine);
                    Ok(())
                }
                Err(ReconcileError::CycleIncomplete { actions, source }) => {
                    print_outcomes(&actions);
                    Err(source.into())
                }
                Err(e) => Err(e.into()),
            }
        }
        Command::Pull(service) => run_manual_phase(&reconciler, Phase::Pull, service).await,
        Command::Build(service) => run_manual_phase(&reconciler, Phase::Build, service).await,
        Command::Deploy(service) => run_manual_phase(&reconciler, Phase::Deploy, service).await,
        Command::Start(service) => run_manual_phase(&reconciler, Phase::Start, service).await,
        Command::Stop(service) => run_manual_phase(&reconciler, Phase::Stop, service).await,
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Command failed.");
    }
    outcome
}
