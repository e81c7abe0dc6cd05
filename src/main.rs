use anyhow::Result;
use clap::{Parser, Subcommand};
use fixgate::action::ActionSet;
use fixgate::config::Config;
use fixgate::coordinator::{Coordinator, CycleReport};
use fixgate::daemon::{self, Daemon, DaemonExit};
use fixgate::ledger::Ledger;
use fixgate::ops::{Category, OperationType};
use fixgate::project;
use fixgate::safety::SafetyGate;
use fixgate::store::StateStore;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

// Exit codes are part of the scripting surface: cron jobs and CI wrappers
// branch on them.
const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_SKIPPED: u8 = 2;
const EXIT_VETOED: u8 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "fixgate",
    about = "Gates repeated automated maintenance fixes on a source tree",
    version
)]
struct Cli {
    /// Path to the tracked tree (defaults to current directory)
    #[arg(long, default_value = ".", global = true)]
    repo: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the state directory and a default config
    Init,
    /// Run one gated cycle now
    Cycle {
        /// Restrict to one category: correctness, style, or hygiene
        #[arg(long)]
        category: Option<String>,
    },
    /// Ask whether an operation would run, without running anything
    ShouldRun {
        /// Operation key, e.g. lint-fix
        operation: String,
    },
    /// Record an externally performed run of an operation
    Record {
        /// Operation key, e.g. format-fix
        operation: String,
        /// The run succeeded
        #[arg(long, conflicts_with = "failure")]
        success: bool,
        /// The run failed
        #[arg(long)]
        failure: bool,
        /// How many items the run touched
        #[arg(long, default_value_t = 0)]
        items: u32,
        /// Free-form note stored with the record
        #[arg(long)]
        note: Option<String>,
    },
    /// Show per-operation history and lifetime statistics
    Stats,
    /// Control the background scheduler
    Daemon {
        #[command(subcommand)]
        action: DaemonCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Run the scheduler loop in the foreground until stopped
    Run,
    /// Ask a running scheduler to wind down
    Stop,
    /// Report whether a scheduler is running and what it has done
    Status,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    let root = cli.repo.canonicalize()?;
    let store = StateStore::new(&root);

    match cli.command {
        Command::Init => {
            store.init()?;
            let config_path = store.state_dir().join(fixgate::config::CONFIG_FILE);
            if !config_path.exists() {
                Config::default().save(store.state_dir())?;
            }
            println!("initialized {}", store.state_dir().display());
            Ok(EXIT_OK)
        }
        Command::Cycle { category } => {
            let category = category.as_deref().map(str::parse::<Category>).transpose()?;
            let config = Config::load(store.state_dir());
            let project = project::detect_project_type(&root);
            let gate = SafetyGate::builtin(project, &config);
            let actions =
                ActionSet::for_project(project, &config.commands, config.action_timeout());
            let coordinator = Coordinator::new(&root, &config, &store, gate, actions);

            let report = coordinator.run_cycle(category)?;
            print_cycle_report(&report);
            Ok(cycle_exit_code(&report))
        }
        Command::ShouldRun { operation } => {
            let operation: OperationType = operation.parse()?;
            let config = Config::load(store.state_dir());
            let coordinator = Coordinator::new(
                &root,
                &config,
                &store,
                SafetyGate::new(Vec::new()),
                ActionSet::empty(),
            );
            let decision = coordinator.preview(operation)?;
            let verb = if decision.should_run { "run" } else { "skip" };
            println!("{}: {} ({})", operation, verb, decision.reason.label());
            Ok(if decision.should_run { EXIT_OK } else { EXIT_SKIPPED })
        }
        Command::Record {
            operation,
            success,
            failure,
            items,
            note,
        } => {
            if success == failure {
                anyhow::bail!("pass exactly one of --success or --failure");
            }
            let operation: OperationType = operation.parse()?;
            let config = Config::load(store.state_dir());
            let coordinator = Coordinator::new(
                &root,
                &config,
                &store,
                SafetyGate::new(Vec::new()),
                ActionSet::empty(),
            );
            coordinator.record_external(operation, success, items, note)?;
            println!(
                "recorded {} {}",
                operation,
                if success { "success" } else { "failure" }
            );
            Ok(EXIT_OK)
        }
        Command::Stats => {
            let config = Config::load(store.state_dir());
            print_stats(&store.load_ledger(), &config);
            Ok(EXIT_OK)
        }
        Command::Daemon { action } => match action {
            DaemonCommand::Run => match Daemon::run(&root)? {
                DaemonExit::Stopped => Ok(EXIT_OK),
                DaemonExit::AlreadyRunning => {
                    println!("a daemon is already running for {}", root.display());
                    Ok(EXIT_OK)
                }
            },
            DaemonCommand::Stop => {
                daemon::request_stop(&root)?;
                println!("stop requested");
                Ok(EXIT_OK)
            }
            DaemonCommand::Status => {
                let config = Config::load(store.state_dir());
                print_daemon_status(&root, &config);
                Ok(EXIT_OK)
            }
        },
    }
}

fn cycle_exit_code(report: &CycleReport) -> u8 {
    if report.vetoed() {
        return EXIT_VETOED;
    }
    if report.ran_count() == 0 {
        return EXIT_SKIPPED;
    }
    let all_succeeded = report
        .operations
        .iter()
        .filter_map(|op| op.outcome.as_ref())
        .all(|outcome| outcome.success);
    if all_succeeded {
        EXIT_OK
    } else {
        EXIT_ERROR
    }
}

fn print_cycle_report(report: &CycleReport) {
    println!(
        "cycle {} [{}] safety {:.2}{}",
        report.cycle_id,
        report
            .category
            .map(|c| c.key())
            .unwrap_or("all categories"),
        report.safety.score,
        if report.degraded() { " (degraded)" } else { "" }
    );

    if report.vetoed() {
        for check in report.safety.checks.iter().filter(|c| !c.passed) {
            println!(
                "  failed check: {} ({})",
                check.name,
                check.detail.as_deref().unwrap_or("no detail")
            );
        }
        println!("vetoed: no operations were run");
        return;
    }

    for op in &report.operations {
        match &op.outcome {
            Some(outcome) => println!(
                "  {} ran: {} ({} item(s)){}",
                op.operation,
                if outcome.success { "ok" } else { "failed" },
                outcome.items_affected,
                outcome
                    .note
                    .as_deref()
                    .map(|n| format!(": {}", n))
                    .unwrap_or_default()
            ),
            None => println!("  {} skipped: {}", op.operation, op.decision.reason.label()),
        }
    }
}

fn print_stats(ledger: &Ledger, config: &Config) {
    for operation in OperationType::all() {
        let stats = ledger.stats(operation);
        if stats.total_attempts == 0 {
            println!("{:<18} never attempted", operation.key());
            continue;
        }
        let rate = match stats.success_rate(config.min_samples) {
            Some(rate) => format!("{:.0}%", rate * 100.0),
            None => format!(
                "optimistic ({}/{} samples)",
                stats.total_attempts, config.min_samples
            ),
        };
        let last = stats
            .last_run_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<18} {:>4} attempts  {:>4} ok  rate {}  last {}",
            operation.key(),
            stats.total_attempts,
            stats.success_count,
            rate,
            last
        );
    }
}

fn print_daemon_status(root: &std::path::Path, config: &Config) {
    let observation = daemon::observe(root, config);
    if !observation.running {
        println!("daemon: not running");
    } else if observation.heartbeat_stale {
        println!("daemon: running but heartbeat is stale");
    } else {
        println!("daemon: running");
    }

    if let Some(record) = &observation.lock_record {
        println!(
            "  pid {} since {} (heartbeat {})",
            record.pid, record.acquired_at, record.heartbeat_at
        );
    }
    if let Some(status) = &observation.status {
        println!(
            "  cycles {}  ran {}  skipped {}  vetoes {}  last category {}",
            status.cycles_completed,
            status.ops_run,
            status.ops_skipped,
            status.vetoes,
            status
                .last_category
                .map(|c| c.key())
                .unwrap_or("none")
        );
    }
}
