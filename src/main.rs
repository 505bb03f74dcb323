//! Keel CLI entrypoint.
//!
//! This is the main entrypoint for the keel command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use keel_deploy::adapter::AdapterRegistry;
use keel_deploy::cli::{Cli, Commands, LogFormat, OutputFormatter, StateCommands};
use keel_deploy::config::{ConfigParser, ConfigValidator, DeployConfig, find_config_file};
use keel_deploy::error::{KeelError, Result};
use keel_deploy::planner::Plan;
use keel_deploy::reconciler::{ApplyReport, ReconcileOptions, Reconciler};
use keel_deploy::state::{StateLock, StateStore, generate_holder_id};

use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system. Logs go to stderr so that command
/// output on stdout stays machine-readable.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(config_path, yes, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&result, show_warnings));

    if !result.is_valid() {
        return Err(KeelError::internal(format!(
            "configuration has {} error(s)",
            result.error_count()
        )));
    }

    eprintln!("\nConfiguration summary:");
    eprintln!("  Project: {}", config.qualified_name());
    eprintln!("  Adapters: {}", config.adapters.len());
    eprintln!("  Resources: {}", config.resource_count());
    Ok(())
}

/// Show deployment plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_path) = load_config(config_path)?;
    let store = StateStore::open_read_only(&state_path).await?;
    let reconciler = build_reconciler(&config, store, None)?;

    let plan = reconciler.plan(&config.resource_map()).await?;
    println!("{}", formatter.format_plan(&plan, detailed));
    Ok(())
}

/// Apply deployment plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_path) = load_config(config_path)?;
    with_lock(&state_path, async {
        let cancel = cancel_on_ctrl_c();
        let store = StateStore::open(&state_path).await?;
        let reconciler = build_reconciler(&config, store, Some(cancel))?;

        let plan = reconciler.plan(&config.resource_map()).await?;
        println!("{}", formatter.format_plan(&plan, false));

        if plan.is_noop() {
            return commit_recovered(&reconciler).await;
        }

        if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
            eprintln!("Apply cancelled.");
            return commit_recovered(&reconciler).await;
        }

        let report = reconciler.apply(&plan).await?;
        finish(&report, formatter)
    })
    .await
}

/// Destroy every resource in the state.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, state_path) = load_config(config_path)?;
    with_lock(&state_path, async {
        let cancel = cancel_on_ctrl_c();
        let store = StateStore::open(&state_path).await?;
        let reconciler = build_reconciler(&config, store, Some(cancel))?;

        let plan: Plan = reconciler.plan_destroy().await?;
        if plan.entries.is_empty() {
            eprintln!("Nothing to destroy.");
            return commit_recovered(&reconciler).await;
        }
        println!("{}", formatter.format_plan(&plan, false));

        if !auto_approve
            && !confirm(
                "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
                "destroy",
            )?
        {
            eprintln!("Destruction cancelled.");
            return commit_recovered(&reconciler).await;
        }

        let report = reconciler.apply(&plan).await?;
        finish(&report, formatter)
    })
    .await
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_config, state_path) = load_config(config_path)?;

    match command {
        StateCommands::Show => {
            let store = StateStore::open_read_only(&state_path).await?;
            println!("{}", formatter.format_state(&store.database().await));
        }
        StateCommands::Export => {
            let store = StateStore::open_read_only(&state_path).await?;
            println!("{}", formatter.format_export(&store.export().await));
        }
        StateCommands::Unlock { force } => {
            let lock = StateLock::for_state(&state_path);
            match lock.read().await? {
                None => eprintln!("State is not locked."),
                Some(info) if force || info.is_expired() => {
                    lock.force_release().await?;
                    eprintln!(
                        "{}",
                        formatter.success(&format!("Removed lock held by {}", info.holder))
                    );
                }
                Some(info) => {
                    eprintln!(
                        "{}",
                        formatter.warning(&format!(
                            "State is locked by {} for another {}s. Use --force to remove it.",
                            info.holder,
                            info.remaining_secs()
                        ))
                    );
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the configuration, returning it with the snapshot path.
fn load_config(config_path: Option<&PathBuf>) -> Result<(DeployConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base = config_dir(&config_file);
    let parser = ConfigParser::new().with_base_path(base);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    let state_path = config.state_path(base);
    Ok((config, state_path))
}

/// Wires the adapters declared in the configuration around `store`.
fn build_reconciler(
    config: &DeployConfig,
    store: StateStore,
    cancel: Option<watch::Receiver<bool>>,
) -> Result<Reconciler> {
    let registry = AdapterRegistry::from_config(config)?;

    let mut options = ReconcileOptions::from(&config.engine);
    options.cancel = cancel;

    Ok(Reconciler::new(Arc::new(registry), Arc::new(store)).with_options(options))
}

/// Runs `session` while holding the state lock.
async fn with_lock<F>(state_path: &Path, session: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    let lock = StateLock::for_state(state_path);
    let info = lock.acquire(&generate_holder_id()).await?;

    let result = session.await;

    if let Err(e) = lock.release(&info.lock_id).await {
        warn!("Failed to release state lock: {e}");
    }
    result
}

/// Folds a WAL recovered at open time into the snapshot when nothing else
/// will commit it.
async fn commit_recovered(reconciler: &Reconciler) -> Result<()> {
    if let Some(serial) = reconciler.commit_recovered().await? {
        info!("Committed recovered state at serial {serial}");
    }
    Ok(())
}

/// Returns a receiver that flips to `true` on the first Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for running resources to finish");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Prints the apply report and turns a failed apply into an error exit.
fn finish(report: &ApplyReport, formatter: &OutputFormatter) -> Result<()> {
    println!("{}", formatter.format_apply(report));
    if report.is_success() {
        Ok(())
    } else {
        let (_, failed, skipped, cancelled) = report.tally();
        Err(KeelError::internal(format!(
            "apply did not complete: {failed} failed, {skipped} skipped, {cancelled} cancelled"
        )))
    }
}
