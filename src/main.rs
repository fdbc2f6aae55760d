//! Stackforge CLI entrypoint.
//!
//! This is the main entrypoint for the stackforge command-line tool.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use stackforge::catalog::{
    find_catalog_file, Catalog, CatalogParser, CatalogValidator, SpecHasher, StateBackend,
};
use stackforge::cli::{Cli, Commands, OutputFormatter, StateCommands};
use stackforge::engine::{ExecutionEngine, RunContext, RunOutcome};
use stackforge::error::{ConfigError, Result, StackforgeError};
use stackforge::graph::GraphBuilder;
use stackforge::planner::{DiffEngine, Plan};
use stackforge::provider::{CloudProvider, HttpProvider, PlacementPolicy};
use stackforge::state::{
    LocalStateStore, RecordSet, RunHistoryEntry, RunOperation, S3StateStore, StateFile,
    StateStore,
};

use clap::Parser;
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Default provider API endpoint.
const DEFAULT_API_URL: &str = "https://api.stackforge.dev";

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let vars = parse_vars(&cli.vars)?;

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => {
            cmd_validate(cli.catalog.as_ref(), &vars, warnings).map(|()| ExitCode::SUCCESS)
        }
        Commands::Plan { detailed } => {
            cmd_plan(cli.catalog.as_ref(), &vars, detailed, &formatter).await
        }
        Commands::Apply { yes, workers } => {
            cmd_apply(cli.catalog.as_ref(), &vars, yes, workers, cli.output, &formatter).await
        }
        Commands::Destroy { yes } => {
            cmd_destroy(cli.catalog.as_ref(), &vars, yes, cli.output, &formatter).await
        }
        Commands::State { command } => {
            cmd_state(cli.catalog.as_ref(), &vars, command, &formatter)
                .await
                .map(|()| ExitCode::SUCCESS)
        }
    }
}

/// Initialize a new project.
fn cmd_init(path: &PathBuf, force: bool) -> Result<()> {
    let catalog_path = path.join("stackforge.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && catalog_path.exists() {
        eprintln!("Catalog file already exists: {}", catalog_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let catalog_template = include_str!("../templates/stackforge.yaml");
    std::fs::write(&catalog_path, catalog_template)?;
    eprintln!("Created: {}", catalog_path.display());

    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    let gitignore_content = ".env\n.stackforge/\n";
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(".stackforge") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Stackforge")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".stackforge") {
                writeln!(file, ".stackforge/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, gitignore_content)?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set your provider API token");
    eprintln!("  2. Edit stackforge.yaml with your resource declarations");
    eprintln!("  3. Run 'stackforge validate' to check the catalog");
    eprintln!("  4. Run 'stackforge plan' to preview changes");
    eprintln!("  5. Run 'stackforge apply' to create the resources");

    Ok(())
}

/// Validate the catalog.
fn cmd_validate(
    catalog_path: Option<&PathBuf>,
    vars: &BTreeMap<String, String>,
    show_warnings: bool,
) -> Result<()> {
    let catalog = load_catalog(catalog_path, vars)?;
    let result = CatalogValidator::new().validate(&catalog)?;

    eprintln!("Catalog is valid.");
    if show_warnings && !result.warnings.is_empty() {
        eprintln!("\nWarnings:");
        for warning in &result.warnings {
            eprintln!("  - {warning}");
        }
    }

    eprintln!("\nCatalog summary:");
    eprintln!("  Project: {}", catalog.project.name);
    eprintln!("  Environment: {}", catalog.project.environment);
    eprintln!("  Resources: {}", catalog.resources.len());
    eprintln!("  Discovery queries: {}", catalog.discovery_queries().len());

    Ok(())
}

/// Compute and display the plan.
async fn cmd_plan(
    catalog_path: Option<&PathBuf>,
    vars: &BTreeMap<String, String>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (catalog, store) = load_catalog_and_store(catalog_path, vars).await?;

    let state = store
        .load()
        .await?
        .unwrap_or_else(|| StateFile::new(&catalog.project.name, &catalog.project.environment));

    // Reject cyclic catalogs before showing a plan that could never apply.
    GraphBuilder::new().build(&catalog)?;

    let plan = compute_plan(&catalog, &state);
    eprintln!("{}", formatter.format_plan(&plan, detailed));

    Ok(ExitCode::SUCCESS)
}

/// Apply the plan.
async fn cmd_apply(
    catalog_path: Option<&PathBuf>,
    vars: &BTreeMap<String, String>,
    auto_approve: bool,
    workers: Option<usize>,
    output: stackforge::cli::OutputFormat,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (catalog, store) = load_catalog_and_store(catalog_path, vars).await?;
    let provider = create_provider()?;

    let mut state = store
        .load()
        .await?
        .unwrap_or_else(|| StateFile::new(&catalog.project.name, &catalog.project.environment));

    let graph = GraphBuilder::new().build(&catalog)?;
    let plan = compute_plan(&catalog, &state);

    if plan.is_empty() {
        eprintln!("No changes to apply.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("{}", formatter.format_plan(&plan, false));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let lock = match store.acquire_lock("").await {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!(
                "{}",
                formatter.format_outcome(&RunOutcome::Aborted {
                    reason: e.to_string()
                })
            );
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut ctx = RunContext::for_catalog(&catalog);
    if let Some(workers) = workers {
        ctx = ctx.with_workers(workers);
    }
    let ctx = Arc::new(ctx);
    install_cancel_handler(&ctx);

    let policy = PlacementPolicy::from_catalog(&catalog);
    let records = RecordSet::from_state(&state, catalog.resources.iter().map(|r| r.id.clone()));

    let (events, printer) = spawn_event_printer(output);
    let engine = ExecutionEngine::new(Arc::clone(&provider), ctx, policy).with_events(events);

    eprintln!("\nApplying:");
    let outcome = engine.apply(&graph, &plan, &records).await;
    drop(engine);
    let _ = printer.await;

    // Persist whatever was reached, success or not.
    records.flush_into(&mut state).await;
    let resources: Vec<String> = plan.changes.iter().map(|c| c.id.clone()).collect();
    state.catalog_hash.clone_from(&plan.catalog_hash);
    state.add_history(if outcome.is_success() {
        RunHistoryEntry::new(RunOperation::Apply, &plan.catalog_hash, resources)
    } else {
        RunHistoryEntry::failed(
            RunOperation::Apply,
            &plan.catalog_hash,
            resources,
            &format!("{} units failed", outcome.failed().len()),
        )
    });
    store.save(&state).await?;
    store.release_lock(&lock.lock_id).await?;

    eprintln!("\n{}", formatter.format_outcome(&outcome));
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Destroy recorded resources.
async fn cmd_destroy(
    catalog_path: Option<&PathBuf>,
    vars: &BTreeMap<String, String>,
    auto_approve: bool,
    output: stackforge::cli::OutputFormat,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (catalog, store) = load_catalog_and_store(catalog_path, vars).await?;
    let provider = create_provider()?;

    let Some(mut state) = store.load().await? else {
        eprintln!("Nothing to destroy: no state found.");
        return Ok(ExitCode::SUCCESS);
    };

    if state.is_empty() {
        eprintln!("Nothing to destroy: no resources recorded.");
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("The following resources will be destroyed:");
    for id in state.record_ids() {
        if let Some(record) = state.get(id) {
            eprintln!("  - {id} ({})", record.provider_id);
        }
    }

    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let lock = store.acquire_lock("").await?;

    let graph = GraphBuilder::new().build(&catalog)?;
    let ctx = Arc::new(RunContext::for_catalog(&catalog));
    install_cancel_handler(&ctx);

    let policy = PlacementPolicy::from_catalog(&catalog);
    let records = RecordSet::from_state(&state, catalog.resources.iter().map(|r| r.id.clone()));

    let (events, printer) = spawn_event_printer(output);
    let engine = ExecutionEngine::new(Arc::clone(&provider), ctx, policy).with_events(events);

    eprintln!("\nDestroying:");
    let outcome = engine.destroy(&graph, &records).await;
    drop(engine);
    let _ = printer.await;

    records.flush_into(&mut state).await;

    if outcome.is_success() && state.is_empty() {
        store.delete().await?;
        eprintln!("\n{}", formatter.format_outcome(&outcome));
        return Ok(ExitCode::SUCCESS);
    }

    let resources: Vec<String> = state.record_ids().iter().map(ToString::to_string).collect();
    state.add_history(RunHistoryEntry::failed(
        RunOperation::Destroy,
        &state.catalog_hash.clone(),
        resources,
        &format!("{} units failed", outcome.failed().len()),
    ));
    store.save(&state).await?;
    store.release_lock(&lock.lock_id).await?;

    eprintln!("\n{}", formatter.format_outcome(&outcome));
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// State management commands.
async fn cmd_state(
    catalog_path: Option<&PathBuf>,
    vars: &BTreeMap<String, String>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (_catalog, store) = load_catalog_and_store(catalog_path, vars).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                eprintln!("{}", formatter.format_state(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.lock_info().await? {
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Parses `--var KEY=VALUE` bindings.
fn parse_vars(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(StackforgeError::Config(ConfigError::parse(format!(
                "Invalid --var '{pair}'. Expected format: KEY=VALUE"
            ))));
        };
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

/// Resolves the catalog file path.
fn resolve_catalog_path(catalog_path: Option<&PathBuf>) -> Result<PathBuf> {
    catalog_path.map_or_else(|| find_catalog_file("."), |path| Ok(path.clone()))
}

/// Loads and validates the catalog.
fn load_catalog(
    catalog_path: Option<&PathBuf>,
    vars: &BTreeMap<String, String>,
) -> Result<Catalog> {
    let catalog_file = resolve_catalog_path(catalog_path)?;
    debug!("Loading catalog from: {}", catalog_file.display());

    let parser = CatalogParser::new()
        .with_base_path(
            catalog_file
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
        )
        .with_variables(vars.clone());
    parser.load_dotenv()?;

    let catalog = parser.load_file(&catalog_file)?;
    CatalogValidator::new().validate(&catalog)?;

    Ok(catalog)
}

/// Loads the catalog and creates the configured state store.
async fn load_catalog_and_store(
    catalog_path: Option<&PathBuf>,
    vars: &BTreeMap<String, String>,
) -> Result<(Catalog, Box<dyn StateStore>)> {
    let catalog_file = resolve_catalog_path(catalog_path)?;
    let catalog = load_catalog(Some(&catalog_file), vars)?;

    let store: Box<dyn StateStore> = match catalog.state.backend {
        StateBackend::Local => {
            let store = catalog.state.path.as_ref().map_or_else(
                || {
                    let base_dir = catalog_file
                        .parent()
                        .unwrap_or_else(|| std::path::Path::new("."))
                        .join(".stackforge");
                    LocalStateStore::with_base_dir(base_dir)
                },
                LocalStateStore::with_state_path,
            );
            Box::new(store)
        }
        StateBackend::S3 => {
            let bucket = catalog
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| StackforgeError::internal("S3 bucket not configured"))?;
            let prefix = catalog.state.prefix.as_deref();
            let region = catalog.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    Ok((catalog, store))
}

/// Creates the provider API client.
fn create_provider() -> Result<Arc<dyn CloudProvider>> {
    let api_token = CatalogParser::provider_api_token()?;
    let base_url =
        std::env::var("STACKFORGE_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
    Ok(Arc::new(HttpProvider::new(base_url, &api_token)?))
}

/// Computes the plan for a catalog against loaded state.
fn compute_plan(catalog: &Catalog, state: &StateFile) -> Plan {
    let catalog_hash = SpecHasher::new().hash_catalog(catalog);
    let diff = DiffEngine::new().compute_diff(catalog, &state.records);
    Plan::from_diff(diff, &catalog_hash)
}

/// Prompts for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Cancels the run context on Ctrl-C; in-flight units finish, nothing new
/// is scheduled.
fn install_cancel_handler(ctx: &Arc<RunContext>) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancellation requested; letting in-flight units finish...");
            ctx.cancel();
        }
    });
}

/// Spawns the task that prints streamed unit transitions.
fn spawn_event_printer(
    output: stackforge::cli::OutputFormat,
) -> (
    mpsc::UnboundedSender<stackforge::engine::UnitEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let formatter = OutputFormatter::new(output);
        while let Some(event) = receiver.recv().await {
            formatter.print_event(&event);
        }
    });
    (sender, handle)
}
