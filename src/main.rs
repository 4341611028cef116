use anyhow::Context;
use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use schema_router::catalog::{Catalog, PgCatalog};
use schema_router::config::Config;
use schema_router::error::RouterError;
use schema_router::pool::{PoolManager, RoutingDecisionEngine};
use schema_router::registry::{Manifest, NamespaceRegistry};
use schema_router::schema::{ApplyOutcome, DriftAuditor, DriftRepairer, MigrationJournal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// Namespace manifest, overrides MANIFEST_PATH
    #[clap(short, long)]
    manifest: Option<PathBuf>,

    /// Service identity, overrides SERVICE_NAME
    #[clap(short, long)]
    service: Option<String>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create missing namespaces and journal tables
    Bootstrap,

    /// Compare the database against the manifest. Exits 1 when drift is found
    Audit {
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Plan or apply repairs for the drift an audit finds
    Repair(RepairArgs),

    /// Print the connection search order of the service
    SearchPath {
        /// Open a pooled connection and show the search_path it reports
        #[clap(long)]
        verify: bool,
    },

    /// List migrations recorded in a namespace
    Journal { namespace: String },

    /// Record a migration for a unit the service owns
    Record { unit: String, migration: String },

    /// Show whether the service may migrate a unit. Exits 1 when denied
    Allow { unit: String },
}

#[derive(Args)]
#[clap(group(ArgGroup::new("mode").required(true).args(["dry_run", "apply"])))]
struct RepairArgs {
    /// Print the plan without changing anything
    #[clap(long)]
    dry_run: bool,

    /// Execute the plan
    #[clap(long)]
    apply: bool,

    /// Continue a paused run from the repair log
    #[clap(long, requires = "apply")]
    resume: Option<String>,

    #[clap(long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment from .env file if present
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let _guard = init_logging(&config.log_dir);
    if let Err(e) = dotenv {
        debug!("No .env file loaded: {}", e);
    }

    if let Some(manifest) = cli.manifest.clone() {
        config.manifest_path = manifest;
    }
    if let Some(service) = cli.service.clone() {
        config.service_name = service;
    }

    match run(cli.command, config).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let category = e
                .downcast_ref::<RouterError>()
                .map(RouterError::category)
                .unwrap_or("internal_error");
            error!(category, "{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    // Create log directory if it doesn't exist
    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "Warning: Could not create log directory {}: {}",
            log_dir.display(),
            e
        );
    }

    // Daily rotation; console-only when the directory is unusable
    let file = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("schema-router")
        .filename_suffix("log")
        .build(log_dir)
        .ok()
        .map(tracing_appender::non_blocking);

    let (file_layer, guard) = match file {
        Some((writer, guard)) => (
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_writer(writer),
            ),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,schema_router=debug")),
        )
        // Console output on stderr keeps stdout for reports
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();

    debug!("Logging initialized - log directory: {}", log_dir.display());
    guard
}

fn load_registry(config: &Config) -> anyhow::Result<Arc<NamespaceRegistry>> {
    let manifest = Manifest::load(&config.manifest_path)?;
    Ok(Arc::new(NamespaceRegistry::from_manifest(&manifest)?))
}

async fn connect(config: &Config) -> anyhow::Result<(PoolManager, Arc<dyn Catalog>)> {
    let pools = PoolManager::new(config.clone()).await?;
    let catalog: Arc<dyn Catalog> = Arc::new(PgCatalog::new(
        pools.admin_pool().clone(),
        &config.database_name(),
    ));
    Ok((pools, catalog))
}

fn require_service(config: &Config) -> anyhow::Result<&str> {
    if config.service_name.is_empty() {
        return Err(RouterError::config("SERVICE_NAME is not set (or pass --service)").into());
    }
    Ok(&config.service_name)
}

async fn run(command: Commands, config: Config) -> anyhow::Result<u8> {
    let registry = load_registry(&config)?;

    match command {
        Commands::Bootstrap => {
            let (_pools, catalog) = connect(&config).await?;
            let journal = MigrationJournal::new(catalog, registry);
            let namespaces = journal.bootstrap_all().await?;
            for ns in namespaces {
                println!("ok  {}", ns);
            }
            Ok(0)
        }

        Commands::Audit { format } => {
            let (_pools, catalog) = connect(&config).await?;
            let report = DriftAuditor::new(catalog, registry).audit().await?;
            match format {
                OutputFormat::Text => print!("{}", report.render_text()),
                OutputFormat::Json => println!("{}", report.to_json()?),
            }
            Ok(if report.is_empty() { 0 } else { 1 })
        }

        Commands::Repair(args) => {
            let (_pools, catalog) = connect(&config).await?;
            let repairer = DriftRepairer::new(
                catalog.clone(),
                registry.clone(),
                config.backup_dir(),
                config.repair_log_path(),
                &config.deployment_name,
            );

            let execution = match &args.resume {
                Some(run_id) => repairer
                    .resume(run_id)
                    .await
                    .with_context(|| format!("resuming repair run {}", run_id))?,
                None => {
                    let report = DriftAuditor::new(catalog, registry).audit().await?;
                    let plan = repairer.plan(&report).await?;
                    if args.dry_run && args.format == OutputFormat::Text {
                        print!("{}", plan.render_text());
                        return Ok(0);
                    }
                    repairer.execute(&plan, args.dry_run).await?
                }
            };

            match args.format {
                OutputFormat::Text => print!("{}", execution.render_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&execution)?),
            }
            if let Some(run_id) = &execution.run_id {
                info!(
                    "Repair run {} logged to {}",
                    run_id,
                    config.repair_log_path().display()
                );
            }
            Ok(execution.exit_code())
        }

        Commands::SearchPath { verify } => {
            let service = require_service(&config)?;
            let engine = RoutingDecisionEngine::new(registry);
            let order = engine.search_order(service);

            println!("service:     {}", service);
            println!("search_path: {}", order.search_path());
            println!("options:     {}", order.connection_options());

            if verify {
                let pools = PoolManager::new(config.clone()).await?;
                let effective = pools.effective_search_path(order).await?;
                println!("effective:   {}", effective);
                debug!("{} pools open", pools.active_pools());
            }
            Ok(0)
        }

        Commands::Journal { namespace } => {
            let (_pools, catalog) = connect(&config).await?;
            let journal = MigrationJournal::new(catalog, registry);
            for record in journal.list_applied(&namespace).await? {
                println!(
                    "{}  {}  {}",
                    record.applied_at.to_rfc3339(),
                    record.logical_unit,
                    record.migration_name
                );
            }
            Ok(0)
        }

        Commands::Record { unit, migration } => {
            let service = require_service(&config)?.to_string();
            let engine = RoutingDecisionEngine::new(registry.clone());
            let (_pools, catalog) = connect(&config).await?;
            let journal = MigrationJournal::new(catalog, registry);

            match journal.apply_for(&engine, &service, &unit, &migration).await? {
                ApplyOutcome::Applied(record) => {
                    println!("recorded {} in {}", record.key(), record.namespace)
                }
                ApplyOutcome::AlreadyApplied(record) => {
                    println!("already recorded {} in {}", record.key(), record.namespace)
                }
            }
            Ok(0)
        }

        Commands::Allow { unit } => {
            let service = require_service(&config)?;
            let engine = RoutingDecisionEngine::new(registry);

            if engine.allow_migrate(service, &unit) {
                let namespace = engine.authorize_migrate(service, &unit)?;
                println!("allowed: {} may migrate {} into {}", service, unit, namespace.name);
                Ok(0)
            } else {
                match engine.authorize_migrate(service, &unit) {
                    Err(e) => println!("denied: {}", e),
                    Ok(_) => warn!("Decision changed between checks for {}", unit),
                }
                Ok(1)
            }
        }
    }
}
