//! CLI command definitions for flowrun.
//!
//! Every command loads the service configuration first, then talks to the
//! store, the queues or the fleet. Output is JSON on stdout so it can be
//! piped into other tools.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use redis::aio::ConnectionManager;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::catalog::{self, ModelTier};
use crate::config::ServiceConfig;
use crate::fleet::{DockerFleet, FleetScaler};
use crate::metrics::{self, MetricsCollector};
use crate::scheduler::{
    CommandExecutor, Dispatcher, MessageQueue, QueueStats, RedisQueue, RunRequest, RunTarget,
    TaskRouter, WorkerPool,
};
use crate::storage::{
    Database, DispatchState, ParentKind, ResultStore, ResultView, Version, VersionedEntity,
};

/// Test and suite run dispatch with queue-driven execution.
#[derive(Parser)]
#[command(name = "flowrun")]
#[command(about = "Dispatch versioned test and suite runs to an autoscaled worker fleet")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Optional YAML configuration file. Environment variables override it.
    #[arg(short, long, env = "FLOWRUN_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Apply the database schema.
    Migrate,

    /// Manage projects.
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Manage tests and their versions.
    #[command(subcommand)]
    Test(TestCommand),

    /// Manage test suites, their versions and member tests.
    #[command(subcommand)]
    Suite(SuiteCommand),

    /// Manage versions of a test or suite.
    #[command(subcommand)]
    Version(VersionCommand),

    /// Create and inspect runs.
    #[command(subcommand)]
    Run(RunCommand),

    /// List the models runs can target.
    Models(ModelsArgs),

    /// Forward test-run messages from the intake queue to the execution queue.
    Router,

    /// Run a pool of workers draining the execution queue.
    Worker(WorkerArgs),

    /// Run a fleet scaling pass.
    Scale(ScaleArgs),

    /// Show queue depths and dead-lettered messages.
    Queues(QueuesArgs),

    /// Print Prometheus metrics.
    Metrics,
}

/// Which kind of versioned parent a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Test,
    Suite,
}

impl From<KindArg> for ParentKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Test => ParentKind::Test,
            KindArg::Suite => ParentKind::Suite,
        }
    }
}

/// Organization and project a command targets.
#[derive(clap::Args, Debug)]
pub struct ScopeArgs {
    /// Organization slug.
    #[arg(long)]
    pub org: String,

    /// Project slug.
    #[arg(long)]
    pub project: String,
}

#[derive(clap::Subcommand, Debug)]
pub enum ProjectCommand {
    /// Create a project.
    Create {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Display name; defaults to the project slug.
        #[arg(long)]
        name: Option<String>,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum TestCommand {
    /// Create a test with its first version.
    Create(CreateArgs),
    /// Record a new default version with a new title and description.
    Edit(EditArgs),
    /// Soft-delete a test and its versions.
    Delete(SlugArgs),
    /// List a test's versions, newest first.
    Versions(SlugArgs),
}

#[derive(clap::Subcommand, Debug)]
pub enum SuiteCommand {
    /// Create a suite with its first version.
    Create(CreateSuiteArgs),
    /// Record a new default version with a new title and description.
    Edit(EditArgs),
    /// Replace the tests of the suite's default version.
    Bind(BindArgs),
    /// Soft-delete a suite and its versions.
    Delete(SlugArgs),
    /// List a suite's versions, newest first.
    Versions(SlugArgs),
}

#[derive(clap::Args, Debug)]
pub struct CreateArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    #[arg(long)]
    pub title: String,

    /// Natural-language task handed to the agent.
    #[arg(long)]
    pub description: String,

    /// Email of the acting user.
    #[arg(long, env = "FLOWRUN_ACTOR")]
    pub actor: String,
}

#[derive(clap::Args, Debug)]
pub struct CreateSuiteArgs {
    #[command(flatten)]
    pub create: CreateArgs,

    /// Comma-separated test slugs to bind to the first version.
    #[arg(long, value_delimiter = ',')]
    pub tests: Vec<String>,
}

#[derive(clap::Args, Debug)]
pub struct EditArgs {
    /// Slug of the test or suite.
    pub slug: String,

    #[arg(long)]
    pub title: String,

    #[arg(long)]
    pub description: String,

    #[arg(long, env = "FLOWRUN_ACTOR")]
    pub actor: String,
}

#[derive(clap::Args, Debug)]
pub struct BindArgs {
    /// Slug of the suite.
    pub slug: String,

    /// Comma-separated test slugs.
    #[arg(long, value_delimiter = ',', required = true)]
    pub tests: Vec<String>,

    #[arg(long, env = "FLOWRUN_ACTOR")]
    pub actor: String,
}

#[derive(clap::Args, Debug)]
pub struct SlugArgs {
    pub slug: String,
}

#[derive(clap::Subcommand, Debug)]
pub enum VersionCommand {
    /// Make a version the default of its test or suite.
    SetDefault {
        #[arg(long, value_enum)]
        kind: KindArg,

        /// Slug of the test or suite.
        #[arg(long)]
        parent: String,

        /// Slug of the version to promote.
        version: String,
    },
}

#[derive(clap::Subcommand, Debug)]
pub enum RunCommand {
    /// Create and dispatch a test run.
    Test(DispatchArgs),
    /// Create a suite run and dispatch one test run per member test.
    Suite(DispatchArgs),
    /// Show a run. Suite runs include their test runs and aggregate status.
    Show {
        #[arg(long, value_enum, default_value = "test")]
        kind: KindArg,
        slug: String,
    },
    /// Print the result artifact of a test run.
    Result { slug: String },
    /// List test runs whose dispatch message never reached the queue.
    Undispatched,
}

#[derive(clap::Args, Debug)]
pub struct DispatchArgs {
    #[command(flatten)]
    pub scope: ScopeArgs,

    /// Slug of the test or suite to run.
    pub slug: String,

    /// Model slug from the catalog.
    #[arg(short, long)]
    pub model: String,

    /// Version slug; defaults to the current default version.
    #[arg(long)]
    pub version: Option<String>,

    #[arg(long, env = "FLOWRUN_ACTOR")]
    pub actor: String,
}

#[derive(clap::Args, Debug)]
pub struct ModelsArgs {
    /// Only list models in this tier (e.g. medium_balanced).
    #[arg(long)]
    pub tier: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers; overrides the configuration.
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,
}

#[derive(clap::Args, Debug)]
pub struct ScaleArgs {
    /// Keep scaling on an interval until interrupted.
    #[arg(short, long)]
    pub watch: bool,

    /// Seconds between passes in watch mode.
    #[arg(long, default_value = "30")]
    pub interval: u64,
}

#[derive(clap::Args, Debug)]
pub struct QueuesArgs {
    /// Number of dead-lettered messages to show per queue.
    #[arg(long, default_value = "0")]
    pub dead_letters: usize,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = ServiceConfig::load(cli.config.as_deref())?;
    if let Err(e) = metrics::init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    match cli.command {
        Commands::Migrate => run_migrate_command(&config).await,
        Commands::Project(cmd) => run_project_command(&config, cmd).await,
        Commands::Test(cmd) => run_test_command(&config, cmd).await,
        Commands::Suite(cmd) => run_suite_command(&config, cmd).await,
        Commands::Version(cmd) => run_version_command(&config, cmd).await,
        Commands::Run(cmd) => run_run_command(&config, cmd).await,
        Commands::Models(args) => run_models_command(args),
        Commands::Router => run_router_command(&config).await,
        Commands::Worker(args) => run_worker_command(&config, args).await,
        Commands::Scale(args) => run_scale_command(&config, args).await,
        Commands::Queues(args) => run_queues_command(&config, args).await,
        Commands::Metrics => run_metrics_command(&config).await,
    }
}

// ============================================================================
// Wiring
// ============================================================================

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_database(config: &ServiceConfig) -> anyhow::Result<Database> {
    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    db.run_migrations().await?;
    Ok(db)
}

/// Opens the intake and execution queues on one Redis connection.
async fn connect_queues(
    config: &ServiceConfig,
) -> anyhow::Result<(Arc<RedisQueue>, Arc<RedisQueue>)> {
    let client = redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", config.redis_url))?;
    let conn = ConnectionManager::new(client)
        .await
        .context("Failed to connect to Redis")?;

    let intake = RedisQueue::from_connection(conn.clone(), &config.intake_queue);
    let execution = RedisQueue::from_connection(conn, &config.execution_queue)
        .with_lease(config.worker.delivery_lease());
    Ok((Arc::new(intake), Arc::new(execution)))
}

fn build_scaler(
    config: &ServiceConfig,
    execution: Arc<dyn MessageQueue>,
) -> anyhow::Result<Arc<FleetScaler>> {
    let fleet = DockerFleet::connect(config.template.clone())?;
    Ok(Arc::new(FleetScaler::new(
        execution,
        Arc::new(fleet),
        config.scaling.clone(),
    )))
}

/// Builds a scaler when the fleet is reachable; scaling is optional for
/// the router and the dispatcher.
fn optional_scaler(
    config: &ServiceConfig,
    execution: Arc<dyn MessageQueue>,
) -> Option<Arc<FleetScaler>> {
    match build_scaler(config, execution) {
        Ok(scaler) => Some(scaler),
        Err(e) => {
            warn!(error = %e, "Fleet unavailable, continuing without scaling");
            None
        }
    }
}

async fn wait_for_shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

// ============================================================================
// Catalog commands
// ============================================================================

async fn run_migrate_command(config: &ServiceConfig) -> anyhow::Result<()> {
    let db = Database::connect(&config.database_url).await?;
    let applied = db.run_migrations().await?;
    print_json(&serde_json::json!({ "applied": applied }))
}

async fn run_project_command(config: &ServiceConfig, cmd: ProjectCommand) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    match cmd {
        ProjectCommand::Create { scope, name } => {
            let name = name.unwrap_or_else(|| scope.project.clone());
            let project = db.create_project(&scope.org, &scope.project, &name).await?;
            print_json(&project)
        }
    }
}

async fn create_entity(
    db: &Database,
    kind: ParentKind,
    args: &CreateArgs,
) -> anyhow::Result<(VersionedEntity, Version)> {
    let project = db
        .get_project(&args.scope.org, &args.scope.project)
        .await?;
    Ok(db
        .create_entity(kind, &project, &args.title, &args.description, &args.actor)
        .await?)
}

async fn run_test_command(config: &ServiceConfig, cmd: TestCommand) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    match cmd {
        TestCommand::Create(args) => {
            let (test, version) = create_entity(&db, ParentKind::Test, &args).await?;
            print_json(&serde_json::json!({ "test": test, "version": version }))
        }
        TestCommand::Edit(args) => edit_entity(&db, ParentKind::Test, args).await,
        TestCommand::Delete(args) => delete_entity(&db, ParentKind::Test, &args.slug).await,
        TestCommand::Versions(args) => list_versions(&db, ParentKind::Test, &args.slug).await,
    }
}

async fn run_suite_command(config: &ServiceConfig, cmd: SuiteCommand) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    match cmd {
        SuiteCommand::Create(args) => {
            let (suite, mut version) =
                create_entity(&db, ParentKind::Suite, &args.create).await?;
            if !args.tests.is_empty() {
                version = db
                    .set_suite_tests(&suite, &args.tests, &args.create.actor)
                    .await?;
            }
            print_json(&serde_json::json!({ "suite": suite, "version": version }))
        }
        SuiteCommand::Edit(args) => edit_entity(&db, ParentKind::Suite, args).await,
        SuiteCommand::Bind(args) => {
            let suite = db.get_entity(ParentKind::Suite, &args.slug).await?;
            let version = db.set_suite_tests(&suite, &args.tests, &args.actor).await?;
            let tests = db.list_suite_tests(&version).await?;
            print_json(&serde_json::json!({ "version": version, "tests": tests }))
        }
        SuiteCommand::Delete(args) => delete_entity(&db, ParentKind::Suite, &args.slug).await,
        SuiteCommand::Versions(args) => list_versions(&db, ParentKind::Suite, &args.slug).await,
    }
}

async fn edit_entity(db: &Database, kind: ParentKind, args: EditArgs) -> anyhow::Result<()> {
    let entity = db.get_entity(kind, &args.slug).await?;
    let version = db
        .edit_entity(&entity, &args.title, &args.description, &args.actor)
        .await?;
    print_json(&version)
}

async fn delete_entity(db: &Database, kind: ParentKind, slug: &str) -> anyhow::Result<()> {
    let entity = db.get_entity(kind, slug).await?;
    db.delete_entity(&entity).await?;
    print_json(&serde_json::json!({ "deleted": slug, "kind": kind }))
}

async fn list_versions(db: &Database, kind: ParentKind, slug: &str) -> anyhow::Result<()> {
    let entity = db.get_entity(kind, slug).await?;
    print_json(&db.list_versions(&entity).await?)
}

async fn run_version_command(config: &ServiceConfig, cmd: VersionCommand) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    match cmd {
        VersionCommand::SetDefault {
            kind,
            parent,
            version,
        } => {
            let entity = db.get_entity(kind.into(), &parent).await?;
            let version = db.set_default(&entity, &version).await?;
            print_json(&version)
        }
    }
}

// ============================================================================
// Run commands
// ============================================================================

async fn run_run_command(config: &ServiceConfig, cmd: RunCommand) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    match cmd {
        RunCommand::Test(args) => {
            let dispatcher = build_dispatcher(config, db).await?;
            let (target, request) = dispatch_request(args);
            let created = dispatcher.dispatch_test_run(&target, &request).await?;
            print_json(&created)
        }
        RunCommand::Suite(args) => {
            let dispatcher = build_dispatcher(config, db).await?;
            let (target, request) = dispatch_request(args);
            let created = dispatcher.dispatch_suite_run(&target, &request).await?;
            let undispatched = created.undispatched().count();
            if undispatched > 0 {
                warn!(
                    suite_run = %created.slug,
                    undispatched = undispatched,
                    "Some test runs were not dispatched"
                );
            }
            print_json(&created)
        }
        RunCommand::Show { kind, slug } => match kind {
            KindArg::Test => print_json(&db.get_test_run(&slug).await?),
            KindArg::Suite => print_json(&db.suite_run_summary(&slug).await?),
        },
        RunCommand::Result { slug } => {
            let run = db.get_test_run(&slug).await?;
            let results = ResultStore::new(&config.results_path);
            match results.load_for_run(&run).await? {
                ResultView::Ready(artifact) => print_json(&artifact),
                ResultView::NotReady(status) => {
                    anyhow::bail!("Run {} is {}, no result yet", slug, status)
                }
                ResultView::Missing => {
                    anyhow::bail!("Run {} finished without a result artifact", slug)
                }
            }
        }
        RunCommand::Undispatched => {
            print_json(&db.list_runs_by_dispatch_state(DispatchState::DispatchFailed).await?)
        }
    }
}

fn dispatch_request(args: DispatchArgs) -> (RunTarget, RunRequest) {
    let target = RunTarget::new(args.scope.org, args.scope.project, args.slug, args.actor);
    let mut request = RunRequest::new(args.model);
    if let Some(version) = args.version {
        request = request.with_version(version);
    }
    (target, request)
}

async fn build_dispatcher(config: &ServiceConfig, db: Database) -> anyhow::Result<Dispatcher> {
    let (intake, execution) = connect_queues(config).await?;
    let mut dispatcher = Dispatcher::new(db, intake).with_max_attempts(config.max_attempts);
    if config.inline_scaling {
        if let Some(scaler) = optional_scaler(config, execution) {
            dispatcher = dispatcher.with_scaler(scaler);
        }
    }
    Ok(dispatcher)
}

fn run_models_command(args: ModelsArgs) -> anyhow::Result<()> {
    match args.tier {
        Some(name) => {
            let tier = ModelTier::ALL
                .into_iter()
                .find(|t| t.as_str() == name)
                .ok_or_else(|| {
                    let valid: Vec<_> = ModelTier::ALL.iter().map(|t| t.as_str()).collect();
                    anyhow::anyhow!("Unknown tier '{}', expected one of: {}", name, valid.join(", "))
                })?;
            let models: Vec<_> = catalog::models_in_tier(tier).collect();
            print_json(&models)
        }
        None => print_json(&catalog::all_models()),
    }
}

// ============================================================================
// Process commands
// ============================================================================

async fn run_router_command(config: &ServiceConfig) -> anyhow::Result<()> {
    let (intake, execution) = connect_queues(config).await?;
    let mut router = TaskRouter::new(intake, execution.clone())
        .with_poll_interval(Duration::from_secs(config.worker.poll_interval_secs));
    if let Some(scaler) = optional_scaler(config, execution) {
        router = router.with_scaler(scaler);
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let router = Arc::new(router);
    let handle = {
        let router = Arc::clone(&router);
        tokio::spawn(async move { router.run(shutdown_rx).await })
    };

    wait_for_shutdown_signal().await;
    let _ = shutdown_tx.send(());
    handle.await.context("Router task panicked")?;
    Ok(())
}

async fn run_worker_command(config: &ServiceConfig, args: WorkerArgs) -> anyhow::Result<()> {
    let db = open_database(config).await?;
    let (_, execution) = connect_queues(config).await?;
    let executor = CommandExecutor::from_command_line(&config.worker.agent_command)
        .ok_or_else(|| anyhow::anyhow!("worker.agent_command is empty"))?;

    let mut settings = config.worker.clone();
    if let Some(workers) = args.workers {
        settings.num_workers = workers;
    }

    let mut pool = WorkerPool::new(
        settings.pool_config(),
        execution,
        db,
        ResultStore::new(&config.results_path),
        Arc::new(executor),
    );
    pool.start().await?;

    wait_for_shutdown_signal().await;
    pool.shutdown().await?;
    print_json(&pool.stats())
}

async fn run_scale_command(config: &ServiceConfig, args: ScaleArgs) -> anyhow::Result<()> {
    let (_, execution) = connect_queues(config).await?;
    let scaler = build_scaler(config, execution)?;

    if !args.watch {
        return print_json(&scaler.tick().await?);
    }

    let mut interval = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = interval.tick() => match scaler.tick().await {
                Ok(report) => {
                    if let Some(warning) = report.warning() {
                        warn!(warning = %warning, "Scaling pass incomplete");
                    }
                    print_json(&report)?;
                }
                Err(e) => warn!(error = %e, "Scaling pass failed"),
            },
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueReport {
    #[serde(flatten)]
    stats: QueueStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dead_letters: Vec<serde_json::Value>,
}

async fn run_queues_command(config: &ServiceConfig, args: QueuesArgs) -> anyhow::Result<()> {
    let (intake, execution) = connect_queues(config).await?;
    let mut reports = Vec::new();
    for queue in [intake, execution] {
        reports.push(QueueReport {
            stats: queue.stats().await?,
            dead_letters: queue.peek_dead_letter(args.dead_letters).await?,
        });
    }
    print_json(&reports)
}

async fn run_metrics_command(config: &ServiceConfig) -> anyhow::Result<()> {
    let collector = MetricsCollector::new();
    match connect_queues(config).await {
        Ok((intake, execution)) => {
            for queue in [intake, execution] {
                let backlog = queue.approximate_backlog().await?;
                collector.update_queue_backlog(queue.name(), backlog);
            }
        }
        Err(e) => warn!(error = %e, "Queue backlog unavailable"),
    }
    print!("{}", metrics::export_metrics());
    Ok(())
}
