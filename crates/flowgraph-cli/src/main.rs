// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Flowgraph operator CLI.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use flowgraph_core::model::{JobPriority, ProjectDefinition, TriggeredBy};
use flowgraph_core::{
    system_blocks, BlockRegistry, CancelFlag, Engine, EngineConfig, EngineServices,
    MemoryDefinitionSource, ProjectGraph, RateLimiter, RunOutcome, RunRequest, SharedRegistry,
};
use flowgraph_providers::{
    AnthropicProvider, EgressPolicy, EnvSecretResolver, InMemoryVectorStore, OpenAIProvider,
    ReqwestHttp,
};
use flowgraph_state::{FileSnapshotStore, SqliteStore};
use flowgraph_triggers::{preview_fires, Scheduler, WorkerPool};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "flowgraph")]
#[command(version, about = "Flowgraph workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a project definition
    Validate {
        /// Path to project file (YAML or JSON)
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Execute a project locally
    Run {
        /// Path to project file
        #[arg(value_name = "FILE")]
        file: String,

        /// Input JSON string or file
        #[arg(short, long)]
        input: Option<String>,

        /// Start step name (required when the project has several)
        #[arg(long)]
        start: Option<String>,
    },

    /// Run the worker pool and scheduler over a project directory
    Worker {
        /// Directory of project files to serve
        #[arg(value_name = "DIR")]
        dir: String,
    },

    /// Preview the next fire times of a cron expression
    SchedulePreview {
        /// Cron expression (5- or 6-field)
        #[arg(value_name = "CRON")]
        cron: String,

        /// IANA timezone
        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// How many fire times to show
        #[arg(long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("flowgraph={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_project(&file),
        Commands::Run { file, input, start } => {
            run_project(&file, input.as_deref(), start.as_deref()).await
        }
        Commands::Worker { dir } => run_worker(&dir).await,
        Commands::SchedulePreview {
            cron,
            timezone,
            count,
        } => schedule_preview(&cron, &timezone, count),
    };

    if let Err(e) = result {
        error!("{}", e);
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_definition(file_path: &str) -> Result<ProjectDefinition> {
    let content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read project file: {}", file_path))?;
    let definition: ProjectDefinition = if file_path.ends_with(".json") {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse project JSON: {}", file_path))?
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse project YAML: {}", file_path))?
    };
    Ok(definition)
}

fn validate_project(file_path: &str) -> Result<()> {
    info!("Validating project: {}", file_path);
    println!("{} {}", "Validating project:".cyan().bold(), file_path);

    let definition = load_definition(file_path)?;

    // Graph construction runs the shape and cycle checks.
    let _graph = ProjectGraph::build(&definition)
        .with_context(|| "Project graph validation failed")?;

    // The system block library must resolve the step types in use.
    let registry = BlockRegistry::load(system_blocks(), EngineConfig::default().inheritance_max_depth)
        .with_context(|| "System block registry failed to resolve")?;
    for step in &definition.steps {
        if step.block_definition_id.is_none() {
            registry
                .get_by_slug(step.step_type.slug())
                .with_context(|| format!("Step '{}' has no resolvable block", step.name))?;
        }
    }

    println!("{}", "✓ Project is valid".green().bold());
    println!("  Name: {}", definition.project.name);
    println!("  Version: {}", definition.project.version);
    println!("  Steps: {}", definition.steps.len());
    println!("  Edges: {}", definition.edges.len());
    println!("  Groups: {}", definition.groups.len());

    Ok(())
}

async fn build_engine(definitions: Vec<ProjectDefinition>) -> Result<Arc<Engine>> {
    let config = EngineConfig::from_env();
    let registry = SharedRegistry::new(
        BlockRegistry::load(system_blocks(), config.inheritance_max_depth)
            .with_context(|| "System block registry failed to resolve")?,
    );
    let source = Arc::new(MemoryDefinitionSource::new());
    for definition in definitions {
        source.insert(definition);
    }

    let mut services = EngineServices::in_memory(registry, source);

    // Durable stores when DATABASE_URL points at SQLite.
    if let Some(url) = config.database_url.clone() {
        let store = Arc::new(
            SqliteStore::connect(&url)
                .await
                .with_context(|| format!("Failed to open database: {}", url))?,
        );
        services.run_store = store.clone();
        services.job_queue = store.clone();
        services.schedules = store.clone();
        services.idempotency = store.clone();
        services.approvals = store.clone();
        services.usage = store;
    }

    services.rate_limiter = Arc::new(RateLimiter::new(config.rate_limits));
    services.http = Some(Arc::new(ReqwestHttp::new(
        EgressPolicy::new(),
        config.http_timeout,
    )));
    services.secrets = Arc::new(EnvSecretResolver::new());
    services.vectors = Some(Arc::new(InMemoryVectorStore::new()));

    let mut providers: HashMap<String, Arc<dyn flowgraph_core::ports::LlmProvider>> =
        HashMap::new();
    if let Ok(openai) = OpenAIProvider::from_env() {
        info!("Registered OpenAI provider");
        providers.insert("openai".to_string(), Arc::new(openai));
    } else {
        info!("OpenAI provider not available (OPENAI_API_KEY not set)");
    }
    if let Ok(anthropic) = AnthropicProvider::from_env() {
        info!("Registered Anthropic provider");
        providers.insert("anthropic".to_string(), Arc::new(anthropic));
    } else {
        info!("Anthropic provider not available (ANTHROPIC_API_KEY not set)");
    }
    services.llm_providers = providers;
    services.config = config;

    Ok(Engine::new(Arc::new(services)))
}

async fn run_project(
    file_path: &str,
    input: Option<&str>,
    start: Option<&str>,
) -> Result<()> {
    info!("Running project: {}", file_path);
    println!("{} {}", "Running project:".cyan().bold(), file_path);

    let definition = load_definition(file_path)?;
    let tenant_id = definition.project.tenant_id;
    let project_id = definition.project.id;

    let start_step_id = match start {
        Some(name) => Some(
            definition
                .steps
                .iter()
                .find(|s| s.name == name)
                .map(|s| s.id)
                .with_context(|| format!("No step named '{}'", name))?,
        ),
        None => None,
    };

    let input = match input {
        Some(raw) => parse_input(raw)?,
        None => Value::Object(serde_json::Map::new()),
    };

    let engine = build_engine(vec![definition]).await?;

    let run = engine
        .create_run(RunRequest {
            tenant_id,
            project_id,
            version: 0,
            start_step_id,
            triggered_by: TriggeredBy::Manual,
            input,
            priority: JobPriority::Normal,
            idempotency_key: None,
        })
        .await
        .with_context(|| "Failed to create run")?;

    println!("{}", "Executing run...".cyan());

    // Drive inline, honoring delayed re-delivery from long waits.
    loop {
        match engine.execute_run(run.id).await? {
            RunOutcome::Completed(run) => {
                println!("{}", "✓ Run completed".green().bold());
                println!("\n{}", "Output:".cyan().bold());
                println!(
                    "{}",
                    serde_json::to_string_pretty(&run.output.unwrap_or(Value::Null))
                        .unwrap_or_else(|_| "null".to_string())
                );
                break;
            }
            RunOutcome::Failed(run) => {
                anyhow::bail!(
                    "run failed: {}",
                    run.error.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            RunOutcome::Cancelled(_) => {
                println!("{}", "Run cancelled".yellow().bold());
                break;
            }
            RunOutcome::WaitingApproval { approval_key, .. } => {
                anyhow::bail!(
                    "run is waiting for approval '{}'; submit a decision through the API",
                    approval_key
                );
            }
            RunOutcome::Delayed { resume_at, .. } => {
                let wait = (resume_at - Utc::now())
                    .to_std()
                    .unwrap_or_default();
                println!(
                    "  {} sleeping {}s for wait step",
                    "●".yellow(),
                    wait.as_secs()
                );
                tokio::time::sleep(wait).await;
            }
        }
    }

    Ok(())
}

async fn run_worker(dir: &str) -> Result<()> {
    let mut definitions = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory: {}", dir))? {
        let path = entry?.path();
        let Some(name) = path.to_str() else { continue };
        if name.ends_with(".yaml") || name.ends_with(".yml") || name.ends_with(".json") {
            definitions.push(load_definition(name)?);
        }
    }
    if definitions.is_empty() {
        anyhow::bail!("no project files found in {}", dir);
    }
    println!(
        "{} {} project(s)",
        "Serving".cyan().bold(),
        definitions.len()
    );

    let engine = build_engine(definitions).await?;
    let shutdown = CancelFlag::new();

    // Rate-limiter buckets survive restarts through periodic snapshots.
    let snapshots = Arc::new(
        FileSnapshotStore::new(".flowgraph/snapshots")
            .with_context(|| "Failed to create snapshot directory")?,
    );
    let limiter = engine.services().rate_limiter.clone();
    if let Err(err) = limiter.restore_from(snapshots.as_ref()).await {
        info!("no rate-limiter snapshot restored: {}", err);
    }
    {
        let limiter = limiter.clone();
        let snapshots = snapshots.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                ticker.tick().await;
                if shutdown.is_cancelled() {
                    break;
                }
                let _ = limiter.snapshot_to(snapshots.as_ref()).await;
            }
        });
    }

    let pool = WorkerPool::new(engine.clone());
    let scheduler = Scheduler::new(engine.clone());

    let pool_shutdown = shutdown.clone();
    let pool_handle = tokio::spawn(async move { pool.run(pool_shutdown).await });
    let scheduler_shutdown = shutdown.clone();
    let scheduler_handle =
        tokio::spawn(async move { scheduler.run(scheduler_shutdown).await });

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "Failed to listen for shutdown signal")?;
    println!("\n{}", "Shutting down...".yellow());
    shutdown.cancel();

    let _ = pool_handle.await;
    let _ = scheduler_handle.await;
    Ok(())
}

fn schedule_preview(cron: &str, timezone: &str, count: usize) -> Result<()> {
    let fires = preview_fires(cron, timezone, Utc::now(), count)
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!(
        "{} {} ({})",
        "Next fires for".cyan().bold(),
        cron,
        timezone
    );
    for fire in fires {
        println!("  {} {}", "●".green(), fire.to_rfc3339());
    }
    Ok(())
}

fn parse_input(input_str: &str) -> Result<Value> {
    // Check if input is a file path
    if Path::new(input_str).exists() {
        let content = fs::read_to_string(input_str)
            .with_context(|| format!("Failed to read input file: {}", input_str))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse input JSON from file: {}", input_str))
    } else {
        serde_json::from_str(input_str).with_context(|| "Failed to parse input JSON string")
    }
}
