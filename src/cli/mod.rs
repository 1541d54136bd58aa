//! Command-line interface for conductor.
//!
//! Provides commands for sending a message to a thread, resuming an
//! interrupted run, inspecting a thread and listing threads.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::adapters::{
    CommandCapability, FanoutEmitter, FileBlobStore, HashedIdentity, IdentityResolver,
    TracingEmitter,
};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    Builder, Capabilities, CheckpointKey, CheckpointStore, Engine, EventLog, FileCheckpointStore,
    RunInput, RunOutcome,
};
use crate::domain::{ProductType, RunStatus};

/// Namespace used when no credential is given
pub const DEFAULT_NAMESPACE: &str = "default";

/// conductor - plan-and-supervise orchestration engine
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Credential identifying the caller (hashed into a namespace)
    #[arg(short, long, global = true, env = "CONDUCTOR_USER")]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a message to a thread
    Run {
        /// Message text (reads --input or stdin if not provided)
        message: Option<String>,

        /// Input file
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Thread ID (a new thread is started if not provided)
        #[arg(short, long)]
        thread: Option<String>,

        /// Product type for this thread
        #[arg(short, long, value_enum)]
        product: Option<ProductArg>,
    },

    /// Resume an interrupted run from its last checkpoint
    Resume {
        /// Thread ID to resume
        thread: String,
    },

    /// Show the state of a thread
    Status {
        /// Thread ID
        thread: String,
    },

    /// List threads in the caller's namespace
    Threads {
        /// Maximum number of threads to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Product type argument
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProductArg {
    Slide,
    Comic,
    DataReport,
}

impl From<ProductArg> for ProductType {
    fn from(p: ProductArg) -> Self {
        match p {
            ProductArg::Slide => ProductType::Slide,
            ProductArg::Comic => ProductType::Comic,
            ProductArg::DataReport => ProductType::DataReport,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::load_config()?;
        let namespace = resolve_namespace(self.user.as_deref()).await?;

        match self.command {
            Commands::Run {
                message,
                input,
                thread,
                product,
            } => run_message(&cfg, &namespace, message, input, thread, product).await,
            Commands::Resume { thread } => resume_thread(&cfg, &namespace, &thread).await,
            Commands::Status { thread } => show_status(&cfg, &namespace, &thread).await,
            Commands::Threads { limit } => list_threads(&cfg, &namespace, limit).await,
            Commands::Config => show_config(&cfg, &namespace),
        }
    }
}

/// Map an optional credential to a namespace
async fn resolve_namespace(user: Option<&str>) -> Result<String> {
    match user {
        Some(credential) => HashedIdentity::default()
            .resolve(credential)
            .await
            .context("Failed to resolve user namespace"),
        None => Ok(DEFAULT_NAMESPACE.to_string()),
    }
}

/// Assemble an engine writing to this thread's directory
fn build_engine(cfg: &ResolvedConfig, key: &CheckpointKey) -> Result<Engine> {
    let command = cfg.generation.command.clone().with_context(|| {
        format!(
            "No generation command configured. Set {} or generation.command in .conductor/config.yaml",
            config::GENERATION_COMMAND_ENV
        )
    })?;
    let backend = Arc::new(CommandCapability::new(command, cfg.generation.args.clone()));
    let blobs = Arc::new(FileBlobStore::new(cfg.blobs_dir()));
    let capabilities = Capabilities::uniform(backend.clone(), backend, blobs);

    let store = Arc::new(FileCheckpointStore::new(cfg.threads_dir()));

    let log = EventLog::for_thread_dir(&store.thread_dir(&key.namespace, &key.thread_id))?;
    let emitter = FanoutEmitter::new().with(TracingEmitter).with(log);

    Builder::new(cfg.engine.clone(), capabilities)
        .emitter(Arc::new(emitter))
        .title_store(store.clone())
        .build(store)
}

/// Read the message from the argument, a file or piped stdin
fn read_message(message: Option<String>, input_file: Option<PathBuf>) -> Result<String> {
    let text = if let Some(text) = message {
        text
    } else if let Some(path) = input_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No message provided. Pass it as an argument, use --input <file> or pipe to stdin");
    };

    if text.trim().is_empty() {
        anyhow::bail!("Message is empty");
    }
    Ok(text)
}

/// Send one message to a thread
async fn run_message(
    cfg: &ResolvedConfig,
    namespace: &str,
    message: Option<String>,
    input_file: Option<PathBuf>,
    thread: Option<String>,
    product: Option<ProductArg>,
) -> Result<()> {
    let text = read_message(message, input_file)?;
    let thread_id = thread.unwrap_or_else(|| Uuid::new_v4().to_string());
    let key = CheckpointKey::new(namespace, thread_id);

    let engine = build_engine(cfg, &key)?;

    let mut input = RunInput::new(text);
    if let Some(product) = product {
        input = input.with_product_type(product.into());
    }

    let outcome = engine.invoke(&key, input).await?;
    report(&key, &outcome)
}

/// Resume an interrupted thread
async fn resume_thread(cfg: &ResolvedConfig, namespace: &str, thread: &str) -> Result<()> {
    let key = CheckpointKey::new(namespace, thread);
    let engine = build_engine(cfg, &key)?;

    let outcome = engine.resume(&key).await?;
    report(&key, &outcome)
}

/// Print the final reply and the run status
fn report(key: &CheckpointKey, outcome: &RunOutcome) -> Result<()> {
    if let Some(reply) = outcome.state.last_assistant_message() {
        println!("{}", reply.content);
    }

    match &outcome.status {
        RunStatus::Completed | RunStatus::Replied => {
            eprintln!(
                "\n[Thread {} {} after {} steps]",
                key.thread_id,
                outcome.status.label(),
                outcome.steps_taken
            );
        }
        RunStatus::Rejected { reason } => {
            eprintln!("\n[Thread {} plan rejected: {}]", key.thread_id, reason);
        }
        RunStatus::Failed { error } => {
            eprintln!("\n[Thread {} failed: {}]", key.thread_id, error);
            std::process::exit(1);
        }
        RunStatus::Aborted { reason } => {
            eprintln!("\n[Thread {} stopped: {}]", key.thread_id, reason);
            std::process::exit(1);
        }
        RunStatus::Running => {
            eprintln!("\n[Thread {} still running]", key.thread_id);
        }
    }

    Ok(())
}

/// Show the checkpointed state of a thread
async fn show_status(cfg: &ResolvedConfig, namespace: &str, thread: &str) -> Result<()> {
    let store = FileCheckpointStore::new(cfg.threads_dir());
    let key = CheckpointKey::new(namespace, thread);
    let checkpoint = store
        .load(&key)
        .await?
        .with_context(|| format!("Thread not found: {}", thread))?;
    let state = &checkpoint.state;

    println!("Thread: {}", key.thread_id);
    if let Some(title) = &state.title {
        println!("Title: {}", title);
    }
    if let Some(product) = state.product_type {
        println!("Product: {}", product);
    }
    println!("Status: {}", state.status.label());
    println!("Next: {}", checkpoint.next);
    println!("Saved: {}", checkpoint.saved_at);
    println!("Steps taken: {}", checkpoint.steps_taken);

    if !state.plan.is_empty() {
        println!("\nPlan:");
        for step in &state.plan {
            println!("  [{:?}] {}", step.status, step.label());
            if let Some(summary) = &step.result_summary {
                println!("      {}", summary);
            }
        }
    }

    if !state.artifacts.is_empty() {
        println!("\nArtifacts:");
        for (name, artifact) in &state.artifacts {
            let marker = if artifact.is_degraded() { " (degraded)" } else { "" };
            println!("  {}{}", name, marker);
        }
    }

    Ok(())
}

/// List threads in a namespace
async fn list_threads(cfg: &ResolvedConfig, namespace: &str, limit: usize) -> Result<()> {
    let store = FileCheckpointStore::new(cfg.threads_dir());
    let threads = store.list(namespace).await?;

    if threads.is_empty() {
        println!("No threads found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<40}", "THREAD ID", "STATUS", "TITLE");
    println!("{}", "-".repeat(90));

    for thread in threads.into_iter().take(limit) {
        println!(
            "{:<38} {:<12} {:<40}",
            thread.thread_id,
            thread.status,
            thread.title.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &ResolvedConfig, namespace: &str) -> Result<()> {
    let limits = &cfg.engine.limits;
    let research = &cfg.engine.research;

    println!("Conductor configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Namespace:   {}", namespace);
    println!();
    println!("Paths:");
    println!("  Home:    {}", cfg.home.display());
    println!("  Threads: {}", cfg.threads_dir().display());
    println!("  Blobs:   {}", cfg.blobs_dir().display());
    println!();
    println!("Generation:");
    println!(
        "  Command: {}",
        cfg.generation.command.as_deref().unwrap_or("(not configured)")
    );
    if !cfg.generation.args.is_empty() {
        println!("  Args:    {}", cfg.generation.args.join(" "));
    }
    println!("  Default product: {}", cfg.engine.default_product_type);
    println!();
    println!("Safety limits:");
    println!("  Max graph steps:    {}", limits.max_graph_steps);
    println!("  Max research steps: {}", limits.max_research_steps);
    println!("  Max retries:        {}", limits.max_retries);
    println!("  Step timeout:       {}s", limits.step_timeout_seconds);
    println!("  Run timeout:        {}s", limits.run_timeout_seconds);
    println!();
    println!("Research:");
    println!("  Parallelism: {}", research.parallelism);
    println!("  Tasks:       {}..={}", research.min_tasks, research.max_tasks);

    Ok(())
}
