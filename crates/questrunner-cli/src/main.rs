//! # `questrunner` — the Quest Runner CLI
//!
//! Loads a collection file, layers `RuntimeOptions` from a config file, an
//! optional named profile, and CLI flags/env vars (outermost wins), runs it
//! through the [`questrunner_core::Scheduler`] against the workspace's
//! concrete HTTP/auth plugins, and prints a report.

mod config;
mod registry;
mod report;
mod vault;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use questrunner_core::{
    Collection, CollectionValidator, EnvironmentSpec, ExecutionOptions, RuntimeOptions, Scheduler,
    SslOptions, TimeoutOptions,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "questrunner")]
#[command(about = "Runs an API collection through the Quest Runner execution engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Log level (error, warn, info, debug, trace), overridden by RUST_LOG.
    #[arg(short = 'v', long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Statically validate a collection without executing anything.
    Validate(ValidateArgs),
    /// Run a collection end-to-end and print a report.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct ValidateArgs {
    /// Path to the collection file (YAML or JSON).
    collection: PathBuf,
}

#[derive(clap::Args)]
struct RunArgs {
    /// Path to the collection file (YAML or JSON).
    collection: PathBuf,

    /// Layered config file (YAML or JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Named profile within `--config` to apply.
    #[arg(short, long)]
    profile: Option<String>,

    /// Iteration data file (JSON array), overriding the collection's own.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Clamp the number of iterations; non-positive values are ignored.
    #[arg(long)]
    iterations: Option<i64>,

    /// Allow sibling items to run concurrently.
    #[arg(long)]
    allow_parallel: bool,

    /// Bound on concurrently-running request nodes.
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Abort the run on the first failed assertion or script error.
    #[arg(long)]
    bail: bool,

    /// Per-request timeout, in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Active environment name, for `quest.environment.name`.
    #[arg(long)]
    env_name: Option<String>,

    /// Write the full JSON run result to this path.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Encrypted vault file to resolve `--vault-var` entries against.
    #[arg(long, requires = "vault_key_env")]
    vault_file: Option<PathBuf>,

    /// Environment variable holding the vault passphrase.
    #[arg(long)]
    vault_key_env: Option<String>,

    /// `NAME=dot.path` entries seeded into global variables from the vault.
    #[arg(long = "vault-var")]
    vault_vars: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Validate(args) => run_validate(args).await,
        Commands::Run(args) => run_run(args).await,
    }
}

fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn load_collection(path: &PathBuf) -> Result<Collection> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read collection file {}", path.display()))?;
    let is_yaml = matches!(path.extension().and_then(|s| s.to_str()), Some("yaml") | Some("yml"));
    let collection = if is_yaml {
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse collection YAML {}", path.display()))?
    } else {
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse collection JSON {}", path.display()))?
    };
    Ok(collection)
}

async fn run_validate(args: ValidateArgs) -> Result<()> {
    let collection = load_collection(&args.collection).await?;
    let protocol = registry::resolve_protocol(&collection.protocol)?;
    let auth_plugins = registry::all_auth_plugins();
    let auth_refs: HashMap<String, &dyn questrunner_plugin::AuthPlugin> =
        auth_plugins.iter().map(|(k, v)| (k.clone(), v.as_ref())).collect();

    let validator = CollectionValidator::new(protocol.as_ref(), auth_refs, true);
    let errors = validator.validate(&collection);
    if errors.is_empty() {
        println!("Collection is valid.");
        Ok(())
    } else {
        for error in &errors {
            println!("[{:?}] {}", error.source, error.message);
        }
        std::process::exit(1);
    }
}

async fn run_run(args: RunArgs) -> Result<()> {
    let collection = load_collection(&args.collection).await?;

    let file_config = match &args.config {
        Some(path) => {
            let loaded = config::load_config(path).await?;
            config::apply_profile(loaded, args.profile.as_deref())?
        }
        None => config::ConfigFile::default(),
    };

    let mut global_variables: HashMap<String, Value> = HashMap::new();
    if let Some(vault_file) = &args.vault_file {
        let key_env = args
            .vault_key_env
            .as_deref()
            .context("--vault-key-env is required alongside --vault-file")?;
        let resolved = vault::resolve_vault_vars(vault_file, key_env, &args.vault_vars).await?;
        global_variables.extend(resolved);
    }

    let data = match &args.data {
        Some(path) => {
            let contents = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read data file {}", path.display()))?;
            let rows: Vec<Value> = serde_json::from_str(&contents)
                .with_context(|| format!("data file {} is not a JSON array", path.display()))?;
            Some(rows)
        }
        None => None,
    };

    let options = RuntimeOptions {
        global_variables,
        environment: args.env_name.map(|name| EnvironmentSpec {
            name: Some(name),
            vars: HashMap::new(),
        }),
        data,
        iterations: args.iterations.or(file_config.iterations),
        strict_mode: file_config.strict_mode.unwrap_or(true),
        timeout: TimeoutOptions {
            request: args.timeout_ms.or(file_config.request_timeout_ms),
        },
        ssl: SslOptions::default(),
        proxy: questrunner_core::ProxyOptions::default(),
        follow_redirects: file_config.follow_redirects.unwrap_or(false),
        max_redirects: file_config.max_redirects.unwrap_or(0),
        execution: ExecutionOptions {
            allow_parallel: args.allow_parallel || file_config.execution.allow_parallel.unwrap_or(false),
            max_concurrency: args
                .max_concurrency
                .or(file_config.execution.max_concurrency)
                .unwrap_or(1),
            bail: args.bail || file_config.execution.bail.unwrap_or(false),
        },
        plugins: HashMap::new(),
    };

    let protocol = registry::resolve_protocol(&collection.protocol)?;
    let auth_plugins = registry::all_auth_plugins();
    let scheduler = Scheduler::new(protocol, auth_plugins, 8);

    let result = match scheduler.run(&collection, options).await {
        Ok(result) => result,
        Err(questrunner_core::Error::ScriptFailed { message, partial_result }) => {
            tracing::error!("run failed: uncaught script error: {message}");
            *partial_result
        }
        Err(other) => return Err(other.into()),
    };

    report::print_summary(&result);
    if let Some(out) = &args.out {
        report::write_json_report(&result, out).await?;
    }
    std::process::exit(report::exit_code(&result));
}
