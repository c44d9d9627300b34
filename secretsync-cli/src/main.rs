use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use secretsync_aws_orgs::AwsOrgsRegistry;
use secretsync_aws_sm::{AwsSmDestinationProvider, AwsSmSettings};
use secretsync_core::autodetect::auto_detect_clients;
use secretsync_core::config::Config;
use secretsync_core::format::{render_report, OutputFormat};
use secretsync_core::graph::TargetGraph;
use secretsync_core::pipeline::{Operation, Options, Pipeline};
use secretsync_s3::S3MergeStore;
use secretsync_spec::{AccountRegistry, MergeStore, SecretSource};
use secretsync_vault_kv::{VaultAuth, VaultHandle, VaultKvSource, VaultMergeStore, VaultSettings};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "secretsync",
    version,
    about = "Synchronize secrets from Vault to cloud secret managers across accounts"
)]
struct Cli {
    /// Config file path.
    #[arg(long, global = true, env = "SECRETSYNC_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (debug, info, warn, error). Overrides the config file.
    #[arg(long, global = true, env = "SECRETSYNC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json). Overrides the config file.
    #[arg(long, global = true, env = "SECRETSYNC_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the merge and sync pipeline.
    Pipeline(PipelineArgs),
    /// Load and validate the configuration.
    Validate,
    /// Print the target dependency graph and processing order.
    Graph,
    /// Print version information.
    Version,
}

#[derive(Args)]
struct PipelineArgs {
    /// Comma-separated list of targets (default: all).
    #[arg(long, env = "SECRETSYNC_TARGETS")]
    targets: Option<String>,

    /// Only run the merge phase.
    #[arg(long, env = "SECRETSYNC_MERGE_ONLY", conflicts_with = "sync_only")]
    merge_only: bool,

    /// Only run the sync phase.
    #[arg(long, env = "SECRETSYNC_SYNC_ONLY")]
    sync_only: bool,

    /// Compute diffs without applying any change.
    #[arg(long, env = "SECRETSYNC_DRY_RUN")]
    dry_run: bool,

    /// Expand dynamic targets from the upstream account registry.
    #[arg(long, env = "SECRETSYNC_DISCOVER")]
    discover: bool,

    /// Output format: human, json, github, compact, side-by-side.
    #[arg(short = 'o', long, env = "SECRETSYNC_OUTPUT", default_value = "human")]
    output: String,

    /// Compute and show the diff even when applying changes.
    #[arg(long, env = "SECRETSYNC_DIFF")]
    diff: bool,

    /// Use CI exit codes: 0 = clean, 1 = changes, 2 = errors.
    #[arg(long, env = "SECRETSYNC_EXIT_CODE")]
    exit_code: bool,

    /// Render secret values instead of masking them.
    #[arg(long, env = "SECRETSYNC_UNMASK")]
    unmask: bool,

    /// Abort a target at its first secret write failure instead of
    /// accumulating errors.
    #[arg(long, env = "SECRETSYNC_FAIL_FAST")]
    fail_fast: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Version) {
        println!("secretsync {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    init_logging(&cli, &config);
    config.apply_auto_detection(&auto_detect_clients());

    match cli.command {
        Command::Pipeline(args) => run_pipeline(config, args).await,
        Command::Validate => run_validate(config),
        Command::Graph => run_graph(config),
        Command::Version => unreachable!("handled above"),
    }
}

fn init_logging(cli: &Cli, config: &Config) {
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.log.format.clone());

    let filter = tracing_subscriber::EnvFilter::try_new(&level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run_pipeline(config: Config, args: PipelineArgs) -> Result<()> {
    let format: OutputFormat = args.output.parse()?;

    let needs_vault = config.merge_store.vault.is_some()
        || config.sources.values().any(|source| source.vault.is_some());
    let vault = if needs_vault {
        Some(vault_handle(&config).await?)
    } else {
        None
    };

    let merge_store = build_merge_store(&config, vault.as_ref()).await?;
    let destinations = Arc::new(AwsSmDestinationProvider::new(AwsSmSettings::default()).await);

    let mut pipeline = Pipeline::new(config.clone(), merge_store, destinations);
    for (name, source) in build_sources(&config, vault.as_ref()) {
        pipeline = pipeline.with_source(name, source);
    }
    if args.discover {
        let registry: Arc<dyn AccountRegistry> = Arc::new(AwsOrgsRegistry::new().await);
        pipeline = pipeline.with_registry(registry);
    }

    // Ctrl-C stops admitting new targets; in-flight work drains.
    let cancel = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received shutdown signal, cancelling run");
            cancel.cancel();
        }
    });

    let operation = if args.merge_only {
        Operation::MergeOnly
    } else if args.sync_only {
        Operation::SyncOnly
    } else {
        Operation::Pipeline
    };
    let targets = args
        .targets
        .as_deref()
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let report = pipeline
        .run(Options {
            operation,
            targets,
            dry_run: args.dry_run,
            continue_on_error: !args.fail_fast,
            compute_diff: args.diff || args.dry_run,
            discover: args.discover,
        })
        .await?;

    print!("{}", render_report(&report, format, args.unmask));

    if args.exit_code {
        std::process::exit(report.exit_code());
    }
    if !report.success() {
        bail!("pipeline completed with errors");
    }
    Ok(())
}

fn run_validate(config: Config) -> Result<()> {
    config.validate()?;
    println!(
        "Configuration OK: {} sources, {} targets, {} dynamic targets",
        config.sources.len(),
        config.targets.len(),
        config.dynamic_targets.len()
    );
    Ok(())
}

fn run_graph(config: Config) -> Result<()> {
    config.validate()?;
    let graph = TargetGraph::build(&config.targets);

    println!("Processing order:");
    for (index, name) in graph.topological_order().iter().enumerate() {
        let target = &config.targets[name];
        let kind = if graph.is_inherited(name) {
            "inherited"
        } else {
            "leaf"
        };
        println!(
            "  {}. {name} [{kind}] imports: {}",
            index + 1,
            if target.imports.is_empty() {
                "(none)".to_string()
            } else {
                target.imports.join(", ")
            }
        );
    }
    Ok(())
}

fn build_sources(
    config: &Config,
    vault: Option<&Arc<VaultHandle>>,
) -> Vec<(String, Arc<dyn SecretSource>)> {
    let mut sources: Vec<(String, Arc<dyn SecretSource>)> = Vec::new();
    for (name, source) in &config.sources {
        match (&source.vault, vault) {
            (Some(mount), Some(handle)) => {
                sources.push((
                    name.clone(),
                    Arc::new(VaultKvSource::new(Arc::clone(handle), mount.mount.clone()))
                        as Arc<dyn SecretSource>,
                ));
            }
            (Some(_), None) => {
                warn!(source = %name, "vault source configured but no vault handle available");
            }
            (None, _) => {
                warn!(source = %name, "source has no driver configuration, imports of it resolve to empty trees");
            }
        }
    }
    sources
}

async fn build_merge_store(
    config: &Config,
    vault: Option<&Arc<VaultHandle>>,
) -> Result<Arc<dyn MergeStore>> {
    if let Some(s3) = &config.merge_store.s3 {
        return Ok(Arc::new(
            S3MergeStore::new(s3.bucket.clone(), s3.prefix.clone()).await,
        ));
    }
    if let Some(store) = &config.merge_store.vault {
        let handle = vault
            .cloned()
            .context("vault merge store configured but no vault handle available")?;
        return Ok(Arc::new(VaultMergeStore::new(handle, store.mount.clone())));
    }
    bail!("no merge store configured: set merge_store.vault or merge_store.s3")
}

async fn vault_handle(config: &Config) -> Result<Arc<VaultHandle>> {
    if config.vault.address.is_empty() {
        bail!("vault address is not configured and could not be auto-detected");
    }

    let auth = if let Some(token) = &config.vault.auth.token {
        VaultAuth::Token {
            token: token.token.clone(),
        }
    } else if let Some(approle) = &config.vault.auth.approle {
        VaultAuth::AppRole {
            mount: approle.mount.clone(),
            role_id: approle.role_id.clone(),
            secret_id: approle.secret_id.clone(),
        }
    } else if let Some(kubernetes) = &config.vault.auth.kubernetes {
        VaultAuth::Kubernetes {
            role: kubernetes.role.clone(),
            mount_path: kubernetes.mount_path.clone(),
        }
    } else {
        bail!("no vault auth configured: set vault.auth.token, approle, or kubernetes");
    };

    let settings = VaultSettings {
        address: config.vault.address.clone(),
        namespace: (!config.vault.namespace.is_empty()).then(|| config.vault.namespace.clone()),
        auth,
    };
    let handle = VaultHandle::connect(&settings)
        .await
        .context("failed to authenticate against vault")?;
    Ok(handle)
}
