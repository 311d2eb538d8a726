//! Command-line front end for the on-demand extension fetcher.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use pgext_core::{AppConfig, ExtensionName, PgMajorVersion, RemoteExtConfig};
use pgext_fetcher::{CatalogStatus, ExtensionRequestHandler, Readiness, RequestOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pgext")]
#[command(about = "Fetch database extensions on demand from a remote store")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Configuration file path
    #[arg(long, global = true, env = "PGEXT_CONFIG")]
    config: Option<PathBuf>,

    /// Remote store as JSON, e.g. '{"bucket": "ext", "region": "eu-central-1"}'
    /// (overrides the config file)
    #[arg(long, global = true)]
    remote_ext_config: Option<String>,

    /// Local cache root (overrides the config file)
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    /// Print Prometheus metrics when done
    #[arg(long, global = true, default_value_t = false)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Make extensions available in the local cache
    Fetch {
        /// Postgres major version (v15 or 15)
        #[arg(long)]
        pg_version: PgMajorVersion,

        /// Give up on an extension after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Extension names
        #[arg(required = true)]
        extensions: Vec<ExtensionName>,
    },
    /// List extensions known to the catalog
    Catalog {
        /// Postgres major version (v15 or 15)
        #[arg(long)]
        pg_version: PgMajorVersion,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Logs go to stderr; stdout carries the readiness report.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { global, command } = Cli::parse();

    let config = load_config(&global)?;
    let handler = pgext_fetcher::build(&config)
        .await
        .context("failed to initialize extension fetcher")?;

    let code = match command {
        Commands::Fetch {
            pg_version,
            timeout_ms,
            extensions,
        } => handle_fetch(&handler, pg_version, &extensions, timeout_ms).await,
        Commands::Catalog { pg_version } => handle_catalog(&handler, pg_version),
    };

    if global.metrics {
        print!("{}", pgext_fetcher::metrics::render());
    }
    Ok(code)
}

/// Config file, then `PGEXT_` environment variables, then command-line flags.
fn load_config(args: &GlobalArgs) -> Result<AppConfig> {
    let mut figment = Figment::new();

    if let Some(path) = &args.config {
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    }

    let mut config: AppConfig = figment
        .merge(Env::prefixed("PGEXT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    if let Some(json) = &args.remote_ext_config {
        config.remote =
            Some(RemoteExtConfig::from_json(json).context("invalid --remote-ext-config")?);
    }
    if let Some(root) = &args.cache_root {
        config.cache.root = root.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn handle_fetch(
    handler: &ExtensionRequestHandler,
    version: PgMajorVersion,
    extensions: &[ExtensionName],
    timeout_ms: Option<u64>,
) -> ExitCode {
    let reports: Vec<(ExtensionName, Readiness)> = match timeout_ms {
        None => handler.ensure_all(version, extensions).await,
        Some(ms) => {
            let options = RequestOptions::with_max_wait(Duration::from_millis(ms));
            let mut reports = Vec::with_capacity(extensions.len());
            for name in extensions {
                reports.push((name.clone(), handler.ensure_with(version, name, options).await));
            }
            reports
        }
    };

    let mut all_ready = true;
    for (name, readiness) in &reports {
        println!("{name}: {readiness}");
        all_ready &= readiness.is_ready();
    }

    if all_ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn handle_catalog(handler: &ExtensionRequestHandler, version: PgMajorVersion) -> ExitCode {
    match handler.catalog().status() {
        CatalogStatus::Disabled => {
            eprintln!("No remote extension store configured");
            return ExitCode::FAILURE;
        }
        CatalogStatus::Unavailable { reason } => {
            eprintln!("Catalog unavailable: {reason}");
            return ExitCode::FAILURE;
        }
        CatalogStatus::Ready { .. } => {}
    }

    for entry in handler.catalog().extensions(version) {
        println!("{} ({} files)", entry.name, entry.files.len());
    }
    ExitCode::SUCCESS
}
