//! ch-backup - Main entry point
//!
//! Backup and restore of ClickHouse data to S3-compatible storage.

use anyhow::{Context as _, Result};
use ch_backup::commands::{self, Context, OutputFormat};
use ch_backup::config::{Config, DEFAULT_CONFIG_PATH};
use ch_backup::coordinator::{AttachFailurePolicy, BackupOptions, BackupSelector, ReplicaNameStrategy, RestoreTarget};
use ch_backup::utils::{logger, shutdown::ShutdownCoordinator};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// ClickHouse protocol (http or https)
    #[arg(long, global = true)]
    protocol: Option<String>,

    /// ClickHouse host
    #[arg(long, global = true)]
    host: Option<String>,

    /// ClickHouse HTTP port
    #[arg(long, global = true)]
    port: Option<u16>,

    /// CA bundle for the ClickHouse TLS connection
    #[arg(long, value_name = "FILE", global = true)]
    ca_path: Option<PathBuf>,

    /// Skip TLS certificate verification for ClickHouse
    #[arg(long, global = true)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup
    Backup {
        /// Name template; {timestamp} and {uuid} are expanded
        #[arg(long)]
        name: Option<String>,
        /// Back up only these databases
        #[arg(short, long, value_delimiter = ',')]
        databases: Vec<String>,
        /// Back up only these tables (db.table)
        #[arg(short, long, value_delimiter = ',')]
        tables: Vec<String>,
        #[arg(long)]
        schema_only: bool,
        /// Labels recorded in the backup (key=value)
        #[arg(short = 'L', long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
        /// Back up even when the last backup is younger than backup.min_interval
        #[arg(short, long)]
        force: bool,
    },
    /// Restore a backup by name, LAST or list index
    Restore {
        backup: String,
        #[arg(short, long, value_delimiter = ',')]
        databases: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        exclude_databases: Vec<String>,
        #[arg(long)]
        schema_only: bool,
        /// Replica name for replicated tables
        #[arg(long)]
        override_replica_name: Option<String>,
        /// Abort when a part cannot be attached
        #[arg(long, conflicts_with = "skip_attach_errors")]
        fail_on_attach_error: bool,
        /// Skip parts that cannot be attached
        #[arg(long)]
        skip_attach_errors: bool,
    },
    /// List backups, newest first
    List {
        /// Include backups in every state
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        verbose: bool,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Print a backup manifest
    Show { name: String },
    /// Delete a backup and chunks no other backup uses
    Delete {
        name: String,
        /// Succeed without doing anything when the backup does not exist
        #[arg(short, long)]
        force: bool,
    },
    /// Apply the retention policy
    Purge {
        /// Also remove failed and partially deleted backups
        #[arg(long)]
        purge_partial: bool,
    },
    /// Print the tool version
    Version,
}

fn parse_label(value: &str) -> std::result::Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("label {value:?} must be key=value"))
}

fn load_config(cli: &Cli) -> Result<Config> {
    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    let path = cli
        .config
        .as_deref()
        .or_else(|| default_path.exists().then_some(default_path));

    let mut config = Config::load(path).context("failed to load configuration")?;

    if let Some(protocol) = &cli.protocol {
        config.clickhouse.protocol = protocol.clone();
    }
    if let Some(host) = &cli.host {
        config.clickhouse.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.clickhouse.port = port;
    }
    if let Some(ca_path) = &cli.ca_path {
        config.clickhouse.ca_path = Some(ca_path.clone());
    }
    if cli.insecure {
        config.clickhouse.insecure = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Command::Version) {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = load_config(&cli)?;
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    logger::init(log_level, &config.log.format)?;

    tracing::debug!("Starting ch-backup v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.install()?;
    let ctx = Context::new(config, shutdown.token()).await?;

    let output = match cli.command {
        Command::Backup {
            name,
            databases,
            tables,
            schema_only,
            labels,
            force,
        } => {
            let options = BackupOptions {
                name,
                databases,
                tables,
                schema_only,
                labels: labels.into_iter().collect::<BTreeMap<_, _>>(),
                force,
            };
            commands::backup(&ctx, ctx.clickhouse()?, options).await?
        }
        Command::Restore {
            backup,
            databases,
            exclude_databases,
            schema_only,
            override_replica_name,
            fail_on_attach_error,
            skip_attach_errors,
        } => {
            let selector: BackupSelector = backup.parse()?;
            let mut coordinator = ctx.restore_coordinator(ctx.clickhouse()?);
            if let Some(replica) = override_replica_name {
                coordinator = coordinator.with_replica_strategy(ReplicaNameStrategy::Override(replica));
            }
            if fail_on_attach_error {
                coordinator = coordinator.with_attach_policy(AttachFailurePolicy::Fail);
            } else if skip_attach_errors {
                coordinator = coordinator.with_attach_policy(AttachFailurePolicy::Skip);
            }

            let target = RestoreTarget {
                databases,
                exclude_databases,
                schema_only,
                ..RestoreTarget::new(selector)
            };
            commands::restore(&coordinator, &target).await?
        }
        Command::List { all, verbose, format } => commands::list(&ctx, all, verbose, format).await?,
        Command::Show { name } => commands::show(&ctx, &name).await?,
        Command::Delete { name, force } => commands::delete(&ctx, &name, force).await?,
        Command::Purge { purge_partial } => commands::purge(&ctx, purge_partial).await?,
        Command::Version => unreachable!("handled before configuration is loaded"),
    };

    println!("{output}");

    // Stop the signal listener.
    ctx.cancel.cancel();
    let _ = signals.await;
    Ok(())
}
