//! Command implementations behind the CLI.
//!
//! Each command builds the coordinator it needs from a shared [`Context`]
//! and renders its result as text for stdout.

use crate::clickhouse::{ClickhouseControl, ClickhouseCtl};
use crate::config::Config;
use crate::coordinator::{
    BackupCatalog, BackupCoordinator, BackupOptions, Layout, Manifest, PurgeReport, RestoreCoordinator,
    RestoreReport, RestoreTarget, RetentionManager, SweepReport,
};
use crate::storage::StorageClient;
use crate::transfer::{format_bytes, format_duration};
use crate::utils::errors::Result;
use clap::ValueEnum;
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

/// Everything commands share for one process run
pub struct Context {
    pub config: Arc<Config>,
    pub storage: Arc<StorageClient>,
    pub cancel: CancellationToken,
}

impl Context {
    pub async fn new(config: Config, cancel: CancellationToken) -> Result<Self> {
        let storage = StorageClient::from_config(&config).await?;
        Ok(Self {
            config: Arc::new(config),
            storage: Arc::new(storage),
            cancel,
        })
    }

    pub fn catalog(&self) -> BackupCatalog {
        BackupCatalog::new(Arc::clone(&self.storage), Layout::new(&self.config.backup.path_root))
    }

    pub fn clickhouse(&self) -> Result<Arc<dyn ClickhouseControl>> {
        Ok(Arc::new(ClickhouseCtl::new(&self.config.clickhouse)?))
    }

    pub fn backup_coordinator(&self, clickhouse: Arc<dyn ClickhouseControl>) -> BackupCoordinator {
        BackupCoordinator::new(Arc::clone(&self.config), Arc::clone(&self.storage), clickhouse)
            .with_cancel(self.cancel.clone())
    }

    pub fn restore_coordinator(&self, clickhouse: Arc<dyn ClickhouseControl>) -> RestoreCoordinator {
        RestoreCoordinator::new(Arc::clone(&self.config), Arc::clone(&self.storage), clickhouse)
            .with_cancel(self.cancel.clone())
    }

    pub fn retention(&self) -> Result<RetentionManager> {
        RetentionManager::new(Arc::clone(&self.config), Arc::clone(&self.storage))
    }
}

pub async fn backup(ctx: &Context, clickhouse: Arc<dyn ClickhouseControl>, options: BackupOptions) -> Result<String> {
    let manifest = ctx.backup_coordinator(clickhouse).create_backup(options).await?;
    Ok(manifest.name().to_string())
}

pub async fn restore(coordinator: &RestoreCoordinator, target: &RestoreTarget) -> Result<String> {
    let report = coordinator.restore_backup(target).await?;
    Ok(render_restore(&report))
}

pub async fn list(ctx: &Context, all: bool, verbose: bool, format: OutputFormat) -> Result<String> {
    let manifests = ctx.catalog().list_all().await?;
    let manifests: Vec<Manifest> = if all {
        manifests
    } else {
        manifests.into_iter().filter(Manifest::is_restorable).collect()
    };
    render_list(&manifests, verbose, format)
}

pub async fn show(ctx: &Context, name: &str) -> Result<String> {
    let manifest = ctx.catalog().load(name).await?;
    Ok(String::from_utf8_lossy(&manifest.to_json()?).into_owned())
}

/// With `force`, a missing backup is reported instead of failing.
pub async fn delete(ctx: &Context, name: &str, force: bool) -> Result<String> {
    let retention = ctx.retention()?;
    let sweep = if force {
        retention.delete_if_exists(name).await?
    } else {
        Some(retention.delete_backup(name).await?)
    };
    Ok(render_delete(name, sweep.as_ref()))
}

pub async fn purge(ctx: &Context, purge_partial: bool) -> Result<String> {
    let report = ctx.retention()?.purge(purge_partial).await?;
    Ok(render_purge(&report))
}

/// One line of `list` output
#[derive(Debug, Serialize)]
struct ListRow<'a> {
    /// Position accepted by `restore`, only for created backups
    index: Option<usize>,
    name: &'a str,
    state: &'a str,
    start_time: String,
    end_time: Option<String>,
    size: u64,
    real_size: u64,
    ch_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a std::collections::BTreeMap<String, String>>,
}

/// Render manifests ordered newest first.
pub fn render_list(manifests: &[Manifest], verbose: bool, format: OutputFormat) -> Result<String> {
    let mut next_index = 0;
    let rows: Vec<ListRow> = manifests
        .iter()
        .map(|m| {
            let index = m.is_restorable().then(|| {
                next_index += 1;
                next_index - 1
            });
            ListRow {
                index,
                name: m.name(),
                state: m.meta.state.as_str(),
                start_time: m.meta.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                end_time: m.meta.end_time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
                size: m.meta.bytes,
                real_size: m.meta.real_bytes,
                ch_version: &m.meta.ch_version,
                hostname: verbose.then_some(m.meta.hostname.as_str()),
                labels: verbose.then_some(&m.meta.labels),
            }
        })
        .collect();

    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(&rows)?);
    }

    let mut out = String::new();
    let _ = write!(
        out,
        "{:>3}  {:<24} {:<18} {:<20} {:<20} {:>12} {:>12}  {}",
        "#", "NAME", "STATE", "START", "END", "SIZE", "REAL SIZE", "CH VERSION"
    );
    if verbose {
        out.push_str("  HOSTNAME  LABELS");
    }
    out.push('\n');

    for row in &rows {
        let _ = write!(
            out,
            "{:>3}  {:<24} {:<18} {:<20} {:<20} {:>12} {:>12}  {}",
            row.index.map_or_else(|| "-".to_string(), |i| i.to_string()),
            row.name,
            row.state,
            row.start_time,
            row.end_time.as_deref().unwrap_or("-"),
            format_bytes(row.size),
            format_bytes(row.real_size),
            row.ch_version,
        );
        if verbose {
            let labels: Vec<String> = row
                .labels
                .into_iter()
                .flatten()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            let _ = write!(out, "  {}  {}", row.hostname.unwrap_or("-"), labels.join(","));
        }
        out.push('\n');
    }
    Ok(out)
}

pub fn render_restore(report: &RestoreReport) -> String {
    let mut out = format!(
        "Restored {}: {} table(s) created, {} reused, {} part(s) attached, {} already present, {} downloaded in {}",
        report.backup,
        report.tables_created.len(),
        report.tables_reused.len(),
        report.parts_attached,
        report.parts_present,
        format_bytes(report.transfer.downloaded_bytes),
        format_duration(report.transfer.elapsed.as_secs()),
    );
    for skipped in &report.parts_skipped {
        let _ = write!(out, "\nskipped {} part {}: {}", skipped.table, skipped.part, skipped.reason);
    }
    out
}

fn render_sweep(sweep: &SweepReport) -> String {
    format!(
        "{} chunk(s) removed, {} freed",
        sweep.deleted_chunks,
        format_bytes(sweep.freed_bytes)
    )
}

fn render_delete(name: &str, sweep: Option<&SweepReport>) -> String {
    match sweep {
        Some(sweep) => format!("Deleted {name}; {}", render_sweep(sweep)),
        None => format!("Backup {name} does not exist, nothing deleted"),
    }
}

fn render_purge(report: &PurgeReport) -> String {
    if report.deleted_backups.is_empty() {
        return format!("No backups purged; {}", render_sweep(&report.sweep));
    }
    format!(
        "Purged {}; {}",
        report.deleted_backups.join(", "),
        render_sweep(&report.sweep)
    )
}
