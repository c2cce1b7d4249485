//! CLI command implementations

use crate::output::{
    format_bytes, format_progress, format_speed, short_id, source_host, status_icon, truncate,
};
use crate::progress::TransferProgress;
use crate::{ConfigAction, OutputFormat, LOCAL_OWNER};
use anyhow::Result;
use console::style;
use rangedl_core::TransferEngine;
use rangedl_types::{Settings, Transfer, TransferStatus};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tabled::{Table, Tabled};
use uuid::Uuid;

const REFRESH: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("No transfer matches '{0}'")]
    NoMatch(String),

    #[error("'{0}' matches more than one transfer, use more characters")]
    Ambiguous(String),

    #[error("Unknown status '{0}' (queued, running, paused, completed, canceled, error)")]
    UnknownStatus(String),

    #[error("Unknown config key: {0}")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

/// Full UUID, or a prefix unique among the local transfers
async fn resolve_id(engine: &TransferEngine, input: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(input) {
        return Ok(id);
    }

    let needle = input.to_lowercase();
    let matches: Vec<Uuid> = engine
        .control()
        .transfers(LOCAL_OWNER)
        .await?
        .into_iter()
        .map(|t| t.id)
        .filter(|id| id.to_string().starts_with(&needle))
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(CliError::NoMatch(input.to_string()).into()),
        _ => Err(CliError::Ambiguous(input.to_string()).into()),
    }
}

#[derive(Tabled)]
struct TransferRow {
    id: String,
    name: String,
    source: String,
    status: String,
    progress: String,
    segments: String,
}

fn transfer_row(transfer: &Transfer) -> TransferRow {
    TransferRow {
        id: short_id(&transfer.id),
        name: truncate(&transfer.file_name, 40),
        source: source_host(&transfer.url),
        status: transfer.status.to_string(),
        progress: format!("{:.1}%", transfer.progress()),
        segments: if transfer.range_supported { "ranged" } else { "single" }.to_string(),
    }
}

fn print_transfer_summary(transfer: &Transfer) {
    println!(
        "{} {} [{}]",
        status_icon(transfer.status),
        style(&transfer.file_name).bold(),
        short_id(&transfer.id)
    );
    println!(
        "    {} ({:.1}%)",
        format_progress(transfer.received, transfer.total_size),
        transfer.progress()
    );
}

fn print_transfers(transfers: &[Transfer], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(transfers)?);
        }
        OutputFormat::Table => {
            let rows: Vec<TransferRow> = transfers.iter().map(transfer_row).collect();
            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for transfer in transfers {
                print_transfer_summary(transfer);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Driving Transfers
// ============================================================================

/// What `drive` waits on
enum Watch {
    /// A single transfer
    Only(Uuid),
    /// Every transfer that is running while we watch
    AllRunning,
}

/// Poll the store until no watched transfer is running. Ctrl-C pauses them.
async fn drive(engine: &TransferEngine, watch: Watch, format: OutputFormat) -> Result<Vec<Transfer>> {
    let control = engine.control();
    let mut progress = TransferProgress::new(format == OutputFormat::Human)?;
    let mut watched: HashSet<Uuid> = HashSet::new();
    if let Watch::Only(id) = watch {
        watched.insert(id);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interval = tokio::time::interval(REFRESH);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                for id in &watched {
                    if let Err(e) = control.pause(LOCAL_OWNER, *id).await {
                        tracing::debug!("Not pausing {}: {}", id, e);
                    }
                }
            }
        }

        let transfers = control.transfers(LOCAL_OWNER).await?;
        if matches!(watch, Watch::AllRunning) && !interrupted {
            watched.extend(
                transfers
                    .iter()
                    .filter(|t| t.status == TransferStatus::Running)
                    .map(|t| t.id),
            );
        }

        let current: Vec<Transfer> = transfers
            .into_iter()
            .filter(|t| watched.contains(&t.id))
            .collect();
        for transfer in &current {
            progress.update(transfer, engine.meter().state(transfer.id));
        }

        let busy = current.iter().any(|t| t.status == TransferStatus::Running);
        // a watched transfer deleted from elsewhere simply drops out
        if !busy {
            progress.clear();
            return Ok(current);
        }
    }
}

/// Human summary after `drive` returns
fn report(transfers: &[Transfer], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Human => {
            for transfer in transfers {
                let line = match transfer.status {
                    TransferStatus::Completed => format!(
                        "{} Saved {} ({})",
                        style("✓").green().bold(),
                        transfer
                            .destination()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| transfer.file_name.clone()),
                        format_bytes(transfer.received)
                    ),
                    TransferStatus::Paused => format!(
                        "{} Paused {} at {}, resume with `rangedl resume {}` and `rangedl run`",
                        style("⏸").yellow(),
                        transfer.file_name,
                        format_progress(transfer.received, transfer.total_size),
                        short_id(&transfer.id)
                    ),
                    TransferStatus::Error => format!(
                        "{} {} failed, see `rangedl info {}`",
                        style("✗").red().bold(),
                        transfer.file_name,
                        short_id(&transfer.id)
                    ),
                    _ => format!("{} {} {}", status_icon(transfer.status), transfer.file_name, transfer.status),
                };
                println!("{}", line);
            }
            Ok(())
        }
        _ => print_transfers(transfers, format),
    }
}

pub struct GetRequest {
    pub url: String,
    pub save_dir: Option<PathBuf>,
    pub file_name: Option<String>,
    pub segments: Option<u32>,
    pub limit: Option<u64>,
}

/// Add, start and drive a single transfer. `--segments` and `--limit` hold
/// for the duration of the command only.
pub async fn get(engine: &TransferEngine, request: GetRequest, format: OutputFormat) -> Result<()> {
    let control = engine.control();
    let saved = control.settings(LOCAL_OWNER).await?;

    // without -o and without a configured default, save next to the user
    let save_dir = match request.save_dir {
        Some(dir) => Some(dir),
        None if saved.default_save_dir.is_some() => None,
        None => Some(std::env::current_dir()?),
    };

    let overridden = request.segments.is_some() || request.limit.is_some();
    if overridden {
        let mut settings = saved.clone();
        if let Some(segments) = request.segments {
            settings.default_segments = segments;
        }
        if let Some(limit) = request.limit {
            settings.global_speed_limit_bps = limit;
        }
        control.update_settings(&settings).await?;
    }

    let result: Result<Vec<Transfer>> = async {
        let transfer = control
            .add_url(LOCAL_OWNER, &request.url, request.file_name, save_dir)
            .await?;
        if format == OutputFormat::Human {
            println!(
                "{} Added {} [{}]",
                style("✓").green().bold(),
                style(&transfer.file_name).cyan(),
                short_id(&transfer.id)
            );
        }

        control.start(LOCAL_OWNER, transfer.id).await?;
        engine.start().await?;
        drive(engine, Watch::Only(transfer.id), format).await
    }
    .await;

    if overridden {
        control.update_settings(&saved).await?;
    }

    report(&result?, format)
}

/// Drive every running transfer, including ones resumed from another shell
pub async fn run(engine: &TransferEngine, format: OutputFormat) -> Result<()> {
    engine.start().await?;
    let finished = drive(engine, Watch::AllRunning, format).await?;
    if finished.is_empty() && format == OutputFormat::Human {
        println!("Nothing to run.");
        return Ok(());
    }
    report(&finished, format)
}

// ============================================================================
// Transfer Commands
// ============================================================================

pub async fn list_transfers(
    engine: &TransferEngine,
    status_filter: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let status = match status_filter {
        Some(raw) => Some(
            TransferStatus::parse(&raw.to_lowercase()).ok_or(CliError::UnknownStatus(raw))?,
        ),
        None => None,
    };

    let mut transfers = engine.control().transfers(LOCAL_OWNER).await?;
    transfers.retain(|t| status.map_or(true, |s| t.status == s));
    transfers.sort_by_key(|t| t.created_at);

    if transfers.is_empty() && format == OutputFormat::Human {
        println!("No transfers.");
        return Ok(());
    }
    print_transfers(&transfers, format)
}

pub async fn show_info(engine: &TransferEngine, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    let control = engine.control();
    let transfer = control.transfer(LOCAL_OWNER, id).await?;
    let segments = control.segments(LOCAL_OWNER, id).await?;
    let stats = control.stats(LOCAL_OWNER, id).await?;

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "transfer": transfer,
                "segments": segments,
                "stats": stats,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Table | OutputFormat::Human => {
            println!("{}", style(&transfer.file_name).bold());
            println!("  ID:       {}", transfer.id);
            println!("  URL:      {}", transfer.url);
            println!("  Status:   {} {}", status_icon(transfer.status), transfer.status);
            println!(
                "  Progress: {} ({:.1}%)",
                format_progress(transfer.received, transfer.total_size),
                transfer.progress()
            );
            println!(
                "  Ranges:   {}",
                if transfer.range_supported {
                    style("supported").green()
                } else {
                    style("not supported").yellow()
                }
            );
            if let Some(path) = transfer.destination() {
                println!("  Saved to: {}", path.display());
            }
            if let Some(stats) = &stats {
                println!(
                    "  Speed:    {} avg, {} peak",
                    format_speed(stats.avg_speed_bps),
                    format_speed(stats.max_speed_bps)
                );
                println!("  Started:  {} time(s)", stats.retries);
            }

            if !segments.is_empty() {
                #[derive(Tabled)]
                struct SegmentRow {
                    index: u32,
                    range: String,
                    received: String,
                    status: String,
                }

                let rows: Vec<SegmentRow> = segments
                    .iter()
                    .map(|s| SegmentRow {
                        index: s.index,
                        range: match s.end {
                            Some(end) => format!("{}-{}", s.start, end),
                            None => format!("{}-", s.start),
                        },
                        received: format_bytes(s.received),
                        status: s.status.to_string(),
                    })
                    .collect();
                println!();
                println!("{}", Table::new(rows));
            }
        }
    }

    Ok(())
}

fn print_changed(transfer: &Transfer, verb: &str, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(transfer)?),
        _ => println!(
            "{} Transfer {} {}",
            style("✓").green().bold(),
            short_id(&transfer.id),
            verb
        ),
    }
    Ok(())
}

pub async fn pause_transfer(engine: &TransferEngine, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    let transfer = engine.control().pause(LOCAL_OWNER, id).await?;
    print_changed(&transfer, "paused", format)
}

pub async fn resume_transfer(engine: &TransferEngine, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    let transfer = engine.control().start(LOCAL_OWNER, id).await?;
    print_changed(&transfer, "resumed", format)?;
    if format == OutputFormat::Human {
        println!("  Run `rangedl run` to drive it.");
    }
    Ok(())
}

pub async fn cancel_transfer(engine: &TransferEngine, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    let transfer = engine.control().cancel(LOCAL_OWNER, id).await?;
    print_changed(&transfer, "cancelled", format)
}

pub async fn delete_transfer(engine: &TransferEngine, id: &str, format: OutputFormat) -> Result<()> {
    let id = resolve_id(engine, id).await?;
    engine.control().delete(LOCAL_OWNER, id).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::json!({ "deleted": id })),
        _ => println!("{} Transfer deleted", style("✓").green().bold()),
    }
    Ok(())
}

// ============================================================================
// Config Commands
// ============================================================================

fn apply_setting(settings: &mut Settings, key: &str, value: &str) -> Result<(), CliError> {
    let invalid = || CliError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    };
    match key {
        "default_segments" => {
            let segments: u32 = value.parse().map_err(|_| invalid())?;
            if segments == 0 {
                return Err(invalid());
            }
            settings.default_segments = segments;
        }
        "global_speed_limit_bps" => {
            settings.global_speed_limit_bps = value.parse().map_err(|_| invalid())?;
        }
        "default_save_dir" => {
            settings.default_save_dir = match value.trim() {
                "" | "none" => None,
                dir => Some(PathBuf::from(dir)),
            };
        }
        _ => return Err(CliError::UnknownKey(key.to_string())),
    }
    Ok(())
}

pub async fn config_action(
    engine: &TransferEngine,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    let control = engine.control();

    match action {
        None | Some(ConfigAction::Show) => {
            let settings = control.settings(LOCAL_OWNER).await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                _ => {
                    println!("rangedl settings:");
                    println!();
                    println!("  Default segments: {}", settings.default_segments);
                    println!(
                        "  Speed limit:      {}",
                        match settings.global_speed_limit_bps {
                            0 => "Unlimited".to_string(),
                            bps => format_speed(bps as f64),
                        }
                    );
                    println!(
                        "  Save directory:   {}",
                        settings
                            .default_save_dir
                            .as_ref()
                            .map(|d| d.display().to_string())
                            .unwrap_or_else(|| "(current directory)".to_string())
                    );
                }
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let mut settings = control.settings(LOCAL_OWNER).await?;
            apply_setting(&mut settings, &key, &value)?;
            control.update_settings(&settings).await?;
            println!("{} Config updated", style("✓").green().bold());
        }
    }

    Ok(())
}
