//! Output formatting utilities

use console::style;
use rangedl_types::TransferStatus;

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec.max(0.0)))
}

/// `received / total`, or just `received` while the size is unknown
pub fn format_progress(received: u64, total: Option<u64>) -> String {
    match total {
        Some(total) => format!("{} / {}", format_bytes(received), format_bytes(total)),
        None => format_bytes(received),
    }
}

/// First eight characters of an ID, as shown in listings
pub fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Host part of a URL for compact listings
pub fn source_host(raw: &str) -> String {
    url::Url::parse(raw)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}

pub fn status_icon(status: TransferStatus) -> String {
    match status {
        TransferStatus::Queued => style("○").dim().to_string(),
        TransferStatus::Running => style("↓").cyan().to_string(),
        TransferStatus::Paused => style("⏸").yellow().to_string(),
        TransferStatus::Completed => style("✓").green().to_string(),
        TransferStatus::Canceled => style("○").dim().to_string(),
        TransferStatus::Error => style("✗").red().to_string(),
    }
}

/// Truncate long names for table cells
pub fn truncate(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    let kept: String = name.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
