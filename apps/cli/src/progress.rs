//! Progress bars for transfers driven from the terminal

use crate::output::format_speed;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use rangedl_types::{ThroughputState, Transfer, TransferStatus};
use std::collections::HashMap;
use uuid::Uuid;

const TEMPLATE: &str =
    "{spinner:.green} {prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// One bar per watched transfer, refreshed from store snapshots
pub struct TransferProgress {
    multi: MultiProgress,
    style: ProgressStyle,
    bars: HashMap<Uuid, ProgressBar>,
}

impl TransferProgress {
    pub fn new(visible: bool) -> anyhow::Result<Self> {
        let multi = MultiProgress::new();
        if !visible {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }
        let style = ProgressStyle::default_bar()
            .template(TEMPLATE)?
            .progress_chars("█▓▒░  ");
        Ok(Self {
            multi,
            style,
            bars: HashMap::new(),
        })
    }

    fn bar(&mut self, transfer: &Transfer) -> &ProgressBar {
        let multi = &self.multi;
        let style = &self.style;
        self.bars.entry(transfer.id).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new(transfer.total_size.unwrap_or(0)));
            pb.set_style(style.clone());
            pb.set_prefix(transfer.file_name.clone());
            pb
        })
    }

    /// Bring the bar in line with the stored transfer and its live speed
    pub fn update(&mut self, transfer: &Transfer, speed: ThroughputState) {
        let pb = self.bar(transfer);
        if pb.is_finished() {
            return;
        }
        if let Some(total) = transfer.total_size {
            pb.set_length(total);
        }
        pb.set_position(transfer.received);

        match transfer.status {
            TransferStatus::Completed => {
                pb.finish_with_message(format!("{} Download complete", style("✓").green().bold()));
            }
            TransferStatus::Error => {
                pb.abandon_with_message(format!("{} Failed", style("✗").red().bold()));
            }
            TransferStatus::Paused => {
                pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
            }
            TransferStatus::Canceled => {
                pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
            }
            TransferStatus::Running | TransferStatus::Queued => {
                pb.set_message(format!("({})", format_speed(speed.avg_bytes_per_sec)));
                pb.tick();
            }
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}
