//! Live progress rendering.
//!
//! Bridges the library's progress channel to an `indicatif` spinner. Per-tile
//! milestones (retries, failures) are printed above the bar so they survive
//! once the bar clears.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use lidarhd::{ProgressEvent, ProgressSender};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawns the rendering task and returns the sender to hand to the run.
///
/// The task exits when every sender clone is dropped, so the caller should
/// await the handle after the run completes to flush the final state.
pub fn spawn() -> (ProgressSender, JoinHandle<()>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handle = tokio::spawn(render(receiver));
    (sender, handle)
}

async fn render(mut receiver: mpsc::UnboundedReceiver<ProgressEvent>) {
    let bar = ProgressBar::new_spinner();
    let template = ProgressStyle::with_template("{spinner} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    bar.set_style(template);
    bar.enable_steady_tick(Duration::from_millis(120));

    let mut downloaded: usize = 0;
    let mut cached: usize = 0;
    let mut failed: usize = 0;

    while let Some(event) = receiver.recv().await {
        match event {
            ProgressEvent::Started { .. } => {}
            ProgressEvent::Retrying { id, attempt, reason } => {
                bar.println(format!(
                    "  {} {} (attempt {}): {}",
                    style("retrying").yellow(),
                    id,
                    attempt,
                    reason
                ));
            }
            ProgressEvent::Completed { id, bytes } => {
                downloaded += 1;
                bar.println(format!(
                    "  {} {} ({})",
                    style("fetched").green(),
                    id,
                    format_size(bytes)
                ));
            }
            ProgressEvent::Skipped { .. } => {
                cached += 1;
            }
            ProgressEvent::Failed { id, reason } => {
                failed += 1;
                bar.println(format!("  {} {}: {}", style("failed").red(), id, reason));
            }
        }
        bar.set_message(format!(
            "{} downloaded, {} cached, {} failed",
            downloaded, cached, failed
        ));
    }
    bar.finish_and_clear();
}

/// Human-readable byte count, binary units.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
