//! LidarHD CLI - acquire IGN LiDAR HD tiles for an area of interest.
//!
//! Reads an AOI from a GeoJSON file, selects the intersecting tiles from the
//! IGN feature service, downloads them with bounded parallelism, and
//! consolidates the result per the chosen strategy.

mod aoi;
mod error;
mod progress;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use lidarhd::download::HttpFetcher;
use lidarhd::index::{HttpTileIndex, IndexConfig};
use lidarhd::{run, DataType, RunOptions, RunReport, Strategy};

use crate::error::CliError;

#[derive(Parser)]
#[command(
    name = "lidarhd",
    version,
    about = "Download and consolidate IGN LiDAR HD tiles for an area of interest"
)]
struct Cli {
    /// GeoJSON file with the AOI (Lambert-93 / EPSG:2154 coordinates).
    #[arg(long, value_name = "FILE")]
    aoi: PathBuf,

    /// Output directory [default: ~/Downloads/lidarhd]
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Concurrent downloads.
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=10))]
    max_downloads: u8,

    /// Re-download tiles even when valid local copies exist.
    #[arg(long)]
    force: bool,

    /// Consolidation strategy.
    #[arg(long, default_value = "all", value_parser = parse_strategy)]
    strategy: Strategy,

    /// Tile data type.
    #[arg(long, default_value = "point-cloud", value_parser = parse_data_type)]
    data_type: DataType,

    /// Override the tile index endpoint.
    #[arg(long, value_name = "URL")]
    index_url: Option<String>,

    /// Suppress the live progress display.
    #[arg(long)]
    quiet: bool,
}

fn parse_strategy(name: &str) -> Result<Strategy, String> {
    Strategy::from_name(name)
        .ok_or_else(|| format!("unknown strategy '{}' (expected all, merge, best-coverage)", name))
}

fn parse_data_type(name: &str) -> Result<DataType, String> {
    DataType::from_name(name)
        .ok_or_else(|| format!("unknown data type '{}' (expected point-cloud, dtm, dsm, dhm)", name))
}

fn default_output_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lidarhd")
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<RunReport, CliError> {
    let features = aoi::load(&cli.aoi)?;
    let output_dir = cli.output.unwrap_or_else(default_output_dir);

    println!("LidarHD v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("AOI:       {} ({} feature(s))", cli.aoi.display(), features.len());
    println!("Output:    {}", output_dir.display());
    println!("Data type: {}", cli.data_type);
    println!("Strategy:  {}", cli.strategy);
    println!();

    let index_config = match cli.index_url {
        Some(url) => IndexConfig::new(url),
        None => IndexConfig::default(),
    };
    let index = HttpTileIndex::new(index_config)
        .map_err(|e| CliError::Client(e.to_string()))?;
    let fetcher = HttpFetcher::new().map_err(|e| CliError::Client(e.to_string()))?;

    let cancel = CancellationToken::new();
    let signal_guard = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight tiles");
            signal_guard.cancel();
        }
    });

    let options = RunOptions::new(output_dir)
        .with_max_concurrent(cli.max_downloads as usize)
        .with_force(cli.force)
        .with_strategy(cli.strategy)
        .with_data_type(cli.data_type);

    let (events, render_task) = if cli.quiet {
        (None, None)
    } else {
        let (sender, handle) = progress::spawn();
        (Some(sender), Some(handle))
    };

    let result = run(&index, fetcher, &features, &options, &cancel, events).await;
    if let Some(handle) = render_task {
        // The run dropped its sender; the renderer drains and exits.
        let _ = handle.await;
    }
    result.map_err(CliError::from)
}

fn print_report(report: &RunReport) {
    println!();
    for line in &report.tile_log {
        println!("{}", line);
    }
    if !report.tile_log.is_empty() {
        println!();
    }
    if report.outputs.is_empty() {
        println!("{}", style(empty_outcome(report)).yellow());
        return;
    }
    println!("{}", style(report.summary()).bold());
    println!();
    println!("Output files:");
    for output in &report.outputs {
        println!("  {}", output.display());
    }
    if !report.is_complete() {
        println!();
        println!(
            "{}",
            style("Some tiles are missing from the output; re-run to retry failures.").yellow()
        );
    }
}

/// Status line when a run produced no output artifacts: either nothing
/// matched the AOI, or tiles matched but none made it to disk.
fn empty_outcome(report: &RunReport) -> &'static str {
    if report.failed.is_empty() {
        "No tiles matched the AOI."
    } else {
        "No output produced: every matched tile failed to download. Re-run to retry."
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_outcome_distinguishes_no_coverage_from_failures() {
        let no_coverage = RunReport::default();
        assert!(empty_outcome(&no_coverage).contains("No tiles matched"));

        let mut all_failed = RunReport::default();
        all_failed
            .failed
            .push(("a".to_string(), "HTTP status 404".to_string()));
        assert!(empty_outcome(&all_failed).contains("failed to download"));
    }

    #[test]
    fn test_strategy_and_data_type_parsers() {
        assert_eq!(parse_strategy("merge"), Ok(Strategy::MergeIntersecting));
        assert!(parse_strategy("closest").is_err());
        assert_eq!(parse_data_type("dsm"), Ok(DataType::Dsm));
        assert!(parse_data_type("raster").is_err());
    }
}
