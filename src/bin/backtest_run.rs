//! Backtest Runner CLI
//!
//! Runs a backtest described by a TOML config over one or more CSV bar files
//! and writes the results as JSON.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin backtest_run -- \
//!   --config backtest.toml \
//!   --data bars.csv \
//!   --data SPY=spy_daily.csv \
//!   --output results.json
//! ```
//!
//! A `--data` value of the form `SYMBOL=path` attributes every row of the file
//! to `SYMBOL`; otherwise rows are matched on the configured symbol column.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 2: Configuration or validation error
//! - 3: Runtime error (data feed, handler failure, I/O)

use alphaflow::backtest::{format_nanos, Backtest, BacktestConfig, BacktestResults, CsvFeed};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI ARGUMENTS
// =============================================================================

/// Event-driven backtest runner
#[derive(Parser, Debug)]
#[command(name = "backtest_run", version)]
#[command(about = "Run a deterministic backtest from a TOML config and CSV bars")]
struct Cli {
    /// Backtest configuration (TOML)
    #[arg(short, long, env = "ALPHAFLOW_CONFIG")]
    config: PathBuf,

    /// CSV bar file, optionally bound to a symbol as SYMBOL=path
    #[arg(short, long = "data", value_name = "CSV", required = true)]
    data: Vec<String>,

    /// Output JSON path (stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

/// Splits `SYMBOL=path` into its parts. A plain path has no bound symbol.
fn parse_data_arg(arg: &str) -> (Option<String>, PathBuf) {
    match arg.split_once('=') {
        Some((symbol, path)) if !symbol.is_empty() && !path.is_empty() => {
            (Some(symbol.to_string()), PathBuf::from(path))
        }
        _ => (None, PathBuf::from(arg)),
    }
}

// =============================================================================
// RESULT OUTPUT
// =============================================================================

fn write_output_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    // Write to temp file then rename (atomic on POSIX)
    let temp_path = path.with_extension("tmp");
    let file = File::create(&temp_path)
        .with_context(|| format!("failed to create {}", temp_path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(content.as_bytes())?;
    writer.flush()?;
    drop(writer);

    fs::rename(&temp_path, path)
        .with_context(|| format!("failed to move results to {}", path.display()))?;
    Ok(())
}

fn print_summary(results: &BacktestResults) {
    let stamp = |t: Option<i64>| t.map(format_nanos).unwrap_or_else(|| "-".to_string());

    eprintln!("\n{}", "=".repeat(70));
    eprintln!("BACKTEST SUMMARY");
    eprintln!("{}", "=".repeat(70));
    eprintln!("First Event:        {}", stamp(results.start));
    eprintln!("Last Event:         {}", stamp(results.end));
    eprintln!("Events Processed:   {}", results.counts.queue_events);
    eprintln!("Dispatches:         {}", results.counts.dispatched);
    eprintln!("Fills:              {}", results.counts.fills);
    eprintln!("Rejections:         {}", results.counts.rejections);
    eprintln!("{}", "-".repeat(70));
    eprintln!("Initial Cash:       ${:.2}", results.initial_cash);
    eprintln!("Final Value:        ${:.2}", results.final_value);
    eprintln!("Total Return:       {:.2}%", results.total_return * 100.0);
    eprintln!("Commission Paid:    ${:.2}", results.portfolio.total_commission());
    if !results.open_orders.is_empty() || !results.expired_orders.is_empty() {
        eprintln!(
            "Limit Orders:       {} open, {} expired",
            results.open_orders.len(),
            results.expired_orders.len()
        );
    }
    if results.truncated {
        eprintln!("Truncated:          yes (max_events reached)");
    }
    eprintln!("{}", "=".repeat(70));
}

// =============================================================================
// MAIN
// =============================================================================

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    };

    let mut feed = CsvFeed::new(config.csv.clone());
    for arg in &cli.data {
        let (symbol, path) = parse_data_arg(arg);
        tracing::debug!(path = %path.display(), symbol = ?symbol, "registered data file");
        feed.add_file(path, symbol);
    }

    let mut backtest = Backtest::from_config(config);
    backtest.set_data_feed(feed);

    let results = match backtest.run() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Backtest error: {}", e);
            let code = if e.is_configuration() { 2 } else { 3 };
            std::process::exit(code);
        }
    };

    if let Err(e) = emit(&results, cli.output.as_deref()) {
        eprintln!("Error writing output: {:#}", e);
        std::process::exit(3);
    }

    print_summary(&results);
}

fn load_config(path: &Path) -> Result<BacktestConfig> {
    let config = BacktestConfig::load(path)?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn emit(results: &BacktestResults, output: Option<&Path>) -> Result<()> {
    let json = results.to_json_pretty()?;
    match output {
        Some(path) => {
            write_output_atomic(path, &json)?;
            tracing::info!(path = %path.display(), "results written");
        }
        None => println!("{}", json),
    }
    Ok(())
}
