//! macropanel CLI: run, validate and registry commands.
//!
//! Commands:
//! - `run`: build the panel, aggregates and features, write artifacts
//! - `validate`: check config, catalogs and staging files without computing
//! - `registry`: inspect the symbol registry
//! - `history`: list recorded runs

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use macropanel_core::registry::SymbolRegistry;
use macropanel_runner::{
    Pipeline, PipelineConfig, PipelineReport, RunHistory, RunMode, RunParams,
};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "macropanel",
    about = "macropanel: daily macro panel aggregation and feature derivation"
)]
struct Cli {
    /// Log at debug level (RUST_LOG still takes precedence).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline end to end.
    Run {
        /// Pipeline config file.
        #[arg(long, default_value = "pipeline.toml")]
        config: PathBuf,

        /// First panel date (YYYY-MM-DD). Overrides the config.
        #[arg(long)]
        start: Option<String>,

        /// Last panel date (YYYY-MM-DD). Defaults to the config, then today.
        #[arg(long)]
        end: Option<String>,

        /// Append only long rows past the stored watermark.
        #[arg(long, default_value_t = false)]
        incremental: bool,

        /// Worker threads for feature execution.
        #[arg(long)]
        workers: Option<usize>,

        /// Run every stage on the calling thread.
        #[arg(long, default_value_t = false)]
        sequential: bool,

        /// Only load these sources (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,

        /// Only compute these features and their dependencies (repeatable).
        #[arg(long = "feature")]
        features: Vec<String>,
    },
    /// Check config, catalogs and staging files without computing anything.
    Validate {
        /// Pipeline config file.
        #[arg(long, default_value = "pipeline.toml")]
        config: PathBuf,

        /// Validate with this source subset (repeatable).
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Inspect the symbol registry.
    Registry {
        /// Pipeline config file.
        #[arg(long, default_value = "pipeline.toml")]
        config: PathBuf,

        /// Look up one symbol or panel column (e.g. SPY_close).
        #[arg(long)]
        symbol: Option<String>,

        /// List derived symbols only.
        #[arg(long, default_value_t = false)]
        derived: bool,
    },
    /// List recorded runs, newest last.
    History {
        /// Pipeline config file.
        #[arg(long, default_value = "pipeline.toml")]
        config: PathBuf,

        /// Show only the most recent N runs.
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            start,
            end,
            incremental,
            workers,
            sequential,
            sources,
            features,
        } => {
            let params = RunParams {
                start: parse_date(start.as_deref())?,
                end: parse_date(end.as_deref())?,
                mode: if incremental {
                    RunMode::Incremental
                } else {
                    RunMode::Full
                },
                workers,
                sequential,
                sources,
                features,
            };
            run_cmd(&config, &params)
        }
        Commands::Validate { config, sources } => validate_cmd(
            &config,
            &RunParams {
                sources,
                ..Default::default()
            },
        ),
        Commands::Registry {
            config,
            symbol,
            derived,
        } => registry_cmd(&config, symbol.as_deref(), derived),
        Commands::History { config, limit } => history_cmd(&config, limit),
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();
}

fn parse_date(value: Option<&str>) -> Result<Option<NaiveDate>> {
    value
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .with_context(|| format!("invalid date '{s}', expected YYYY-MM-DD"))
        })
        .transpose()
}

fn load_pipeline(config: &Path) -> Result<Pipeline> {
    let config = PipelineConfig::from_file(config)
        .with_context(|| format!("failed to load {}", config.display()))?;
    Pipeline::load(config)
}

fn run_cmd(config: &Path, params: &RunParams) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let now = chrono::Local::now().naive_local();
    let report = pipeline.run(params, now)?;
    print_summary(&report);
    println!("Report: {}", pipeline.report_path().display());
    Ok(())
}

fn validate_cmd(config: &Path, params: &RunParams) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let summary = pipeline.validate(params)?;

    println!("Sources:          {}", summary.sources.join(", "));
    println!("Aggregates:       {}", summary.aggregates);
    println!("Basic features:   {}", summary.basic_features);
    println!("Domain features:  {}", summary.domain_features);
    println!("Registry symbols: {}", summary.registry_symbols);
    if !summary.missing_files.is_empty() {
        println!(
            "Missing staging files (will be skipped): {}",
            summary.missing_files.join(", ")
        );
    }
    println!("OK");
    Ok(())
}

fn registry_cmd(config: &Path, symbol: Option<&str>, derived: bool) -> Result<()> {
    let config = PipelineConfig::from_file(config)
        .with_context(|| format!("failed to load {}", config.display()))?;
    let registry = SymbolRegistry::load_or_default(&config.registry_path())
        .context("failed to load symbol registry")?;

    if let Some(symbol) = symbol {
        let Some(resolved) = registry.resolve(symbol) else {
            bail!("'{symbol}' is not in the registry");
        };
        println!("{symbol}");
        println!("  source:      {}", resolved.source());
        println!("  description: {}", resolved.description());
        println!("  unit:        {}", resolved.unit());
        if let Some(ratio) = resolved.record.expense_ratio {
            println!("  expense:     {ratio}");
        }
        return Ok(());
    }

    let records: Vec<_> = if derived {
        registry.derived().collect()
    } else {
        registry.iter().collect()
    };
    println!("{:<40} {:<16} {:<16} DESCRIPTION", "SYMBOL", "SOURCE", "UNIT");
    for r in &records {
        println!(
            "{:<40} {:<16} {:<16} {}",
            r.symbol, r.source, r.unit, r.description
        );
    }
    println!("{} symbols", records.len());
    Ok(())
}

fn history_cmd(config: &Path, limit: Option<usize>) -> Result<()> {
    let config = PipelineConfig::from_file(config)
        .with_context(|| format!("failed to load {}", config.display()))?;
    let history = RunHistory::new(config.history_path());
    let entries = history
        .read_all()
        .with_context(|| format!("failed to read {}", history.path().display()))?;
    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));

    println!(
        "{:<18} {:<20} {:<12} {:<18} {:>8} {:>8} {:>7}",
        "RUN", "STARTED", "MODE", "HASH", "COLUMNS", "COMPUTED", "FAILED"
    );
    for e in entries.iter().skip(skip) {
        println!(
            "{:<18} {:<20} {:<12} {:<18} {:>8} {:>8} {:>7}",
            e.run_id,
            e.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            e.mode.to_string(),
            &e.panel_hash[..e.panel_hash.len().min(16)],
            e.columns,
            e.computed,
            e.failed
        );
    }
    println!("{} runs", entries.len());
    Ok(())
}

fn print_summary(report: &PipelineReport) {
    println!("=== macropanel run {} ===", report.run_id);
    if let (Some(start), Some(end)) = (report.panel.start, report.panel.end) {
        println!("Range:      {start} → {end}");
    }
    println!(
        "Panel:      {} rows × {} columns",
        report.panel.rows, report.panel.columns
    );
    println!("Hash:       {}", report.panel_hash);
    println!(
        "Aggregates: {} computed, {} skipped",
        report.aggregates.computed.len(),
        report.aggregates.skipped.len()
    );
    println!(
        "Features:   {} computed, {} skipped, {} failed",
        report.features.computed.len(),
        report.features.skipped.len(),
        report.features.failed.len()
    );
    for failure in &report.features.failed {
        println!("  failed  {}: {}", failure.name, failure.reason);
    }
    if let Some(long) = &report.outputs.long {
        println!(
            "Long:       {} rows ({}), watermark {}",
            long.rows,
            report.mode,
            long.watermark.map_or("-".to_string(), |d| d.to_string())
        );
    }
    println!("Duration:   {:.1}s", report.duration_secs);
}
