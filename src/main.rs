use anyhow::{anyhow, Context, Result};
use backtester::{
    candle_utils::normalize_symbol,
    config::BacktestConfig,
    exchange::{CandleSource, RestCandleSource},
    report::{JsonReportSink, ReportSink},
    strategy, Backtester, TickProgress,
};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_REPORT_DIR: &str = "data/reports";

#[derive(Parser)]
#[command(name = "backtester")]
#[command(about = "Replay trading strategies against historical exchange candles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest and write the JSON report
    Run {
        #[command(flatten)]
        overrides: ConfigArgs,
        /// Strategy template to replay
        #[arg(long, default_value = "buy_and_hold")]
        strategy: String,
        /// Quote amount the strategy commits per symbol (defaults to an equal split of the balance)
        #[arg(long)]
        quote_amount: Option<f64>,
        /// Report file (defaults to data/reports/backtest-<id>.json)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Download and cache candles for the configured window without replaying
    Fetch {
        #[command(flatten)]
        overrides: ConfigArgs,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Backtest configuration file (JSON)
    #[arg(short, long, value_name = "PATH")]
    config: PathBuf,
    /// Comma separated symbols, e.g. BTC/USDT,ETH/USDT
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    /// Window start (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_timestamp)]
    start: Option<DateTime<Utc>>,
    /// Window end (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_timestamp)]
    end: Option<DateTime<Utc>>,
    /// Candle cache directory
    #[arg(long, value_name = "PATH")]
    cache_dir: Option<PathBuf>,
    /// Always fetch from the exchange
    #[arg(long)]
    no_cache: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    info!(
        "Starting backtester. Not financial advice. Past performance does not predict future results."
    );

    match command {
        Commands::Run {
            overrides,
            strategy,
            quote_amount,
            output,
            no_progress,
        } => {
            let config = load_config(&overrides)?;
            run_backtest(config, &strategy, quote_amount, output, no_progress).await?;
        }
        Commands::Fetch { overrides } => {
            let config = load_config(&overrides)?;
            fetch_only(config).await?;
        }
    }

    Ok(())
}

async fn run_backtest(
    config: BacktestConfig,
    template_id: &str,
    quote_amount: Option<f64>,
    output: Option<PathBuf>,
    no_progress: bool,
) -> Result<()> {
    let quote_amount =
        quote_amount.unwrap_or(config.initial_balance / config.symbols.len().max(1) as f64);
    let mut parameters = HashMap::new();
    parameters.insert("quoteAmount".to_string(), quote_amount);
    let mut strategy = strategy::create_strategy(template_id, parameters)?;

    let source = exchange_source(&config)?;
    let backtester = Backtester::new(config, source);
    let token = backtester.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling backtest at the next tick");
            token.cancel();
        }
    });

    let pb = if no_progress {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )?
            .progress_chars("#>-"),
    );

    let result = backtester
        .run_with_progress(strategy.as_mut(), |progress: &TickProgress| {
            pb.set_length(progress.total_ticks as u64);
            pb.set_position(progress.tick as u64);
            if progress.tick % 60 == 0 || progress.tick == progress.total_ticks {
                pb.set_message(format!(
                    "value {:.2}, {} trades",
                    progress.portfolio_value, progress.trades
                ));
            }
        })
        .await;
    pb.finish_and_clear();
    let result = result?;

    println!("{}", result.summary_table());

    let sink = match output {
        Some(path) => JsonReportSink::to_file(path),
        None => JsonReportSink::new(DEFAULT_REPORT_DIR),
    };
    match sink.save(&result).await {
        Ok(location) => info!("Report written to {}", location),
        Err(err) => warn!("Backtest completed but the report could not be saved: {:#}", err),
    }
    Ok(())
}

async fn fetch_only(config: BacktestConfig) -> Result<()> {
    let source = exchange_source(&config)?;
    let backtester = Backtester::new(config, source);
    let loaded = backtester.load_data(0).await?;
    let total: usize = loaded.iter().map(|entry| entry.candles.len()).sum();
    info!("Cached {} candles for {} symbols", total, loaded.len());
    Ok(())
}

fn exchange_source(config: &BacktestConfig) -> Result<Arc<dyn CandleSource>> {
    let source = RestCandleSource::new(
        &config.data.exchange_base_url,
        config.data.request_timeout(),
    )?;
    Ok(Arc::new(source))
}

fn load_config(args: &ConfigArgs) -> Result<BacktestConfig> {
    let mut config = BacktestConfig::from_file(&args.config)?;

    let symbols: Vec<String> = args
        .symbols
        .iter()
        .filter_map(|raw| normalize_symbol(raw))
        .collect();
    if !symbols.is_empty() {
        config.symbols = symbols;
    }
    if let Some(start) = args.start {
        config.start_time = start;
    }
    if let Some(end) = args.end {
        config.end_time = end;
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.data.cache_dir = cache_dir.clone();
    }
    if args.no_cache {
        config.data.use_cache = false;
    }

    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;
    Ok(config)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").map_err(|_| {
        anyhow!(
            "Invalid timestamp {} (expected RFC 3339 or YYYY-MM-DD)",
            trimmed
        )
    })?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("Invalid timestamp {}", trimmed))
}
