use anyhow::{anyhow, Result};
use async_trait::async_trait;
use backtester::data_provider::HistoricalDataProvider;
use backtester::exchange::{CandleSource, RestCandleSource};
use backtester::models::{
    BacktestResult, Candle, CandleInterval, OrderSide, Signal, TradeSignals,
    RESULT_SCHEMA_VERSION,
};
use backtester::report::{JsonReportSink, ReportSink};
use backtester::retry::RetryPolicy;
use backtester::strategy::StrategyEngine;
use backtester::{BacktestConfig, BacktestError, Backtester};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write as IoWrite};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Once};
use std::thread;
use std::time::Duration;

const SYMBOL: &str = "BTC/USDT";
const INITIAL_BALANCE: f64 = 10_000.0;
const QUANTITY: f64 = 10.0;

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
}

fn uptrend(symbol: &str) -> Vec<Candle> {
    (0..5)
        .map(|i| {
            let close = 100.0 + i as f64;
            Candle {
                symbol: symbol.to_string(),
                timestamp: t0() + ChronoDuration::minutes(i),
                open: close - 0.25,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 2.0,
            }
        })
        .collect()
}

fn test_config(symbols: &[&str]) -> BacktestConfig {
    let mut config = BacktestConfig::new(
        t0(),
        t0() + ChronoDuration::minutes(4),
        symbols.iter().map(|s| s.to_string()).collect(),
        CandleInterval::OneMinute,
        INITIAL_BALANCE,
    );
    config.data.use_cache = false;
    config.data.retry_base_delay_ms = 0;
    config.max_concurrent_symbols = 2;
    config
}

struct ScriptedSource {
    candles: HashMap<String, Vec<Candle>>,
    failing: bool,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn new(symbols: &[&str]) -> Self {
        Self {
            candles: symbols
                .iter()
                .map(|symbol| (symbol.to_string(), uptrend(symbol)))
                .collect(),
            failing: false,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing() -> Self {
        Self {
            candles: HashMap::new(),
            failing: true,
            calls: AtomicUsize::new(0),
        }
    }

    fn empty() -> Self {
        Self {
            candles: HashMap::new(),
            failing: false,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CandleSource for ScriptedSource {
    async fn get_historical_candles(
        &self,
        symbol: &str,
        _interval: CandleInterval,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(anyhow!("exchange unreachable"));
        }
        Ok(self
            .candles
            .get(symbol)
            .map(|candles| {
                candles
                    .iter()
                    .filter(|c| start_time.map(|s| c.timestamp >= s).unwrap_or(true))
                    .filter(|c| end_time.map(|e| c.timestamp <= e).unwrap_or(true))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Buys on the first candle and sells everything on the last one.
struct RoundTrip {
    buy_at: DateTime<Utc>,
    sell_at: DateTime<Utc>,
    latest: HashMap<String, Candle>,
}

impl RoundTrip {
    fn new() -> Self {
        Self {
            buy_at: t0(),
            sell_at: t0() + ChronoDuration::minutes(4),
            latest: HashMap::new(),
        }
    }
}

impl StrategyEngine for RoundTrip {
    fn initialize_strategy(&mut self, _symbol: &str, _candles: &[Candle]) -> Result<()> {
        Ok(())
    }

    fn update_state(&mut self, symbol: &str, candle: &Candle, _recent: &[Candle]) -> Result<()> {
        self.latest.insert(symbol.to_string(), candle.clone());
        Ok(())
    }

    fn get_trade_signals(&mut self, symbol: &str) -> Result<TradeSignals> {
        let Some(candle) = self.latest.get(symbol) else {
            return Ok(TradeSignals::default());
        };
        let mut signals = TradeSignals::default();
        if candle.timestamp == self.buy_at {
            signals.buy.push(Signal::market(
                OrderSide::Buy,
                candle.close,
                QUANTITY,
                candle.timestamp,
            ));
        }
        if candle.timestamp == self.sell_at {
            signals.sell.push(Signal::market(
                OrderSide::Sell,
                candle.close,
                QUANTITY,
                candle.timestamp,
            ));
        }
        Ok(signals)
    }

    fn minimum_data_requirement(&self) -> usize {
        0
    }
}

async fn run_round_trip(source: Arc<dyn CandleSource>, config: BacktestConfig) -> BacktestResult {
    let backtester = Backtester::new(config, source);
    let mut strategy = RoundTrip::new();
    backtester.run(&mut strategy).await.unwrap()
}

#[tokio::test]
async fn five_candle_uptrend_round_trip_is_profitable() {
    ensure_test_env();
    let result = run_round_trip(
        Arc::new(ScriptedSource::new(&[SYMBOL])),
        test_config(&[SYMBOL]),
    )
    .await;

    assert_eq!(result.total_trades(), 2);
    assert!(result.final_balance() > INITIAL_BALANCE);
    assert_eq!(result.symbol_performance.len(), 1);

    let buy = &result.trades[0];
    let sell = &result.trades[1];
    assert_eq!(buy.side, OrderSide::Buy);
    assert_eq!(sell.side, OrderSide::Sell);
    assert!((buy.execution_price - 100.5).abs() < 1e-9);
    assert!((sell.execution_price - 103.5).abs() < 1e-9);
    assert!(buy.quantity > 0.0 && sell.quantity < 0.0);

    let expected_net = sell.value.abs() - buy.value.abs() - buy.commission - sell.commission;
    let record = &result.symbol_performance[SYMBOL];
    assert!((record.net_profit - expected_net).abs() < 1e-9);
    assert!((result.final_balance() - (INITIAL_BALANCE + expected_net)).abs() < 1e-9);

    let last = result.snapshots.last().unwrap();
    assert_eq!(last.timestamp, t0() + ChronoDuration::minutes(4));
    assert_eq!(result.metadata.version, RESULT_SCHEMA_VERSION);
    assert_eq!(result.diagnostics.data_points_processed, 5);
    assert!(result.diagnostics.errors_encountered.is_empty());
}

#[tokio::test]
async fn repeated_runs_produce_identical_logs() {
    ensure_test_env();
    let symbols = [SYMBOL, "ETH/USDT"];
    let source: Arc<dyn CandleSource> = Arc::new(ScriptedSource::new(&symbols));
    let first = run_round_trip(source.clone(), test_config(&symbols)).await;
    let second = run_round_trip(source, test_config(&symbols)).await;

    assert_eq!(first.total_trades(), 4);
    assert_eq!(
        serde_json::to_string(&first.trades).unwrap(),
        serde_json::to_string(&second.trades).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&first.snapshots).unwrap(),
        serde_json::to_string(&second.snapshots).unwrap()
    );
    assert_ne!(first.metadata.id, second.metadata.id);
    let order: Vec<&str> = first.trades.iter().map(|t| t.symbol.as_str()).collect();
    assert_eq!(order, vec![SYMBOL, "ETH/USDT", SYMBOL, "ETH/USDT"]);
}

#[tokio::test]
async fn exhausted_retries_abort_before_replay() {
    ensure_test_env();
    let source = Arc::new(ScriptedSource::failing());
    let backtester = Backtester::new(test_config(&[SYMBOL]), source.clone());
    let mut strategy = RoundTrip::new();
    let err = backtester.run(&mut strategy).await.unwrap_err();

    assert!(matches!(err, BacktestError::DataUnavailable { .. }));
    let message = err.to_string();
    assert!(message.contains(SYMBOL));
    assert!(message.contains("3 attempts"));
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn invalid_config_fails_before_fetching() {
    ensure_test_env();
    let source = Arc::new(ScriptedSource::new(&[SYMBOL]));
    let mut config = test_config(&[SYMBOL]);
    config.initial_balance = 0.0;
    let backtester = Backtester::new(config, source.clone());
    let mut strategy = RoundTrip::new();
    let err = backtester.run(&mut strategy).await.unwrap_err();

    assert!(matches!(err, BacktestError::ConfigValidation(_)));
    assert!(err.to_string().contains("initialBalance"));
    assert_eq!(source.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn no_candles_for_any_symbol_is_fatal() {
    ensure_test_env();
    let backtester = Backtester::new(test_config(&[SYMBOL]), Arc::new(ScriptedSource::empty()));
    let mut strategy = RoundTrip::new();
    let err = backtester.run(&mut strategy).await.unwrap_err();
    assert!(matches!(err, BacktestError::NoData));
}

#[tokio::test]
async fn cancelled_run_returns_cancelled() {
    ensure_test_env();
    let backtester = Backtester::new(
        test_config(&[SYMBOL]),
        Arc::new(ScriptedSource::new(&[SYMBOL])),
    );
    backtester.cancellation_token().cancel();
    let mut strategy = RoundTrip::new();
    let err = backtester.run(&mut strategy).await.unwrap_err();
    assert!(matches!(err, BacktestError::Cancelled { .. }));
}

#[tokio::test]
async fn report_is_written_as_json() {
    ensure_test_env();
    let dir = tempfile::tempdir().unwrap();
    let backtester = Backtester::new(
        test_config(&[SYMBOL]),
        Arc::new(ScriptedSource::new(&[SYMBOL])),
    );
    let sink = JsonReportSink::new(dir.path().join("reports"));
    let mut strategy = RoundTrip::new();
    let reported = backtester.run_and_report(&mut strategy, &sink).await.unwrap();

    let location = reported.report.unwrap();
    assert!(location.ends_with(&format!("backtest-{}.json", reported.result.metadata.id)));
    let raw = std::fs::read_to_string(&location).unwrap();
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["metadata"]["version"], RESULT_SCHEMA_VERSION);
    assert_eq!(json["trading"]["totalTrades"], 2);
    assert!(json["symbolPerformance"][SYMBOL].is_object());
    assert_eq!(json["config"]["initialBalance"], INITIAL_BALANCE);
    assert_eq!(json["trading"]["profitFactor"], "Infinity");

    let reloaded: BacktestResult = serde_json::from_str(&raw).unwrap();
    assert_eq!(reloaded.trading.profit_factor, f64::INFINITY);
    assert_eq!(reloaded.trades, reported.result.trades);
    assert_eq!(reloaded.symbol_performance, reported.result.symbol_performance);
}

struct BrokenSink;

#[async_trait]
impl ReportSink for BrokenSink {
    async fn save(&self, _result: &BacktestResult) -> Result<String> {
        Err(anyhow!("disk full"))
    }
}

#[tokio::test]
async fn report_failure_does_not_invalidate_the_run() {
    ensure_test_env();
    let backtester = Backtester::new(
        test_config(&[SYMBOL]),
        Arc::new(ScriptedSource::new(&[SYMBOL])),
    );
    let mut strategy = RoundTrip::new();
    let reported = backtester
        .run_and_report(&mut strategy, &BrokenSink)
        .await
        .unwrap();
    assert_eq!(reported.result.total_trades(), 2);
    assert!(reported.report.unwrap_err().to_string().contains("disk full"));
}

#[tokio::test]
async fn cached_candles_skip_the_exchange() {
    ensure_test_env();
    let dir = tempfile::tempdir().unwrap();
    let source = Arc::new(ScriptedSource::new(&[SYMBOL]));
    let mut config = test_config(&[SYMBOL]);
    config.data.use_cache = true;
    config.data.cache_dir = dir.path().to_path_buf();

    let first = run_round_trip(source.clone(), config.clone()).await;
    let calls_after_first = source.calls.load(Ordering::SeqCst);
    let second = run_round_trip(source.clone(), config).await;

    assert_eq!(calls_after_first, 1);
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        serde_json::to_string(&first.trades).unwrap(),
        serde_json::to_string(&second.trades).unwrap()
    );
}

#[tokio::test]
async fn provider_retry_policy_is_injectable() {
    ensure_test_env();
    let source = Arc::new(ScriptedSource::failing());
    let provider = HistoricalDataProvider::new(
        source.clone(),
        None,
        RetryPolicy::new(5, Duration::ZERO),
        100,
    );
    let backtester = Backtester::with_provider(test_config(&[SYMBOL]), provider);
    let mut strategy = RoundTrip::new();
    let err = backtester.run(&mut strategy).await.unwrap_err();
    assert!(err.to_string().contains("5 attempts"));
    assert_eq!(source.calls.load(Ordering::SeqCst), 5);
}

struct KlinesStub {
    base_url: String,
    requests: Arc<AtomicUsize>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl KlinesStub {
    fn start(body: String) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let base_url = format!("http://{}", addr);
        let (shutdown, shutdown_rx) = mpsc::channel();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);

        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = handle_klines_request(stream, &body);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    thread::sleep(Duration::from_millis(10));
                }
            }
        });

        Ok(Self {
            base_url,
            requests,
            shutdown,
            handle: Some(handle),
        })
    }
}

impl Drop for KlinesStub {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_klines_request(mut stream: std::net::TcpStream, body: &str) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" {
            break;
        }
    }

    let path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let response = if path.starts_with("/api/v3/klines") && path.contains("symbol=BTCUSDT") {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };
    stream.write_all(response.as_bytes())
}

fn klines_body(candles: &[Candle]) -> String {
    let rows: Vec<serde_json::Value> = candles
        .iter()
        .map(|c| {
            serde_json::json!([
                c.timestamp.timestamp_millis(),
                format!("{}", c.open),
                format!("{}", c.high),
                format!("{}", c.low),
                format!("{}", c.close),
                format!("{}", c.volume),
                c.timestamp.timestamp_millis() + 59_999,
            ])
        })
        .collect();
    serde_json::Value::Array(rows).to_string()
}

#[tokio::test]
async fn rest_source_feeds_a_full_run_and_fills_the_cache() {
    ensure_test_env();
    let stub = KlinesStub::start(klines_body(&uptrend(SYMBOL))).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&[SYMBOL]);
    config.data.use_cache = true;
    config.data.cache_dir = dir.path().to_path_buf();
    config.data.exchange_base_url = stub.base_url.clone();

    let source: Arc<dyn CandleSource> =
        Arc::new(RestCandleSource::new(&stub.base_url, Duration::from_secs(5)).unwrap());
    let first = run_round_trip(source.clone(), config.clone()).await;
    assert_eq!(first.total_trades(), 2);
    assert_eq!(stub.requests.load(Ordering::SeqCst), 1);

    let second = run_round_trip(source, config).await;
    assert_eq!(stub.requests.load(Ordering::SeqCst), 1);
    assert!((first.final_balance() - second.final_balance()).abs() < 1e-9);
}
