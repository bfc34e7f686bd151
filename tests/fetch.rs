use anyhow::Result;
use chrono::NaiveDate;
use reqwest::Client as HttpClient;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::{mpsc, Arc, Mutex, Once};
use std::thread;
use std::time::Duration;
use ticker_sync::commands::{export, sync};
use ticker_sync::config::{FetchPolicy, PolygonConfig, SyncConfig};
use ticker_sync::context::AppContext;
use ticker_sync::models::TickerRecord;
use ticker_sync::polygon::{FetchCompletion, FetchError, FetchOutcome, PolygonClient};

const TEST_API_KEY: &str = "test-key";
const BASE_PLACEHOLDER: &str = "{base}";

fn ensure_test_env() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn logical_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 10, 16).expect("valid date")
}

fn fast_policy() -> FetchPolicy {
    FetchPolicy {
        rate_limit_cooldown: Duration::ZERO,
        page_delay: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
        ..FetchPolicy::default()
    }
}

fn ticker_json(symbol: &str) -> serde_json::Value {
    json!({
        "ticker": symbol,
        "name": format!("{} Corp", symbol),
        "market": "stocks",
        "locale": "us",
        "primary_exchange": "XNYS",
        "type": "CS",
        "active": true,
        "currency_name": "usd",
        "last_updated_utc": "2025-09-11T06:11:10.586204443Z"
    })
}

fn page(symbols: &[&str], next_cursor: Option<&str>) -> StubResponse {
    let results: Vec<_> = symbols.iter().map(|symbol| ticker_json(symbol)).collect();
    let mut body = json!({ "results": results, "status": "OK" });
    if let Some(cursor) = next_cursor {
        body["next_url"] = json!(format!(
            "{}/v3/reference/tickers?cursor={}",
            BASE_PLACEHOLDER, cursor
        ));
    }
    StubResponse::json("200 OK", body.to_string())
}

fn rate_limited() -> StubResponse {
    StubResponse::json(
        "429 Too Many Requests",
        json!({ "status": "ERROR", "error": "exceeded the maximum requests per minute" })
            .to_string(),
    )
}

async fn fetch_with(stub: &PolygonStub, policy: FetchPolicy) -> Result<FetchOutcome, FetchError> {
    let http = HttpClient::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("http client");
    let config = PolygonConfig {
        api_key: Some(TEST_API_KEY.to_string()),
        base_url: stub.base_url.clone(),
    };
    let client = PolygonClient::new(&http, &config, policy)?;
    client.fetch_all(logical_date()).await
}

fn tickers(records: &[TickerRecord]) -> Vec<String> {
    records
        .iter()
        .map(|record| record.ticker.clone().unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn two_pages_yield_three_records_in_page_order() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![
        page(&["A", "AA"], Some("page2")),
        page(&["AAPL"], None),
    ])?;

    let outcome = fetch_with(&stub, fast_policy()).await?;

    assert_eq!(tickers(&outcome.records), vec!["A", "AA", "AAPL"]);
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.completion, FetchCompletion::Complete);
    assert!(outcome
        .records
        .iter()
        .all(|record| record.data_date == "2025-10-16"));

    let requests = stub.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0],
        "/v3/reference/tickers?market=stocks&active=true&order=asc&limit=1000&sort=ticker&apiKey=test-key"
    );
    assert_eq!(requests[1], "/v3/reference/tickers?cursor=page2&apiKey=test-key");
    Ok(())
}

#[tokio::test]
async fn record_count_is_sum_of_page_sizes() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![
        page(&["A", "B", "C"], Some("2")),
        page(&[], Some("3")),
        page(&["D", "E"], Some("4")),
        page(&["F"], None),
    ])?;

    let outcome = fetch_with(&stub, fast_policy()).await?;

    assert_eq!(outcome.records.len(), 3 + 0 + 2 + 1);
    assert_eq!(outcome.pages, 4);
    Ok(())
}

#[tokio::test]
async fn single_rate_limit_is_retried_transparently() -> Result<()> {
    ensure_test_env();
    let direct = PolygonStub::start(vec![page(&["A", "B"], Some("2")), page(&["C"], None)])?;
    let throttled = PolygonStub::start(vec![
        rate_limited(),
        page(&["A", "B"], Some("2")),
        rate_limited(),
        page(&["C"], None),
    ])?;

    let expected = fetch_with(&direct, fast_policy()).await?;
    let retried = fetch_with(&throttled, fast_policy()).await?;

    assert_eq!(retried.records, expected.records);
    assert_eq!(retried.completion, FetchCompletion::Complete);
    assert_eq!(throttled.requests().len(), 4);
    Ok(())
}

#[tokio::test]
async fn repeated_rate_limit_on_first_page_fails_the_fetch() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![rate_limited(), rate_limited(), page(&["A"], None)])?;

    let result = fetch_with(&stub, fast_policy()).await;

    assert!(matches!(result, Err(FetchError::RateLimited { retries: 1, .. })));
    assert_eq!(stub.requests().len(), 2, "exactly one retry is attempted");
    Ok(())
}

#[tokio::test]
async fn repeated_rate_limit_on_later_page_truncates() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![
        page(&["A", "B"], Some("2")),
        rate_limited(),
        rate_limited(),
        page(&["C"], None),
    ])?;

    let outcome = fetch_with(&stub, fast_policy()).await?;

    assert_eq!(tickers(&outcome.records), vec!["A", "B"]);
    assert_eq!(outcome.pages, 1);
    assert!(outcome.is_truncated());
    assert_eq!(stub.requests().len(), 3);
    Ok(())
}

#[tokio::test]
async fn missing_results_on_later_page_keeps_prefix() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![
        page(&["A", "B"], Some("2")),
        page(&["C"], Some("3")),
        StubResponse::json("200 OK", json!({ "status": "OK", "count": 0 }).to_string()),
        page(&["D"], None),
    ])?;

    let outcome = fetch_with(&stub, fast_policy()).await?;

    assert_eq!(tickers(&outcome.records), vec!["A", "B", "C"]);
    assert!(outcome.is_truncated());
    Ok(())
}

#[tokio::test]
async fn server_error_on_later_page_truncates() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![
        page(&["A"], Some("2")),
        StubResponse::json("500 Internal Server Error", "{}".to_string()),
    ])?;

    let outcome = fetch_with(&stub, fast_policy()).await?;

    assert_eq!(tickers(&outcome.records), vec!["A"]);
    match outcome.completion {
        FetchCompletion::Truncated { reason } => assert!(reason.contains("500")),
        FetchCompletion::Complete => panic!("expected truncation"),
    }
    Ok(())
}

#[tokio::test]
async fn first_page_errors_are_returned() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![StubResponse::json(
        "403 Forbidden",
        json!({ "status": "NOT_AUTHORIZED" }).to_string(),
    )])?;
    let result = fetch_with(&stub, fast_policy()).await;
    match result {
        Err(FetchError::Status { status, body, url }) => {
            assert_eq!(status.as_u16(), 403);
            assert!(body.contains("NOT_AUTHORIZED"));
            assert!(!url.contains(TEST_API_KEY), "api key must be redacted");
        }
        other => panic!("unexpected result: {:?}", other.map(|o| o.records.len())),
    }

    let stub = PolygonStub::start(vec![StubResponse::json(
        "200 OK",
        json!({ "status": "ERROR", "error": "Unknown API Key" }).to_string(),
    )])?;
    let result = fetch_with(&stub, fast_policy()).await;
    assert!(matches!(result, Err(FetchError::MissingResults { .. })));
    Ok(())
}

#[tokio::test]
async fn connection_errors_do_not_expose_api_key() -> Result<()> {
    ensure_test_env();
    let secret = "SUPERSECRETKEY";
    let http = HttpClient::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("http client");
    let config = PolygonConfig {
        api_key: Some(secret.to_string()),
        base_url: "http://127.0.0.1:1".to_string(),
    };
    let client = PolygonClient::new(&http, &config, fast_policy())?;

    let err = client
        .fetch_all(logical_date())
        .await
        .expect_err("nothing listens on port 1");

    assert!(matches!(err, FetchError::Request { .. }));
    let display = format!("{}", err);
    let chain = format!("{:#}", anyhow::Error::from(err));
    assert!(!display.contains(secret), "key leaked: {}", display);
    assert!(!chain.contains(secret), "key leaked: {}", chain);
    assert!(display.contains("apiKey=***"));
    Ok(())
}

#[tokio::test]
async fn page_limit_stops_a_runaway_cursor() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![
        page(&["A"], Some("2")),
        page(&["B"], Some("3")),
        page(&["C"], Some("4")),
    ])?;
    let policy = FetchPolicy {
        max_pages: Some(2),
        ..fast_policy()
    };

    let outcome = fetch_with(&stub, policy).await?;

    assert_eq!(tickers(&outcome.records), vec!["A", "B"]);
    assert!(outcome.is_truncated());
    assert_eq!(stub.requests().len(), 2);
    Ok(())
}

fn app_for(stub: &PolygonStub, api_key: Option<&str>) -> Result<AppContext> {
    let mut config = SyncConfig::default();
    config.polygon = PolygonConfig {
        api_key: api_key.map(str::to_string),
        base_url: stub.base_url.clone(),
    };
    config.fetch = fast_policy();
    // Nothing listens here, so any warehouse access fails loudly.
    config.warehouse.url = Some("postgres://nobody@127.0.0.1:1/none".to_string());
    AppContext::initialize(config)
}

#[tokio::test]
async fn export_command_writes_csv_snapshot() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![page(&["A", "AA"], Some("2")), page(&["AAPL"], None)])?;
    let app = app_for(&stub, Some(TEST_API_KEY))?;
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("out").join("tickers.csv");

    let rows = export::run(&app, logical_date(), &output).await?;

    assert_eq!(rows, 3);
    let contents = std::fs::read_to_string(&output)?;
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("ticker,name,market"));
    assert!(lines[0].ends_with("last_updated_utc,data_date"));
    assert!(lines[1].starts_with("A,A Corp,stocks,us,XNYS,CS,true,usd,,,,"));
    assert!(lines[3].ends_with(",2025-10-16"));
    Ok(())
}

#[tokio::test]
async fn export_command_fails_on_first_page_error() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![StubResponse::json("500 Internal Server Error", "{}".to_string())])?;
    let app = app_for(&stub, Some(TEST_API_KEY))?;
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("tickers.csv");

    let result = export::run(&app, logical_date(), &output).await;

    assert!(result.is_err());
    assert!(!output.exists());
    Ok(())
}

#[tokio::test]
async fn sync_returns_early_without_touching_warehouse_when_fetch_fails() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![rate_limited(), rate_limited()])?;
    let app = app_for(&stub, Some(TEST_API_KEY))?;

    let summary = sync::run(&app, logical_date()).await?;

    assert!(summary.is_none());
    Ok(())
}

#[tokio::test]
async fn sync_skips_run_without_api_key() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![page(&["A"], None)])?;
    let app = app_for(&stub, None)?;

    let summary = sync::run(&app, logical_date()).await?;

    assert!(summary.is_none());
    assert!(stub.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn sync_reports_warehouse_failure_after_fetch() -> Result<()> {
    ensure_test_env();
    let stub = PolygonStub::start(vec![page(&["A"], None)])?;
    let app = app_for(&stub, Some(TEST_API_KEY))?;

    let result = sync::run(&app, logical_date()).await;

    assert!(result.is_err(), "unreachable warehouse must abort the run");
    assert_eq!(stub.requests().len(), 1);
    Ok(())
}

struct StubResponse {
    status: &'static str,
    body: String,
}

impl StubResponse {
    fn json(status: &'static str, body: String) -> Self {
        Self { status, body }
    }
}

/// Serves scripted responses in order, one per connection, and records each request target.
struct PolygonStub {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PolygonStub {
    fn start(responses: Vec<StubResponse>) -> Result<Self> {
        let mut listener: Option<TcpListener> = None;
        for _ in 0..64 {
            let port = fastrand::u16(40_000..60_000);
            if let Ok(bound) = TcpListener::bind(("127.0.0.1", port)) {
                listener = Some(bound);
                break;
            }
        }
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind("127.0.0.1:0")?,
        };
        listener.set_nonblocking(true)?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let (shutdown, shutdown_rx) = mpsc::channel();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let served_base = base_url.clone();
        let recorded = Arc::clone(&requests);
        let mut queue = responses.into_iter();
        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let _ = stream.set_nonblocking(false);
                    let _ = handle_request(stream, queue.next(), &served_base, &recorded);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        });

        Ok(Self {
            base_url,
            requests,
            shutdown,
            handle: Some(handle),
        })
    }

    fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Drop for PolygonStub {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_request(
    mut stream: std::net::TcpStream,
    response: Option<StubResponse>,
    base_url: &str,
    recorded: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    let target = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_string();

    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header == "\r\n" {
            break;
        }
    }

    if let Ok(mut requests) = recorded.lock() {
        requests.push(target);
    }

    let (status, body) = match response {
        Some(response) => (response.status, response.body.replace(BASE_PLACEHOLDER, base_url)),
        None => ("404 Not Found", "{}".to_string()),
    };
    let payload = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(payload.as_bytes())?;
    stream.flush()
}
