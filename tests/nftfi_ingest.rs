use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nft_ltv_depth::{
    aggregate, floor_price_from_reservoir, parse_loans_response, BucketPolicy, Clock,
    FetchPolicy, HttpFetcher, IngestError, ManualClock, NftfiClient, NftfiConfig, RateLimiter,
    ReservoirClient, ReservoirConfig,
};

const LOANS_BODY: &str = r#"{
  "meta": [{"name": "loanId", "type": "String"}],
  "data": [
    {
      "protocolName": "NFTfi v2.3",
      "loanId": "24391",
      "nftProjectName": "Wrapped Cryptopunks",
      "nftId": "7804",
      "nftImageSmallUri": "https://img.example/7804.png",
      "principalAmountUSD": 61234.5,
      "maximumRepaymentAmountUSD": 63100.25,
      "apr": 18.5,
      "durationDays": 30,
      "hoursUntilDue": 211.4,
      "borrowerAddress": "0xb0rr0wer",
      "lenderAddress": "0x1ender",
      "dueTime": "2026-11-05 12:00:00"
    },
    {
      "protocolName": "NFTfi v2",
      "loanId": 24392,
      "nftId": 1002,
      "principalAmountUSD": "48000",
      "apr": "22",
      "hoursUntilDue": null
    },
    {
      "protocolName": "NFTfi v2",
      "loanId": "24393",
      "nftId": "55",
      "principalAmountUSD": null
    },
    {
      "protocolName": "NFTfi v2",
      "nftId": "56",
      "principalAmountUSD": 1000
    }
  ],
  "rows": 4
}"#;

const RESERVOIR_BODY: &str = r#"{
  "collections": [
    {
      "id": "0xb7f7f6c52f2e2fdb1963eab30438024864c313f6",
      "name": "Wrapped Cryptopunks",
      "floorAsk": {
        "id": "0xabc",
        "price": {
          "currency": {"symbol": "ETH"},
          "amount": {"raw": "42000000000000000000", "decimal": 42.0, "usd": 120450.75, "native": 42.0}
        }
      }
    }
  ]
}"#;

const PUNKS: &str = "0xb7f7f6c52f2e2fdb1963eab30438024864c313f6";

type CallLog = Arc<Mutex<Vec<(String, Vec<(String, String)>)>>>;

struct FakeFetcher {
    responses: Mutex<VecDeque<Result<Vec<u8>, IngestError>>>,
    calls: CallLog,
}

impl FakeFetcher {
    fn new(responses: Vec<Result<Vec<u8>, IngestError>>) -> (Self, CallLog) {
        let calls = CallLog::default();
        let fetcher = Self {
            responses: Mutex::new(responses.into()),
            calls: Arc::clone(&calls),
        };
        (fetcher, calls)
    }
}

impl HttpFetcher for FakeFetcher {
    fn get_bytes(&self, url: &str, headers: &[(&str, &str)]) -> Result<Vec<u8>, IngestError> {
        self.calls.lock().unwrap().push((
            url.to_string(),
            headers
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        ));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(IngestError::HttpStatus {
                    url: url.to_string(),
                    status: 404,
                })
            })
    }
}

fn fast_fetch_policy() -> FetchPolicy {
    FetchPolicy {
        max_retries: 2,
        retry_backoff_ms: 0,
        ..FetchPolicy::default()
    }
}

fn clock() -> Arc<dyn Clock> {
    Arc::new(ManualClock::new(1_760_000_000_000))
}

fn status(code: u16) -> Result<Vec<u8>, IngestError> {
    Err(IngestError::HttpStatus {
        url: "https://theta-sdk-api.nftfi.com".to_string(),
        status: code,
    })
}

#[test]
fn nftfi_body_normalizes_into_strict_loans() {
    let loans = parse_loans_response(LOANS_BODY.as_bytes()).unwrap();
    assert_eq!(loans.len(), 3);

    let first = &loans[0];
    assert_eq!(first.loan_id, "24391");
    assert_eq!(first.protocol_name, "NFTfi v2.3");
    assert_eq!(first.nft_id, "7804");
    assert_eq!(first.principal_amount_usd, Some(61234.5));
    assert_eq!(first.maximum_repayment_amount_usd, Some(63100.25));
    assert_eq!(first.duration_days, Some(30.0));
    assert_eq!(first.due_time.as_deref(), Some("2026-11-05 12:00:00"));

    let second = &loans[1];
    assert_eq!(second.loan_id, "24392");
    assert_eq!(second.nft_id, "1002");
    assert_eq!(second.principal_amount_usd, Some(48000.0));
    assert_eq!(second.apr, Some(22.0));
    assert_eq!(second.hours_until_due, None);

    assert_eq!(loans[2].principal_amount_usd, None);
}

#[test]
fn normalized_loans_feed_the_aggregator() {
    let loans = parse_loans_response(LOANS_BODY.as_bytes()).unwrap();
    let floor = floor_price_from_reservoir(RESERVOIR_BODY.as_bytes(), PUNKS).unwrap();
    let series = aggregate(&loans, floor, &BucketPolicy::default());

    assert_eq!(series.valid_loans(), 2);
    assert_eq!(series.skipped_loans(), 1);
    // 61234.5 / 120450.75 -> ~50.8%, 48000 / 120450.75 -> ~39.9%
    let keys: Vec<f64> = series.buckets().iter().map(|b| b.ltv_key).collect();
    assert_eq!(keys, [35.0, 50.0]);
}

#[test]
fn malformed_bodies_are_decode_errors() {
    let err = parse_loans_response(b"<html>rate limited</html>").unwrap_err();
    assert!(matches!(err, IngestError::Decode { what: "nftfi loans", .. }));

    let err = floor_price_from_reservoir(b"{\"collections\": 3}", PUNKS).unwrap_err();
    assert!(matches!(err, IngestError::Decode { .. }));
}

#[test]
fn reservoir_without_usd_floor_is_missing_floor_price() {
    let no_ask = r#"{"collections":[{"id":"0xb7f7f6c52f2e2fdb1963eab30438024864c313f6","floorAsk":null}]}"#;
    let err = floor_price_from_reservoir(no_ask.as_bytes(), PUNKS).unwrap_err();
    assert!(matches!(err, IngestError::MissingFloorPrice(ref c) if c == PUNKS));

    let zero = r#"{"collections":[{"floorAsk":{"price":{"amount":{"usd":0}}}}]}"#;
    assert!(floor_price_from_reservoir(zero.as_bytes(), PUNKS).is_err());

    let empty = r#"{"collections":[]}"#;
    assert!(floor_price_from_reservoir(empty.as_bytes(), PUNKS).is_err());
}

#[test]
fn nftfi_client_builds_collection_query() {
    let (fetcher, calls) = FakeFetcher::new(vec![Ok(LOANS_BODY.as_bytes().to_vec())]);
    let cfg = NftfiConfig {
        fetch: fast_fetch_policy(),
        ..NftfiConfig::default()
    };
    let client = NftfiClient::with_fetcher(cfg, Box::new(fetcher), clock());

    let loans = client.fetch_collection_loans("Wrapped Cryptopunks").unwrap();
    assert_eq!(loans.len(), 3);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let url = &calls[0].0;
    assert!(url.starts_with(
        "https://theta-sdk-api.nftfi.com/data/v0/pipes/loans_due_by_collection_endpoint.json?"
    ));
    assert!(url.contains("nftProjectName=Wrapped+Cryptopunks"));
    assert!(url.contains("daysFromNow=365"));
    assert!(url.contains("page_size=10000"));
    assert!(calls[0].1.is_empty());
}

#[test]
fn transient_failures_are_retried() {
    let (fetcher, calls) = FakeFetcher::new(vec![
        status(503),
        status(429),
        Ok(LOANS_BODY.as_bytes().to_vec()),
    ]);
    let cfg = NftfiConfig {
        fetch: fast_fetch_policy(),
        ..NftfiConfig::default()
    };
    let client = NftfiClient::with_fetcher(cfg, Box::new(fetcher), clock());

    let loans = client.fetch_collection_loans("Autoglyphs").unwrap();
    assert_eq!(loans.len(), 3);
    assert_eq!(calls.lock().unwrap().len(), 3);
}

#[test]
fn client_errors_are_not_retried() {
    let (fetcher, calls) = FakeFetcher::new(vec![status(404), Ok(Vec::new())]);
    let cfg = NftfiConfig {
        fetch: fast_fetch_policy(),
        ..NftfiConfig::default()
    };
    let client = NftfiClient::with_fetcher(cfg, Box::new(fetcher), clock());

    let err = client.fetch_collection_loans("Autoglyphs").unwrap_err();
    assert!(matches!(err, IngestError::HttpStatus { status: 404, .. }));
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn retries_stop_after_configured_attempts() {
    let (fetcher, calls) = FakeFetcher::new(vec![status(500), status(502), status(503)]);
    let cfg = NftfiConfig {
        fetch: fast_fetch_policy(),
        ..NftfiConfig::default()
    };
    let client = NftfiClient::with_fetcher(cfg, Box::new(fetcher), clock());

    let err = client.fetch_collection_loans("Autoglyphs").unwrap_err();
    assert!(matches!(err, IngestError::HttpStatus { status: 503, .. }));
    assert_eq!(calls.lock().unwrap().len(), 3);
}

#[test]
fn reservoir_client_requires_api_key() {
    let (fetcher, calls) = FakeFetcher::new(vec![Ok(RESERVOIR_BODY.as_bytes().to_vec())]);
    let client = ReservoirClient::with_fetcher(
        ReservoirConfig {
            api_key: Some("  ".to_string()),
            fetch: fast_fetch_policy(),
            ..ReservoirConfig::default()
        },
        Box::new(fetcher),
        clock(),
    );

    let err = client.fetch_floor_price_usd(PUNKS).unwrap_err();
    assert!(matches!(err, IngestError::MissingApiKey));
    assert!(calls.lock().unwrap().is_empty());
}

#[test]
fn reservoir_client_sends_key_and_reads_usd_floor() {
    let (fetcher, calls) = FakeFetcher::new(vec![Ok(RESERVOIR_BODY.as_bytes().to_vec())]);
    let client = ReservoirClient::with_fetcher(
        ReservoirConfig {
            api_key: Some("test-key".to_string()),
            fetch: fast_fetch_policy(),
            ..ReservoirConfig::default()
        },
        Box::new(fetcher),
        clock(),
    );

    let floor = client.fetch_floor_price_usd(PUNKS).unwrap();
    assert_eq!(floor, 120450.75);

    let calls = calls.lock().unwrap();
    assert_eq!(
        calls[0].0,
        format!("https://api.reservoir.tools/collections/v7?id={PUNKS}")
    );
    assert_eq!(
        calls[0].1,
        vec![("x-api-key".to_string(), "test-key".to_string())]
    );
}

#[test]
fn rate_limiter_allows_five_requests_per_second() {
    let clock = Arc::new(ManualClock::new(0));
    let mut limiter = RateLimiter::new(5, 1_000, clock.clone());

    for _ in 0..5 {
        assert_eq!(limiter.acquire(), 0);
    }
    assert_eq!(limiter.acquire(), 1_000);

    clock.advance(400);
    assert_eq!(limiter.acquire(), 600);

    clock.advance(5_000);
    for _ in 0..5 {
        assert_eq!(limiter.acquire(), 0);
    }
}
