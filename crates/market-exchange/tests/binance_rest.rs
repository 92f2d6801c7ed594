//! Binance REST 커넥터 통합 테스트 (mockito 서버 사용).

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use market_core::Timeframe;
use market_exchange::{
    BinanceClient, BinanceConfig, CandleSource, CircuitBreakerConfig, ExchangeError,
    ExchangeHandle, FetchConfig, HistoricalFetcher, RateLimitConfig,
};
use mockito::Matcher;
use rust_decimal_macros::dec;

fn client(server: &mockito::ServerGuard) -> BinanceClient {
    BinanceClient::new(BinanceConfig::default().with_rest_base_url(server.url())).unwrap()
}

#[tokio::test]
async fn test_fetch_klines_parses_rows() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v3/klines")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
            Matcher::UrlEncoded("interval".into(), "1h".into()),
            Matcher::UrlEncoded("startTime".into(), "1704067200000".into()),
            Matcher::UrlEncoded("limit".into(), "2".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"[
                [1704067200000,"42000.00","42500.00","41800.00","42300.00","120.5",1704070799999,"0",10,"0","0","0"],
                [1704070800000,"42300.00","42400.00","42100.00","42200.00","98.25",1704074399999,"0",8,"0","0","0"]
            ]"#,
        )
        .create_async()
        .await;

    let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let candles = client(&server)
        .fetch_candles("BTC/USDT", Timeframe::H1, since, 2)
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(candles.len(), 2);
    assert_eq!(candles[0].exchange, "binance");
    assert_eq!(candles[0].symbol, "BTC/USDT");
    assert_eq!(candles[0].timestamp_ms, Some(1_704_067_200_000));
    assert_eq!(candles[0].high, Some(dec!(42500.00)));
    assert_eq!(candles[1].volume, Some(dec!(98.25)));
}

#[tokio::test]
async fn test_http_429_maps_to_rate_limited() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v3/klines")
        .match_query(Matcher::Any)
        .with_status(429)
        .with_body(r#"{"code":-1003,"msg":"Too many requests"}"#)
        .create_async()
        .await;

    let err = client(&server)
        .fetch_candles("BTC/USDT", Timeframe::M1, Utc::now(), 10)
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::RateLimited(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_unknown_symbol_is_not_retryable() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v3/klines")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(r#"{"code":-1121,"msg":"Invalid symbol."}"#)
        .create_async()
        .await;

    let err = client(&server)
        .fetch_candles("NOPE/USDT", Timeframe::M1, Utc::now(), 10)
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::SymbolNotFound(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_server_error_without_code() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v3/klines")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("Service Unavailable")
        .create_async()
        .await;

    let err = client(&server)
        .fetch_candles("BTC/USDT", Timeframe::M1, Utc::now(), 10)
        .await
        .unwrap_err();

    assert!(matches!(err, ExchangeError::ServerError { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_backfill_up_to_now_skips_open_kline() {
    let hour_ms = Timeframe::H1.duration_ms();
    let now_ms = Utc::now().timestamp_millis();
    let current = now_ms - now_ms.rem_euclid(hour_ms);
    let previous = current - hour_ms;

    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/v3/klines")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"[
                [{prev},"42000.00","42500.00","41800.00","42300.00","120.5",{prev_close},"0",10,"0","0","0"],
                [{cur},"42300.00","42350.00","42250.00","42310.00","3.1",{cur_close},"0",2,"0","0","0"]
            ]"#,
            prev = previous,
            prev_close = current - 1,
            cur = current,
            cur_close = current + hour_ms - 1,
        ))
        .create_async()
        .await;

    let handle = ExchangeHandle::new(
        Arc::new(client(&server)),
        RateLimitConfig::binance(),
        CircuitBreakerConfig::default(),
    );
    let fetcher = HistoricalFetcher::new(handle, FetchConfig::default());
    let start = Utc.timestamp_millis_opt(previous).unwrap();

    let fetch = fetcher
        .fetch_historical("BTC/USDT", Timeframe::H1, start, Utc::now())
        .await
        .unwrap();

    assert!(fetch.failed_batches.is_empty());
    assert_eq!(fetch.candles.len(), 1);
    assert_eq!(fetch.candles[0].timestamp_ms, Some(previous));
    assert_eq!(fetch.candles[0].volume, Some(dec!(120.5)));
}
