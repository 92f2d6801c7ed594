//! 실시간 수집 종단 간 테스트: 버퍼 flush, 잘못된 메시지의 데드레터 격리.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use market_collector::{CollectorConfig, IngestStats, Pipeline};
use market_core::{RawCandle, SeriesKey, Timeframe};
use market_data::{DeadLetterKind, StorageConfig};
use market_exchange::{
    CandleSource, CircuitBreakerConfig, ExchangeError, ExchangeHandle, ExchangeRegistry,
    ExchangeResult, RateLimitConfig, RawMessageStream,
};
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

/// 2024-01-01 00:00:00 UTC
const BASE_MS: i64 = 1_704_067_200_000;
const MINUTE_MS: i64 = 60_000;
const VALID: i64 = 150;

fn key() -> SeriesKey {
    SeriesKey::new("fake", "BTC/USDT", Timeframe::M1)
}

/// 첫 연결에서 유효한 캔들 150개와 깨진 메시지 3개를 보내고 조용해지는 거래소.
struct ScriptedStream {
    connects: AtomicU32,
}

impl ScriptedStream {
    fn new() -> Self {
        Self {
            connects: AtomicU32::new(0),
        }
    }

    fn script() -> Vec<ExchangeResult<String>> {
        let mut messages = Vec::new();
        let mut garbage = 0;
        for i in 0..VALID {
            messages.push(Ok(format!("candle:{}", i)));
            if i % 50 == 40 {
                messages.push(Ok(format!("garbage-{}", garbage)));
                garbage += 1;
            }
        }
        messages
    }
}

#[async_trait]
impl CandleSource for ScriptedStream {
    fn exchange_id(&self) -> &str {
        "fake"
    }

    fn max_candles_per_request(&self) -> u32 {
        100
    }

    async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        _since: DateTime<Utc>,
        _limit: u32,
    ) -> ExchangeResult<Vec<RawCandle>> {
        Ok(Vec::new())
    }

    async fn connect_stream(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
    ) -> ExchangeResult<RawMessageStream> {
        if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(stream::iter(Self::script()).chain(stream::pending()).boxed())
        } else {
            Ok(stream::pending::<ExchangeResult<String>>().boxed())
        }
    }

    fn parse_stream_message(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        text: &str,
    ) -> ExchangeResult<Option<RawCandle>> {
        let i: i64 = text
            .strip_prefix("candle:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| ExchangeError::ParseError(format!("unrecognized message: {}", text)))?;

        let key = SeriesKey::new("fake", symbol, timeframe);
        let price = Decimal::from(42_000 + i);
        Ok(Some(RawCandle::complete(
            &key,
            BASE_MS + i * MINUTE_MS,
            price,
            price + Decimal::from(8),
            price - Decimal::from(8),
            price + Decimal::from(1),
            Decimal::from(2),
        )))
    }
}

async fn pipeline(dir: &Path, max_records: usize, flush_interval_ms: u64) -> Pipeline {
    let mut config = CollectorConfig::default();
    config.storage = StorageConfig::in_dir(dir);
    config.checkpoint.dir = dir.join("checkpoints");
    config.dead_letter.dir = dir.join("dead_letter");
    config.alerts.path = dir.join("alerts.jsonl");
    config.stream.buffer.max_records = max_records;
    config.stream.buffer.flush_interval_ms = flush_interval_ms;

    let mut registry = ExchangeRegistry::new();
    registry.register(ExchangeHandle::new(
        Arc::new(ScriptedStream::new()),
        RateLimitConfig::default(),
        CircuitBreakerConfig::default(),
    ));
    Pipeline::with_registry(config, registry).await.unwrap()
}

/// 조건이 참이 될 때까지 최대 5초 기다립니다.
async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_malformed_messages_are_dead_lettered_and_valid_rows_stored() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path(), 1000, 60_000).await;
    let ingest = Arc::new(pipeline.live_ingest("fake").unwrap());
    let buffer = ingest.buffer().clone();
    let dead_letters = pipeline.dead_letters.clone();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let ingest = ingest.clone();
        let cancel = cancel.clone();
        async move {
            ingest
                .run(&["BTC/USDT".to_string()], Timeframe::M1, cancel)
                .await
        }
    });

    wait_until(|| {
        let buffer = buffer.clone();
        let dead_letters = dead_letters.clone();
        async move {
            buffer.pending().await == VALID as usize && dead_letters.len().await.unwrap() == 3
        }
    })
    .await;

    // 긴 flush 주기 동안에는 아무것도 저장되지 않음
    assert_eq!(pipeline.storage.count(&key()).await.unwrap(), 0);

    cancel.cancel();
    let stats: IngestStats = task.await.unwrap().unwrap();

    assert_eq!(stats.received, VALID as u64);
    assert_eq!(stats.malformed, 3);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.stored, VALID as u64);
    assert_eq!(stats.dead_lettered_rows, 0);
    assert_eq!(buffer.pending().await, 0);

    assert_eq!(pipeline.storage.count(&key()).await.unwrap(), VALID as u64);
    let rows = pipeline
        .storage
        .query_range(
            &key(),
            DateTime::from_timestamp_millis(BASE_MS).unwrap(),
            DateTime::from_timestamp_millis(BASE_MS + (VALID - 1) * MINUTE_MS).unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), VALID as usize);
    assert_eq!(rows[0].close, Decimal::from(42_001));

    let mut payloads: Vec<String> = pipeline
        .dead_letters
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| {
            assert_eq!(entry.kind, DeadLetterKind::WireMessage);
            assert_eq!(entry.series, Some(key()));
            assert_eq!(entry.attempt_count, 1);
            entry.raw_payload
        })
        .collect();
    payloads.sort();
    assert_eq!(payloads, vec!["garbage-0", "garbage-1", "garbage-2"]);
}

#[tokio::test]
async fn test_full_buffer_flushes_before_interval() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path(), 40, 60_000).await;
    let ingest = Arc::new(pipeline.live_ingest("fake").unwrap());
    let buffer = ingest.buffer().clone();
    let storage = pipeline.storage.clone();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let ingest = ingest.clone();
        let cancel = cancel.clone();
        async move {
            ingest
                .run(&["BTC/USDT".to_string()], Timeframe::M1, cancel)
                .await
        }
    });

    // 40개마다 flush: 120개 저장, 30개 대기
    wait_until(|| {
        let buffer = buffer.clone();
        let storage = storage.clone();
        async move {
            storage.count(&key()).await.unwrap() == 120 && buffer.pending().await == 30
        }
    })
    .await;

    cancel.cancel();
    let stats = task.await.unwrap().unwrap();

    // 종료 시 남은 30개도 flush
    assert_eq!(stats.stored, VALID as u64);
    assert_eq!(stats.flushes, 4);
    assert_eq!(pipeline.storage.count(&key()).await.unwrap(), VALID as u64);
}
