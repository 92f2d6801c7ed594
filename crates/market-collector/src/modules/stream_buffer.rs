//! 실시간 경로의 쓰기 버퍼.
//!
//! 검증된 행을 메모리에 모았다가 행 수 또는 시간 기준으로 flush합니다.
//! 배치는 저장에 성공했거나 데드레터에 기록된 뒤에만 메모리에서 지워집니다.
//! 그 전까지는 계속 버퍼에 남아 있으므로 행이 조용히 사라지지 않습니다.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use market_core::{OhlcvRecord, SeriesKey};
use market_data::{DataError, DeadLetterKind, DeadLetterSink, InsertReport, StorageManager};
use market_exchange::{with_retry_if, RetryConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::Result;

/// 버퍼 flush 정책
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamBufferConfig {
    /// 이 행 수에 도달하면 즉시 flush
    #[serde(default = "default_max_records")]
    pub max_records: usize,
    /// 주기적 flush 간격 (밀리초)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// 저장 실패 시 재시도 정책
    #[serde(default)]
    pub flush_retry: RetryConfig,
}

fn default_max_records() -> usize {
    1000
}
fn default_flush_interval_ms() -> u64 {
    5_000
}

impl Default for StreamBufferConfig {
    fn default() -> Self {
        Self {
            max_records: default_max_records(),
            flush_interval_ms: default_flush_interval_ms(),
            flush_retry: RetryConfig::default(),
        }
    }
}

impl StreamBufferConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// flush 결과
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// 비어 있어 할 일 없음
    Empty,
    /// 저장 성공
    Stored(InsertReport),
    /// 재시도 소진 또는 재시도 불가 에러로 데드레터에 기록
    DeadLettered {
        rows: usize,
        entry_id: String,
        reason: String,
    },
}

/// 스트림 버퍼
pub struct StreamBuffer {
    storage: Arc<StorageManager>,
    dead_letters: Arc<DeadLetterSink>,
    config: StreamBufferConfig,
    /// 읽기 루프가 추가하고 flush가 앞에서부터 비웁니다.
    pending: Mutex<Vec<OhlcvRecord>>,
    /// flush는 한 번에 하나만
    flush_gate: Mutex<()>,
    stored: AtomicU64,
    dead_lettered: AtomicU64,
    flushes: AtomicU64,
}

impl StreamBuffer {
    pub fn new(
        storage: Arc<StorageManager>,
        dead_letters: Arc<DeadLetterSink>,
        config: StreamBufferConfig,
    ) -> Self {
        Self {
            storage,
            dead_letters,
            config,
            pending: Mutex::new(Vec::new()),
            flush_gate: Mutex::new(()),
            stored: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &StreamBufferConfig {
        &self.config
    }

    /// 행을 추가하고 대기 중인 행 수를 돌려줍니다.
    pub async fn push(&self, rows: impl IntoIterator<Item = OhlcvRecord>) -> usize {
        let mut pending = self.pending.lock().await;
        pending.extend(rows);
        pending.len()
    }

    /// 대기 중인 행 수.
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// 행 수 기준 flush가 필요한지.
    pub fn is_full(&self, pending: usize) -> bool {
        pending >= self.config.max_records.max(1)
    }

    /// 저장된 행 수.
    pub fn stored_rows(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    /// 데드레터로 보낸 행 수.
    pub fn dead_lettered_rows(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// 비어 있지 않았던 flush 횟수.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// 현재 대기 중인 행을 저장합니다.
    ///
    /// 스냅샷을 뜬 뒤 재시도하며 저장하고, 성공하거나 데드레터 기록이 끝난 뒤에만
    /// 그 행들을 버퍼에서 지웁니다. flush 중에 추가된 행은 다음 flush 대상입니다.
    /// 데드레터 기록마저 실패하면 행은 버퍼에 남고 `Err`를 돌려줍니다.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let _gate = self.flush_gate.lock().await;

        let batch: Vec<OhlcvRecord> = {
            let pending = self.pending.lock().await;
            if pending.is_empty() {
                return Ok(FlushOutcome::Empty);
            }
            pending.clone()
        };
        let count = batch.len();
        self.flushes.fetch_add(1, Ordering::Relaxed);

        let storage = &self.storage;
        let rows = &batch;
        let result = with_retry_if(
            &self.config.flush_retry,
            "stream_flush",
            || async move { storage.insert(rows).await },
            DataError::is_retryable,
        )
        .await;

        let outcome = match result {
            Ok(report) => {
                self.stored.fetch_add(report.inserted as u64, Ordering::Relaxed);
                debug!(rows = count, inserted = report.inserted, "버퍼 flush 완료");
                FlushOutcome::Stored(report)
            }
            Err(failure) => {
                let reason = failure.error.to_string();
                let payload = serde_json::to_string(&batch).map_err(DataError::from)?;
                let entry = self
                    .dead_letters
                    .record(
                        DeadLetterKind::CandleBatch,
                        common_series(&batch),
                        payload,
                        reason.clone(),
                        failure.attempts,
                    )
                    .await?;
                self.dead_lettered.fetch_add(count as u64, Ordering::Relaxed);
                error!(rows = count, attempts = failure.attempts, entry = %entry.id, "배치를 데드레터로 이동");
                FlushOutcome::DeadLettered {
                    rows: count,
                    entry_id: entry.id,
                    reason,
                }
            }
        };

        let mut pending = self.pending.lock().await;
        pending.drain(..count);
        Ok(outcome)
    }
}

/// 배치 전체가 한 시계열이면 그 키.
fn common_series(batch: &[OhlcvRecord]) -> Option<SeriesKey> {
    let first = batch.first()?.series_key();
    batch.iter().all(|r| r.series_key() == first).then_some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::{utc_from_millis, Timeframe};
    use market_data::StorageConfig;
    use rust_decimal_macros::dec;

    const BASE: i64 = 1_704_067_200_000;

    fn candle(i: i64) -> OhlcvRecord {
        OhlcvRecord {
            exchange: "binance".into(),
            symbol: "ETH/USDT".into(),
            timeframe: Timeframe::M1,
            timestamp: utc_from_millis(BASE + i * 60_000).unwrap(),
            open: dec!(2300),
            high: dec!(2310),
            low: dec!(2290),
            close: dec!(2305),
            volume: dec!(3),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay_ms: 5,
            multiplier: 2.0,
            max_delay_ms: 20,
            jitter: 0.0,
        }
    }

    async fn buffer(dir: &std::path::Path) -> StreamBuffer {
        let storage = Arc::new(StorageManager::open(&StorageConfig::in_dir(dir)).await.unwrap());
        let dlq = Arc::new(DeadLetterSink::open(dir.join("dlq")).await.unwrap());
        StreamBuffer::new(
            storage,
            dlq,
            StreamBufferConfig {
                max_records: 10,
                flush_interval_ms: 1_000,
                flush_retry: fast_retry(),
            },
        )
    }

    #[tokio::test]
    async fn test_flush_stores_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer(dir.path()).await;

        assert_eq!(buffer.flush().await.unwrap(), FlushOutcome::Empty);

        let pending = buffer.push((0..10).map(candle)).await;
        assert!(buffer.is_full(pending));

        match buffer.flush().await.unwrap() {
            FlushOutcome::Stored(report) => assert_eq!(report.inserted, 10),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(buffer.pending().await, 0);
        assert_eq!(buffer.stored_rows(), 10);
        assert_eq!(buffer.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_unstorable_batch_goes_to_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = buffer(dir.path()).await;

        // CHECK 제약 위반: 재시도 불가 에러라 한 번만 시도
        let mut bad = candle(0);
        bad.high = dec!(1);
        buffer.push([bad, candle(1)]).await;

        match buffer.flush().await.unwrap() {
            FlushOutcome::DeadLettered { rows, .. } => assert_eq!(rows, 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(buffer.pending().await, 0);
        assert_eq!(buffer.dead_lettered_rows(), 2);

        let entries = buffer.dead_letters.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, DeadLetterKind::CandleBatch);
        assert_eq!(entries[0].attempt_count, 1);
        let rows: Vec<OhlcvRecord> = serde_json::from_str(&entries[0].raw_payload).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(entries[0].series, Some(candle(0).series_key()));
    }
}
