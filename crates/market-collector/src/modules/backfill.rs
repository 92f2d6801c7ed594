//! 과거 데이터 백필 작업.
//!
//! 윈도우를 시간순으로 조회 → 검증 → 저장하고, 윈도우가 커밋될 때마다
//! 체크포인트를 갱신한 뒤 다음 윈도우로 넘어갑니다. 따라서 중단 후 재개해도
//! 커밋된 윈도우를 건너뛰는 일은 없고, 커밋되지 않은 윈도우만 다시 받습니다.
//!
//! 실패한 윈도우가 생기면 이후 윈도우는 계속 저장하지만 체크포인트는 그 공백
//! 앞에 머뭅니다. 재개하면 공백부터 다시 받고, 이미 저장된 행은 중복 제거됩니다.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use market_core::{SeriesKey, Timeframe};
use market_data::{AlertLevel, AlertManager, DataError, StorageManager, Validator};
use market_exchange::{
    with_retry_if, FailedBatch, FetchWindow, HistoricalFetcher, RetryConfig, WindowOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::CollectorError;
use crate::modules::checkpoint::{BackfillCheckpoint, CheckpointStatus, CheckpointStore};
use crate::stats::BackfillReport;
use crate::Result;

const ALERT_SOURCE: &str = "backfill";

/// 백필 요청
#[derive(Debug, Clone)]
pub struct BackfillRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// 첫 캔들 시각 (포함)
    pub start: DateTime<Utc>,
    /// 마지막 캔들 시각 (포함)
    pub end: DateTime<Utc>,
    /// 체크포인트에서 재개
    pub resume: bool,
}

/// 백필 작업
pub struct BackfillJob {
    fetcher: HistoricalFetcher,
    storage: Arc<StorageManager>,
    checkpoints: CheckpointStore,
    alerts: Arc<AlertManager>,
    validator: Validator,
    /// 저장 실패 재시도 정책
    store_retry: RetryConfig,
}

impl BackfillJob {
    pub fn new(
        fetcher: HistoricalFetcher,
        storage: Arc<StorageManager>,
        checkpoints: CheckpointStore,
        alerts: Arc<AlertManager>,
        store_retry: RetryConfig,
    ) -> Self {
        Self {
            fetcher,
            storage,
            checkpoints,
            alerts,
            validator: Validator::new(),
            store_retry,
        }
    }

    /// 검증기 교체.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// 백필을 실행합니다.
    ///
    /// - Circuit Breaker 거부는 즉시 `Err`로 돌려주고 체크포인트는 interrupted로 남깁니다.
    /// - 재시도를 소진한 윈도우는 보고서의 `failed_batches`에 남고 작업은 계속됩니다.
    /// - 체크포인트는 실패 윈도우 없이 끝났을 때만 삭제됩니다.
    #[instrument(skip(self, cancel), fields(exchange = %self.fetcher.exchange_id(), symbol = %request.symbol, timeframe = %request.timeframe))]
    pub async fn run(
        &self,
        request: &BackfillRequest,
        cancel: CancellationToken,
    ) -> Result<BackfillReport> {
        if request.start > request.end {
            return Err(CollectorError::InvalidArgument(format!(
                "start {} is after end {}",
                request.start, request.end
            )));
        }

        let started = Instant::now();
        let key = SeriesKey::new(self.fetcher.exchange_id(), request.symbol.clone(), request.timeframe);
        let mut report = BackfillReport::new(key.to_string());

        let mut checkpoint = self.prepare_checkpoint(&key, request).await?;
        let start = checkpoint.resume_from();
        if request.resume && checkpoint.last_completed_timestamp.is_some() {
            report.resumed_from = Some(start);
        }
        checkpoint.range_end = request.end;
        checkpoint.status = CheckpointStatus::Running;
        self.checkpoints.save(&checkpoint).await?;

        let windows = if start <= request.end {
            self.fetcher.plan(request.timeframe, start, request.end)
        } else {
            Vec::new()
        };
        report.windows = windows.len();
        info!(series = %key, from = %start, to = %request.end, windows = windows.len(), "백필 시작");

        // 체크포인트가 지금까지 끊김 없이 따라왔는지
        let mut contiguous = true;

        for window in windows {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                outcome = self.fetcher.fetch_window(&request.symbol, request.timeframe, window) => outcome,
            };

            let raw = match fetched {
                Ok(WindowOutcome::Fetched(raw)) => raw,
                Ok(WindowOutcome::Failed(failed)) => {
                    contiguous = false;
                    report.failed_batches.push(failed);
                    continue;
                }
                Err(e) => {
                    self.interrupt(&mut checkpoint).await;
                    self.alert(AlertLevel::Error, format!("backfill for {} aborted: {}", key, e))
                        .await;
                    return Err(e.into());
                }
            };

            let outcome = self.validator.validate(&raw);
            for rejected in &outcome.rejected {
                warn!(
                    series = %key,
                    timestamp = ?rejected.row.timestamp_ms,
                    reason = %rejected.reason,
                    "검증 실패 행 제외"
                );
            }
            report.rows_fetched += raw.len();
            report.rows_rejected += outcome.rejected.len();

            match self.store_window(&outcome.clean, window).await {
                Ok((inserted, duplicates)) => {
                    report.committed_windows += 1;
                    report.rows_inserted += inserted;
                    report.duplicates += duplicates;
                    if contiguous {
                        checkpoint.advance(window.end, raw.len() as u64);
                        self.checkpoints.save(&checkpoint).await?;
                    }
                }
                Err(failed) => {
                    contiguous = false;
                    report.failed_batches.push(failed);
                }
            }
        }

        if report.cancelled {
            self.interrupt(&mut checkpoint).await;
            warn!(series = %key, "백필 취소, 체크포인트 유지");
        } else if report.failed_batches.is_empty() {
            report.checkpoint_deleted = self.checkpoints.delete(&key).await?;
        } else {
            self.interrupt(&mut checkpoint).await;
            self.alert(
                AlertLevel::Error,
                format!("backfill for {} finished with failed windows", key),
            )
            .await;
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    /// 재개 여부에 따라 체크포인트를 불러오거나 새로 만듭니다.
    async fn prepare_checkpoint(
        &self,
        key: &SeriesKey,
        request: &BackfillRequest,
    ) -> Result<BackfillCheckpoint> {
        let existing = self.checkpoints.load(key).await;

        if request.resume {
            return match existing {
                Ok(Some(checkpoint)) => {
                    info!(
                        series = %key,
                        last_completed = ?checkpoint.last_completed_timestamp,
                        records = checkpoint.records_fetched,
                        "체크포인트에서 재개"
                    );
                    Ok(checkpoint)
                }
                Ok(None) => {
                    info!(series = %key, "체크포인트 없음, 처음부터 시작");
                    Ok(BackfillCheckpoint::new(key, request.start, request.end))
                }
                Err(e) => {
                    self.alert(
                        AlertLevel::Critical,
                        format!("checkpoint for {} is unreadable", key),
                    )
                    .await;
                    Err(e)
                }
            };
        }

        match existing {
            Ok(Some(old)) => warn!(
                series = %key,
                last_completed = ?old.last_completed_timestamp,
                "기존 체크포인트를 덮어쓰고 새로 시작"
            ),
            Err(e) => warn!(series = %key, error = %e, "읽을 수 없는 체크포인트를 덮어쓰고 새로 시작"),
            Ok(None) => {}
        }
        Ok(BackfillCheckpoint::new(key, request.start, request.end))
    }

    /// 윈도우 하나를 재시도하며 저장합니다. (inserted, duplicates)
    async fn store_window(
        &self,
        rows: &[market_core::OhlcvRecord],
        window: FetchWindow,
    ) -> std::result::Result<(usize, usize), FailedBatch> {
        let storage = &self.storage;
        let result = with_retry_if(
            &self.store_retry,
            "backfill_store",
            || async move { storage.insert(rows).await },
            DataError::is_retryable,
        )
        .await;

        match result {
            Ok(report) => Ok((report.inserted, report.duplicates())),
            Err(failure) => {
                warn!(
                    start = %window.start,
                    end = %window.end,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "윈도우 저장 실패, FailedBatch로 기록"
                );
                Err(FailedBatch {
                    window_start: window.start,
                    window_end: window.end,
                    error_message: failure.error.to_string(),
                    retry_count: failure.attempts,
                    last_attempt_at: Utc::now(),
                })
            }
        }
    }

    /// 체크포인트를 interrupted로 남깁니다. 실패해도 작업 결과는 그대로 보고합니다.
    async fn interrupt(&self, checkpoint: &mut BackfillCheckpoint) {
        checkpoint.status = CheckpointStatus::Interrupted;
        checkpoint.updated_at = Utc::now();
        if let Err(e) = self.checkpoints.save(checkpoint).await {
            warn!(error = %e, "체크포인트 상태 저장 실패");
        }
    }

    async fn alert(&self, level: AlertLevel, message: String) {
        if let Err(e) = self.alerts.emit(level, ALERT_SOURCE, message).await {
            warn!(error = %e, "알림 기록 실패");
        }
    }
}
