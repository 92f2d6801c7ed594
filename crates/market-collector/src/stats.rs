//! 작업 결과 통계 구조체.

use std::time::Duration;

use chrono::{DateTime, Utc};
use market_exchange::FailedBatch;
use serde::{Deserialize, Serialize};

/// 백필 작업 보고서
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackfillReport {
    /// 대상 시계열 (`exchange:symbol:timeframe`)
    pub series: String,
    /// 계획된 윈도우 수
    pub windows: usize,
    /// 커밋된 윈도우 수
    pub committed_windows: usize,
    /// 거래소에서 받은 행 수
    pub rows_fetched: usize,
    /// 새로 저장된 행 수
    pub rows_inserted: usize,
    /// 검증에서 거부된 행 수
    pub rows_rejected: usize,
    /// 중복으로 제거된 행 수
    pub duplicates: usize,
    /// 재시도를 소진한 윈도우
    pub failed_batches: Vec<FailedBatch>,
    /// 체크포인트에서 재개한 경우 시작 시각
    pub resumed_from: Option<DateTime<Utc>>,
    /// 취소로 중단됨
    pub cancelled: bool,
    /// 완료 후 체크포인트 삭제 여부
    pub checkpoint_deleted: bool,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BackfillReport {
    /// 새 보고서 생성
    pub fn new(series: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            ..Default::default()
        }
    }

    /// 실패 윈도우 없이 끝까지 진행했는지
    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failed_batches.is_empty()
    }

    /// 통계 요약 로그 출력
    pub fn log_summary(&self) {
        tracing::info!(
            series = %self.series,
            windows = self.windows,
            committed = self.committed_windows,
            fetched = self.rows_fetched,
            inserted = self.rows_inserted,
            rejected = self.rows_rejected,
            duplicates = self.duplicates,
            failed = self.failed_batches.len(),
            resumed_from = ?self.resumed_from,
            cancelled = self.cancelled,
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "백필 완료"
        );
        for failed in &self.failed_batches {
            tracing::warn!(
                start = %failed.window_start,
                end = %failed.window_end,
                retries = failed.retry_count,
                error = %failed.error_message,
                "실패한 윈도우"
            );
        }
    }
}

/// 실시간 수집 통계
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStats {
    /// 받은 캔들 메시지 수
    pub received: u64,
    /// 형태가 잘못된 메시지 수
    pub malformed: u64,
    /// 검증에서 거부된 캔들 수
    pub rejected: u64,
    /// 저장된 행 수
    pub stored: u64,
    /// 데드레터로 보낸 배치의 행 수
    pub dead_lettered_rows: u64,
    /// flush 횟수
    pub flushes: u64,
    /// 소요 시간
    #[serde(skip)]
    pub elapsed: Duration,
}

impl IngestStats {
    /// 통계 요약 로그 출력
    pub fn log_summary(&self) {
        tracing::info!(
            received = self.received,
            malformed = self.malformed,
            rejected = self.rejected,
            stored = self.stored,
            dead_lettered_rows = self.dead_lettered_rows,
            flushes = self.flushes,
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "실시간 수집 종료"
        );
    }
}

/// 데드레터 재처리 보고서
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayReport {
    /// 검사한 항목 수
    pub entries: usize,
    /// 저장 후 삭제된 항목 수
    pub replayed: usize,
    /// 새로 저장된 행 수
    pub rows_inserted: usize,
    /// 여전히 실패하는 항목 수 (그대로 남음)
    pub still_failing: usize,
}

impl ReplayReport {
    /// 통계 요약 로그 출력
    pub fn log_summary(&self) {
        tracing::info!(
            entries = self.entries,
            replayed = self.replayed,
            rows_inserted = self.rows_inserted,
            still_failing = self.still_failing,
            "데드레터 재처리 완료"
        );
    }
}
