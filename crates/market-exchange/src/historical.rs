//! 거래소 중립적 과거 캔들 조회.
//!
//! `[start, end]` 구간을 요청 한도 크기의 윈도우로 나누고, 윈도우마다
//! Rate limit → Circuit Breaker → REST 요청 순으로 호출합니다.
//! 실패한 윈도우는 재시도 후 `FailedBatch`로 기록되고 다음 윈도우로 넘어갑니다.
//!
//! ```rust,ignore
//! let fetcher = HistoricalFetcher::new(handle, FetchConfig::default());
//! let fetch = fetcher.fetch_historical("BTC/USDT", Timeframe::H1, start, end).await?;
//! ```

use std::time::Duration;

use chrono::{DateTime, Months, Utc};
use market_core::{utc_from_millis, RawCandle, Timeframe};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::registry::ExchangeHandle;
use crate::retry::{with_retry, RetryConfig};
use crate::{ExchangeError, ExchangeResult};

/// 과거 조회 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// 윈도우 재시도 정책
    #[serde(default)]
    pub retry: RetryConfig,
    /// RateLimiter 대기 상한 (밀리초)
    #[serde(default = "default_rate_limit_timeout_ms")]
    pub rate_limit_timeout_ms: u64,
    /// 윈도우당 캔들 수. 없으면 거래소 최대값
    #[serde(default)]
    pub window_limit: Option<u32>,
}

fn default_rate_limit_timeout_ms() -> u64 {
    30_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            rate_limit_timeout_ms: default_rate_limit_timeout_ms(),
            window_limit: None,
        }
    }
}

/// 조회 윈도우 하나.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    /// 첫 캔들 시작 시각 (포함)
    pub start: DateTime<Utc>,
    /// 마지막 캔들 시작 시각 (포함)
    pub end: DateTime<Utc>,
    /// 요청 limit
    pub limit: u32,
}

/// 재시도를 모두 소진한 윈도우 기록.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBatch {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub error_message: String,
    pub retry_count: u32,
    pub last_attempt_at: DateTime<Utc>,
}

/// 윈도우 조회 결과.
#[derive(Debug, Clone)]
pub enum WindowOutcome {
    /// 오른쪽 경계로 잘라낸 캔들
    Fetched(Vec<RawCandle>),
    /// 재시도 소진
    Failed(FailedBatch),
}

/// 구간 전체 조회 결과.
#[derive(Debug, Clone, Default)]
pub struct HistoricalFetch {
    pub candles: Vec<RawCandle>,
    pub failed_batches: Vec<FailedBatch>,
}

/// `[start, end]`를 `limit`개 단위 윈도우로 나눕니다.
///
/// 시작점은 캔들 경계로 내림 정렬합니다. `end`는 마지막 캔들의 시작 시각(포함)입니다.
pub fn plan_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    timeframe: Timeframe,
    limit: u32,
) -> Vec<FetchWindow> {
    let step = timeframe.duration_ms();
    let limit = limit.max(1);
    let mut cursor = align_down(start.timestamp_millis(), timeframe);
    let end_ms = end.timestamp_millis();
    let mut windows = Vec::new();

    while cursor <= end_ms {
        let window_end = (cursor + step * (limit as i64 - 1)).min(end_ms);
        match (utc_from_millis(cursor), utc_from_millis(window_end)) {
            (Some(start), Some(end)) => windows.push(FetchWindow { start, end, limit }),
            _ => break,
        }
        cursor += step * limit as i64;
    }
    windows
}

/// `timestamp_ms`에 시작한 캔들이 `now_ms` 시점에 마감되었는지.
///
/// 월봉은 달력 기준 다음 달 1일에 마감됩니다.
pub fn is_closed(timestamp_ms: i64, timeframe: Timeframe, now_ms: i64) -> bool {
    let close_ms = match timeframe {
        Timeframe::MN1 => utc_from_millis(timestamp_ms)
            .and_then(|open| open.checked_add_months(Months::new(1)))
            .map(|close| close.timestamp_millis()),
        _ => timestamp_ms.checked_add(timeframe.duration_ms()),
    };
    close_ms.map_or(false, |close| close <= now_ms)
}

fn align_down(timestamp_ms: i64, timeframe: Timeframe) -> i64 {
    if timeframe > Timeframe::D1 {
        timestamp_ms
    } else {
        timestamp_ms - timestamp_ms.rem_euclid(timeframe.duration_ms())
    }
}

/// 윈도우 단위 과거 캔들 조회기.
pub struct HistoricalFetcher {
    handle: ExchangeHandle,
    config: FetchConfig,
}

impl HistoricalFetcher {
    pub fn new(handle: ExchangeHandle, config: FetchConfig) -> Self {
        Self { handle, config }
    }

    /// 거래소 ID.
    pub fn exchange_id(&self) -> &str {
        self.handle.exchange_id()
    }

    /// 윈도우당 캔들 수.
    pub fn window_limit(&self) -> u32 {
        let max = self.handle.source.max_candles_per_request();
        self.config.window_limit.map_or(max, |limit| limit.clamp(1, max))
    }

    /// 구간을 윈도우로 나눕니다.
    pub fn plan(
        &self,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<FetchWindow> {
        plan_windows(start, end, timeframe, self.window_limit())
    }

    /// 윈도우 하나를 재시도 정책에 따라 조회합니다.
    ///
    /// 재시도 소진은 `WindowOutcome::Failed`로 돌려주고, Circuit Breaker 거부는
    /// 거래소 전체를 멈춰야 하므로 `Err`로 돌려줍니다.
    #[instrument(skip(self), fields(exchange = %self.exchange_id()))]
    pub async fn fetch_window(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        window: FetchWindow,
    ) -> ExchangeResult<WindowOutcome> {
        if !self.handle.source.supports_timeframe(timeframe) {
            return Err(ExchangeError::NotSupported(format!(
                "{} timeframe {}",
                self.exchange_id(),
                timeframe
            )));
        }

        let limiter = &self.handle.rate_limiter;
        let breaker = &self.handle.circuit_breaker;
        let source = &self.handle.source;
        let wait = Duration::from_millis(self.config.rate_limit_timeout_ms);

        let result = with_retry(&self.config.retry, "fetch_window", || async move {
            limiter.acquire_within(limiter.request_weight(), wait).await?;
            breaker
                .call(|| source.fetch_candles(symbol, timeframe, window.start, window.limit))
                .await
        })
        .await;

        match result {
            Ok(candles) => {
                let end_ms = window.end.timestamp_millis();
                let now_ms = Utc::now().timestamp_millis();
                let received = candles.len();
                let candles: Vec<RawCandle> = candles
                    .into_iter()
                    .filter(|c| c.timestamp_ms.map_or(true, |ts| ts <= end_ms))
                    .collect();
                let within = candles.len();
                // 아직 마감되지 않은 캔들은 저장하면 마감본이 중복으로 버려집니다.
                let candles: Vec<RawCandle> = candles
                    .into_iter()
                    .filter(|c| c.timestamp_ms.map_or(true, |ts| is_closed(ts, timeframe, now_ms)))
                    .collect();
                if candles.len() < within {
                    tracing::debug!(dropped = within - candles.len(), "미마감 캔들 제외");
                }
                tracing::debug!(
                    received,
                    kept = candles.len(),
                    start = %window.start,
                    end = %window.end,
                    "윈도우 조회 완료"
                );
                Ok(WindowOutcome::Fetched(candles))
            }
            Err(failure) if failure.error.is_circuit_open() => Err(failure.error),
            Err(failure) => {
                warn!(
                    start = %window.start,
                    end = %window.end,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "윈도우 조회 실패, FailedBatch로 기록"
                );
                Ok(WindowOutcome::Failed(FailedBatch {
                    window_start: window.start,
                    window_end: window.end,
                    error_message: failure.error.to_string(),
                    retry_count: failure.attempts,
                    last_attempt_at: Utc::now(),
                }))
            }
        }
    }

    /// `[start, end]` 전체를 조회합니다. 실패한 윈도우는 건너뛰고 기록만 남깁니다.
    pub async fn fetch_historical(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ExchangeResult<HistoricalFetch> {
        let mut fetch = HistoricalFetch::default();
        for window in self.plan(timeframe, start, end) {
            match self.fetch_window(symbol, timeframe, window).await? {
                WindowOutcome::Fetched(candles) => fetch.candles.extend(candles),
                WindowOutcome::Failed(failed) => fetch.failed_batches.push(failed),
            }
        }

        info!(
            exchange = %self.exchange_id(),
            symbol,
            %timeframe,
            candles = fetch.candles.len(),
            failed = fetch.failed_batches.len(),
            "과거 데이터 조회 완료"
        );
        Ok(fetch)
    }
}
