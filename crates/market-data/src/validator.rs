//! OHLCV 구조 검증기.
//!
//! 배치를 깨끗한 행과 거부된 행으로 나눕니다. 입력을 변경하지 않고
//! 저장소나 네트워크에 접근하지 않으므로 REST 경로, 스트리밍 경로,
//! 데드레터 재처리 경로가 모두 같은 규칙을 적용받습니다.
//!
//! 규칙:
//! - 필수 필드 존재 (거래소, 심볼, 타임스탬프, OHLCV)
//! - 타임스탬프가 표현 가능한 시각이며 타임프레임 경계에 정렬됨
//! - high ≥ max(open, close, low), low ≤ min(open, close, high)
//! - volume ≥ 0
//!
//! 부등식은 모두 비엄격이라 high == low인 캔들(거래 없는 구간)도 유효합니다.

use std::fmt;

use market_core::{utc_from_millis, OhlcvRecord, RawCandle, Timeframe};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// 거부 사유.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// 필수 필드 누락
    MissingField(String),
    /// 표현할 수 없는 타임스탬프
    InvalidTimestamp(i64),
    /// 타임프레임 경계에 맞지 않는 타임스탬프
    Misaligned { timestamp_ms: i64, timeframe: Timeframe },
    /// high < low
    HighBelowLow,
    /// high < max(open, close)
    HighBelowBody,
    /// low > min(open, close)
    LowAboveBody,
    /// volume < 0
    NegativeVolume,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::MissingField(name) => write!(f, "missing field: {}", name),
            RejectReason::InvalidTimestamp(ts) => write!(f, "invalid timestamp: {}", ts),
            RejectReason::Misaligned {
                timestamp_ms,
                timeframe,
            } => write!(f, "timestamp {} not aligned to {}", timestamp_ms, timeframe),
            RejectReason::HighBelowLow => f.write_str("high < low"),
            RejectReason::HighBelowBody => f.write_str("high < max(open, close)"),
            RejectReason::LowAboveBody => f.write_str("low > min(open, close)"),
            RejectReason::NegativeVolume => f.write_str("volume < 0"),
        }
    }
}

/// 거부된 행과 사유.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub row: RawCandle,
    pub reason: RejectReason,
}

/// 배치 검증 결과.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    /// 저장 가능한 행 (입력 순서 유지)
    pub clean: Vec<OhlcvRecord>,
    /// 거부된 행
    pub rejected: Vec<RejectedRow>,
}

impl ValidationOutcome {
    /// 거부된 행이 없는지 확인.
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// 상태 없는 OHLCV 검증기.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    check_alignment: bool,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            check_alignment: true,
        }
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 타임프레임 경계 정렬 검사 여부 설정.
    pub fn with_alignment_check(mut self, enabled: bool) -> Self {
        self.check_alignment = enabled;
        self
    }

    /// 배치를 깨끗한 행과 거부된 행으로 나눕니다.
    pub fn validate(&self, batch: &[RawCandle]) -> ValidationOutcome {
        let mut outcome = ValidationOutcome {
            clean: Vec::with_capacity(batch.len()),
            rejected: Vec::new(),
        };

        for row in batch {
            match self.validate_row(row) {
                Ok(record) => outcome.clean.push(record),
                Err(reason) => {
                    debug!(
                        exchange = %row.exchange,
                        symbol = %row.symbol,
                        timestamp_ms = ?row.timestamp_ms,
                        reason = %reason,
                        "행 거부"
                    );
                    outcome.rejected.push(RejectedRow {
                        row: row.clone(),
                        reason,
                    });
                }
            }
        }

        outcome
    }

    /// 한 행을 검증합니다.
    pub fn validate_row(&self, row: &RawCandle) -> Result<OhlcvRecord, RejectReason> {
        if row.exchange.is_empty() {
            return Err(RejectReason::MissingField("exchange".into()));
        }
        if row.symbol.is_empty() {
            return Err(RejectReason::MissingField("symbol".into()));
        }

        let timestamp_ms = required(row.timestamp_ms, "timestamp")?;
        let open = required(row.open, "open")?;
        let high = required(row.high, "high")?;
        let low = required(row.low, "low")?;
        let close = required(row.close, "close")?;
        let volume = required(row.volume, "volume")?;

        let timestamp =
            utc_from_millis(timestamp_ms).ok_or(RejectReason::InvalidTimestamp(timestamp_ms))?;
        if self.check_alignment && !row.timeframe.is_aligned(timestamp_ms) {
            return Err(RejectReason::Misaligned {
                timestamp_ms,
                timeframe: row.timeframe,
            });
        }

        check_ohlc(open, high, low, close)?;
        if volume < Decimal::ZERO {
            return Err(RejectReason::NegativeVolume);
        }

        Ok(OhlcvRecord {
            exchange: row.exchange.clone(),
            symbol: row.symbol.clone(),
            timeframe: row.timeframe,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        })
    }
}

fn required<T: Copy>(value: Option<T>, name: &str) -> Result<T, RejectReason> {
    value.ok_or_else(|| RejectReason::MissingField(name.to_string()))
}

fn check_ohlc(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Result<(), RejectReason> {
    if high < low {
        return Err(RejectReason::HighBelowLow);
    }
    if high < open.max(close) {
        return Err(RejectReason::HighBelowBody);
    }
    if low > open.min(close) {
        return Err(RejectReason::LowAboveBody);
    }
    Ok(())
}
