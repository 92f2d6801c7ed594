//! 캔들 데이터 구조체.
//!
//! - `RawCandle` - 거래소 응답에서 꺼낸 그대로의 행. 필드 누락을 허용합니다.
//! - `OhlcvRecord` - 검증을 통과해 저장소에 들어갈 수 있는 행.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{SeriesKey, Timeframe};

/// 거래소에서 받은 검증 전 캔들.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCandle {
    /// 거래소 ID
    pub exchange: String,
    /// 정규화된 심볼
    pub symbol: String,
    /// 타임프레임
    pub timeframe: Timeframe,
    /// 캔들 시작 시간 (Unix 밀리초)
    pub timestamp_ms: Option<i64>,
    /// 시가
    pub open: Option<Decimal>,
    /// 고가
    pub high: Option<Decimal>,
    /// 저가
    pub low: Option<Decimal>,
    /// 종가
    pub close: Option<Decimal>,
    /// 거래량
    pub volume: Option<Decimal>,
}

impl RawCandle {
    /// 모든 필드가 채워진 원시 캔들을 생성합니다.
    pub fn complete(
        key: &SeriesKey,
        timestamp_ms: i64,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            timestamp_ms: Some(timestamp_ms),
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close: Some(close),
            volume: Some(volume),
        }
    }

    /// 이 캔들의 시계열 키.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.timeframe)
    }
}

/// 검증된 OHLCV 레코드.
///
/// 자연키는 (exchange, symbol, timeframe, timestamp)입니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OhlcvRecord {
    /// 거래소 ID
    pub exchange: String,
    /// 정규화된 심볼
    pub symbol: String,
    /// 타임프레임
    pub timeframe: Timeframe,
    /// 캔들 시작 시간 (UTC)
    pub timestamp: DateTime<Utc>,
    /// 시가
    pub open: Decimal,
    /// 고가
    pub high: Decimal,
    /// 저가
    pub low: Decimal,
    /// 종가
    pub close: Decimal,
    /// 거래량
    pub volume: Decimal,
}

impl OhlcvRecord {
    /// 이 레코드의 시계열 키.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.timeframe)
    }

    /// 타임스탬프(Unix 밀리초).
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// 자연키가 같은지 비교합니다.
    pub fn same_natural_key(&self, other: &OhlcvRecord) -> bool {
        self.timestamp == other.timestamp
            && self.timeframe == other.timeframe
            && self.symbol == other.symbol
            && self.exchange == other.exchange
    }

    /// 검증 전 형태로 되돌립니다. 데드레터 재처리 경로에서 사용합니다.
    pub fn to_raw(&self) -> RawCandle {
        RawCandle {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            timestamp_ms: Some(self.timestamp_ms()),
            open: Some(self.open),
            high: Some(self.high),
            low: Some(self.low),
            close: Some(self.close),
            volume: Some(self.volume),
        }
    }
}

/// Unix 밀리초를 UTC 시각으로 변환합니다. 표현 불가능한 값이면 `None`.
pub fn utc_from_millis(timestamp_ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(timestamp_ms).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_raw_candle_keeps_series_labels() {
        let key = SeriesKey::new("binance", "ETH/USDT", Timeframe::M5);
        let raw = RawCandle::complete(&key, 300_000, dec!(1), dec!(2), dec!(0.5), dec!(1.5), dec!(10));
        assert_eq!(raw.series_key(), key);
        assert_eq!(raw.high, Some(dec!(2)));
    }

    #[test]
    fn test_utc_from_millis_rejects_out_of_range() {
        assert!(utc_from_millis(0).is_some());
        assert!(utc_from_millis(i64::MAX).is_none());
    }
}
