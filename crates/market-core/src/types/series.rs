//! 시계열 식별 키.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Timeframe;

/// (거래소, 심볼, 타임프레임) 시계열 키.
///
/// 체크포인트, 품질 메타데이터, 아카이브 파티션이 모두 이 키 단위로 관리됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// 거래소 ID (예: "binance")
    pub exchange: String,
    /// 정규화된 심볼 (예: "BTC/USDT")
    pub symbol: String,
    /// 타임프레임
    pub timeframe: Timeframe,
}

impl SeriesKey {
    /// 새 시계열 키를 생성합니다.
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }

    /// 파일 경로에 안전한 심볼 표기 (`BTC/USDT` → `BTC-USDT`).
    pub fn symbol_segment(&self) -> String {
        self.symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }

    /// 파일명 stem (`binance_BTC-USDT_1h`).
    pub fn file_stem(&self) -> String {
        format!("{}_{}_{}", self.exchange, self.symbol_segment(), self.timeframe)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key_naming() {
        let key = SeriesKey::new("binance", "BTC/USDT", Timeframe::H1);
        assert_eq!(key.to_string(), "binance:BTC/USDT:1h");
        assert_eq!(key.file_stem(), "binance_BTC-USDT_1h");
    }
}
