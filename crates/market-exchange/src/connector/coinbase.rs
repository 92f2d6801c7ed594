//! Coinbase Exchange 커넥터.
//!
//! 공개 REST `GET /products/{id}/candles`만 사용합니다. 캔들 스트림은 제공하지 않습니다.
//! 응답 행 형식은 `[time(초), low, high, open, close, volume]`이며 최신순으로 옵니다.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use market_core::{RawCandle, Timeframe};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{decimal_from_value, http_client};
use crate::traits::CandleSource;
use crate::{ExchangeError, ExchangeResult};

/// Coinbase 요청당 최대 캔들 수.
pub const COINBASE_MAX_LIMIT: u32 = 300;

/// Coinbase 클라이언트 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinbaseConfig {
    /// 요청 타임아웃 (초)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// REST 기본 URL
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_rest_base_url() -> String {
    "https://api.exchange.coinbase.com".to_string()
}

impl Default for CoinbaseConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            rest_base_url: default_rest_base_url(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseError {
    message: String,
}

/// Coinbase 캔들 데이터 클라이언트.
pub struct CoinbaseClient {
    config: CoinbaseConfig,
    client: reqwest::Client,
}

impl CoinbaseClient {
    /// 새 Coinbase 클라이언트 생성.
    pub fn new(config: CoinbaseConfig) -> ExchangeResult<Self> {
        let client = http_client(config.timeout_secs)?;
        Ok(Self { config, client })
    }

    /// 내부 심볼을 Coinbase 상품 ID로 변환 (`BTC/USD` → `BTC-USD`).
    pub fn to_product_id(symbol: &str) -> String {
        symbol.replace('/', "-").to_uppercase()
    }

    /// 타임프레임을 granularity(초)로 변환.
    pub fn granularity(timeframe: Timeframe) -> Option<u32> {
        match timeframe {
            Timeframe::M1 => Some(60),
            Timeframe::M5 => Some(300),
            Timeframe::M15 => Some(900),
            Timeframe::H1 => Some(3_600),
            Timeframe::H6 => Some(21_600),
            Timeframe::D1 => Some(86_400),
            _ => None,
        }
    }

    fn map_status(status: reqwest::StatusCode, body: String) -> ExchangeError {
        let message = serde_json::from_str::<CoinbaseError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);

        match status.as_u16() {
            429 => ExchangeError::RateLimited(message),
            404 => ExchangeError::SymbolNotFound(message),
            400 => ExchangeError::InvalidRequest(message),
            s if status.is_server_error() => ExchangeError::ServerError { status: s, message },
            s => ExchangeError::ApiError {
                code: s as i32,
                message,
            },
        }
    }

    fn candle_row(symbol: &str, timeframe: Timeframe, row: &Value) -> ExchangeResult<RawCandle> {
        let fields = row
            .as_array()
            .ok_or_else(|| ExchangeError::ParseError(format!("candle row is not an array: {}", row)))?;
        let field = |i: usize| fields.get(i).and_then(decimal_from_value);

        Ok(RawCandle {
            exchange: "coinbase".to_string(),
            symbol: symbol.to_string(),
            timeframe,
            timestamp_ms: fields
                .first()
                .and_then(Value::as_i64)
                .and_then(|secs| secs.checked_mul(1000)),
            low: field(1),
            high: field(2),
            open: field(3),
            close: field(4),
            volume: field(5),
        })
    }
}

#[async_trait]
impl CandleSource for CoinbaseClient {
    fn exchange_id(&self) -> &str {
        "coinbase"
    }

    fn max_candles_per_request(&self) -> u32 {
        COINBASE_MAX_LIMIT
    }

    fn supports_timeframe(&self, timeframe: Timeframe) -> bool {
        Self::granularity(timeframe).is_some()
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: u32,
    ) -> ExchangeResult<Vec<RawCandle>> {
        let granularity = Self::granularity(timeframe).ok_or_else(|| {
            ExchangeError::NotSupported(format!("coinbase timeframe {}", timeframe))
        })?;
        let limit = limit.clamp(1, COINBASE_MAX_LIMIT);
        let end = since + chrono::Duration::seconds(granularity as i64 * (limit as i64 - 1));

        let url = format!(
            "{}/products/{}/candles",
            self.config.rest_base_url,
            Self::to_product_id(symbol)
        );
        debug!(url = %url, %since, %end, "GET");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("granularity", granularity.to_string()),
                ("start", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
                ("end", end.to_rfc3339_opts(SecondsFormat::Secs, true)),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::map_status(status, body));
        }

        let value: Value = serde_json::from_str(&body)?;
        let rows = value
            .as_array()
            .ok_or_else(|| ExchangeError::ParseError("candles response is not an array".into()))?;

        let mut candles = rows
            .iter()
            .map(|row| Self::candle_row(symbol, timeframe, row))
            .collect::<ExchangeResult<Vec<_>>>()?;
        // 최신순 응답을 시간순으로
        candles.sort_by_key(|c| c.timestamp_ms);
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_product_id_and_granularity() {
        assert_eq!(CoinbaseClient::to_product_id("btc/usd"), "BTC-USD");
        assert_eq!(CoinbaseClient::granularity(Timeframe::H1), Some(3600));
        assert_eq!(CoinbaseClient::granularity(Timeframe::H4), None);
    }

    #[test]
    fn test_candle_row_column_order() {
        let row = json!([1704067200, 41990.0, 42020.5, 42000.1, 42010.0, 12.5]);
        let candle = CoinbaseClient::candle_row("BTC/USD", Timeframe::H1, &row).unwrap();

        assert_eq!(candle.timestamp_ms, Some(1_704_067_200_000));
        assert_eq!(candle.low, Some(dec!(41990)));
        assert_eq!(candle.high, Some(dec!(42020.5)));
        assert_eq!(candle.open, Some(dec!(42000.1)));
    }

    #[test]
    fn test_streaming_not_supported() {
        let client = CoinbaseClient::new(CoinbaseConfig::default()).unwrap();
        let result = client.parse_stream_message("BTC/USD", Timeframe::M1, "{}");
        assert!(matches!(result, Err(ExchangeError::NotSupported(_))));
    }
}
