//! 거래소 커넥터.

pub mod binance;
pub mod coinbase;

pub use binance::{BinanceClient, BinanceConfig};
pub use coinbase::{CoinbaseClient, CoinbaseConfig};

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::ExchangeError;

const USER_AGENT: &str = concat!("market-ingest/", env!("CARGO_PKG_VERSION"));

/// 공통 HTTP 클라이언트 생성.
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, ExchangeError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| ExchangeError::NetworkError(format!("HTTP 클라이언트 생성 실패: {}", e)))
}

/// 문자열 또는 숫자 JSON 값을 Decimal로 변환. 해석할 수 없으면 `None`.
pub(crate) fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

/// 지수 표기까지 허용하는 Decimal 파싱.
pub(crate) fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}
