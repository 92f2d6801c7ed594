//! Binance 현물 커넥터.
//!
//! - REST `GET /api/v3/klines`로 과거 캔들 조회 (요청당 최대 1000개)
//! - WebSocket `<symbol>@kline_<interval>` 스트림으로 확정 캔들 수신
//!
//! 메인넷과 테스트넷을 모두 지원하며, 테스트를 위해 기본 URL을 바꿀 수 있습니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use market_core::{RawCandle, Timeframe};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use super::{decimal_from_value, http_client, parse_decimal};
use crate::traits::{CandleSource, RawMessageStream};
use crate::{ExchangeError, ExchangeResult};

/// Binance 요청당 최대 캔들 수.
pub const BINANCE_MAX_LIMIT: u32 = 1000;

// ============================================================================
// 설정
// ============================================================================

/// Binance 클라이언트 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// 테스트넷 사용
    #[serde(default)]
    pub testnet: bool,
    /// 요청 타임아웃 (초)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// REST 기본 URL 재정의
    #[serde(default)]
    pub rest_base_url: Option<String>,
    /// WebSocket 기본 URL 재정의
    #[serde(default)]
    pub ws_base_url: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            testnet: false,
            timeout_secs: default_timeout_secs(),
            rest_base_url: None,
            ws_base_url: None,
        }
    }
}

impl BinanceConfig {
    /// 테스트넷 사용.
    pub fn with_testnet(mut self, testnet: bool) -> Self {
        self.testnet = testnet;
        self
    }

    /// REST 기본 URL 재정의.
    pub fn with_rest_base_url(mut self, url: impl Into<String>) -> Self {
        self.rest_base_url = Some(url.into());
        self
    }

    /// REST API 기본 URL 반환.
    pub fn rest_base_url(&self) -> &str {
        match &self.rest_base_url {
            Some(url) => url,
            None if self.testnet => "https://testnet.binance.vision",
            None => "https://api.binance.com",
        }
    }

    /// WebSocket 기본 URL 반환.
    pub fn ws_base_url(&self) -> &str {
        match &self.ws_base_url {
            Some(url) => url,
            None if self.testnet => "wss://testnet.binance.vision/ws",
            None => "wss://stream.binance.com:9443/ws",
        }
    }
}

// ============================================================================
// API 응답 타입
// ============================================================================

#[derive(Debug, Deserialize)]
struct BinanceError {
    code: i32,
    msg: String,
}

/// kline 스트림 이벤트.
#[derive(Debug, Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: Option<i64>,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: Option<String>,
    #[serde(rename = "h")]
    high: Option<String>,
    #[serde(rename = "l")]
    low: Option<String>,
    #[serde(rename = "c")]
    close: Option<String>,
    #[serde(rename = "v")]
    volume: Option<String>,
    #[serde(rename = "x")]
    is_closed: bool,
}

// ============================================================================
// Binance 클라이언트
// ============================================================================

/// Binance 캔들 데이터 클라이언트.
pub struct BinanceClient {
    config: BinanceConfig,
    client: reqwest::Client,
}

impl BinanceClient {
    /// 새 Binance 클라이언트 생성.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성에 실패하면 `ExchangeError::NetworkError`를 반환합니다.
    pub fn new(config: BinanceConfig) -> ExchangeResult<Self> {
        let client = http_client(config.timeout_secs)?;
        Ok(Self { config, client })
    }

    /// 내부 심볼을 Binance 형식으로 변환 (`BTC/USDT` → `BTCUSDT`).
    pub fn to_wire_symbol(symbol: &str) -> String {
        symbol
            .chars()
            .filter(|c| *c != '/' && *c != '-')
            .collect::<String>()
            .to_uppercase()
    }

    async fn public_get(&self, endpoint: &str, params: &[(&str, String)]) -> ExchangeResult<Value> {
        let url = format!("{}{}", self.config.rest_base_url(), endpoint);
        debug!(url = %url, ?params, "GET");

        let response = self.client.get(&url).query(params).send().await?;
        self.handle_response(response).await
    }

    async fn handle_response(&self, response: reqwest::Response) -> ExchangeResult<Value> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&body).map_err(|e| {
                error!(error = %e, body = %body, "Binance 응답 파싱 실패");
                ExchangeError::ParseError(e.to_string())
            });
        }

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimited(format!("HTTP {}: {}", status, body)));
        }

        match serde_json::from_str::<BinanceError>(&body) {
            Ok(err) => Err(Self::map_error_code(err.code, &err.msg)),
            Err(_) if status.is_server_error() => Err(ExchangeError::ServerError {
                status: status.as_u16(),
                message: body,
            }),
            Err(_) => Err(ExchangeError::ApiError {
                code: status.as_u16() as i32,
                message: body,
            }),
        }
    }

    /// Binance 에러 코드를 ExchangeError로 매핑.
    fn map_error_code(code: i32, msg: &str) -> ExchangeError {
        match code {
            -1000 | -1008 => ExchangeError::ServerError {
                status: 500,
                message: msg.to_string(),
            },
            -1001 => ExchangeError::Disconnected(msg.to_string()),
            -1003 => ExchangeError::RateLimited(msg.to_string()),
            -1007 => ExchangeError::Timeout(msg.to_string()),
            -1121 => ExchangeError::SymbolNotFound(msg.to_string()),
            -1120 | -1104..=-1099 => ExchangeError::InvalidRequest(msg.to_string()),
            _ => ExchangeError::ApiError {
                code,
                message: msg.to_string(),
            },
        }
    }

    /// REST kline 배열 하나를 원시 캔들로 변환. 배열이 아니면 파싱 에러.
    fn kline_row(symbol: &str, timeframe: Timeframe, row: &Value) -> ExchangeResult<RawCandle> {
        let fields = row
            .as_array()
            .ok_or_else(|| ExchangeError::ParseError(format!("kline row is not an array: {}", row)))?;
        let field = |i: usize| fields.get(i).and_then(decimal_from_value);

        Ok(RawCandle {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            timeframe,
            timestamp_ms: fields.first().and_then(Value::as_i64),
            open: field(1),
            high: field(2),
            low: field(3),
            close: field(4),
            volume: field(5),
        })
    }
}

#[async_trait]
impl CandleSource for BinanceClient {
    fn exchange_id(&self) -> &str {
        "binance"
    }

    fn max_candles_per_request(&self) -> u32 {
        BINANCE_MAX_LIMIT
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: u32,
    ) -> ExchangeResult<Vec<RawCandle>> {
        let limit = limit.clamp(1, BINANCE_MAX_LIMIT);
        let body = self
            .public_get(
                "/api/v3/klines",
                &[
                    ("symbol", Self::to_wire_symbol(symbol)),
                    ("interval", timeframe.as_str().to_string()),
                    ("startTime", since.timestamp_millis().to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        let rows = body
            .as_array()
            .ok_or_else(|| ExchangeError::ParseError("klines response is not an array".into()))?;

        rows.iter()
            .map(|row| Self::kline_row(symbol, timeframe, row))
            .collect()
    }

    async fn connect_stream(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> ExchangeResult<RawMessageStream> {
        let url = format!(
            "{}/{}@kline_{}",
            self.config.ws_base_url(),
            Self::to_wire_symbol(symbol).to_lowercase(),
            timeframe.as_str()
        );
        debug!(url = %url, "WebSocket 연결 시도");

        let timeout = std::time::Duration::from_secs(self.config.timeout_secs);
        let (ws, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ExchangeError::Timeout(format!("WebSocket connect to {}", url)))??;

        let messages = ws.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Binary(bytes)) => Some(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|e| ExchangeError::ParseError(e.to_string())),
                ),
                Ok(Message::Close(frame)) => Some(Err(ExchangeError::Disconnected(format!(
                    "closed by server: {:?}",
                    frame
                )))),
                // ping/pong은 tungstenite가 처리
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });

        Ok(Box::pin(messages))
    }

    fn parse_stream_message(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        text: &str,
    ) -> ExchangeResult<Option<RawCandle>> {
        let value: Value = serde_json::from_str(text)?;

        // 구독 응답 ({"result": null, "id": 1})
        if value.get("e").is_none() && value.get("result").is_some() {
            return Ok(None);
        }

        let event: WsKlineEvent = serde_json::from_value(value)?;
        if event.event_type != "kline" {
            return Ok(None);
        }
        if event.symbol != Self::to_wire_symbol(symbol) {
            return Err(ExchangeError::ParseError(format!(
                "unexpected symbol {} on {} stream",
                event.symbol, symbol
            )));
        }
        if event.kline.interval != timeframe.as_str() {
            return Err(ExchangeError::ParseError(format!(
                "unexpected interval {} on {} stream",
                event.kline.interval, timeframe
            )));
        }
        if !event.kline.is_closed {
            return Ok(None);
        }

        let k = event.kline;
        let field = |v: &Option<String>| v.as_deref().and_then(parse_decimal);
        Ok(Some(RawCandle {
            exchange: "binance".to_string(),
            symbol: symbol.to_string(),
            timeframe,
            timestamp_ms: k.open_time,
            open: field(&k.open),
            high: field(&k.high),
            low: field(&k.low),
            close: field(&k.close),
            volume: field(&k.volume),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn client() -> BinanceClient {
        BinanceClient::new(BinanceConfig::default()).unwrap()
    }

    fn kline_message(closed: bool) -> String {
        format!(
            r#"{{"e":"kline","E":1704067260000,"s":"BTCUSDT","k":{{"t":1704067200000,"T":1704067259999,"s":"BTCUSDT","i":"1m","o":"42000.10","c":"42010.00","h":"42020.50","l":"41990.00","v":"12.5","n":100,"x":{},"q":"525000.0"}}}}"#,
            closed
        )
    }

    #[test]
    fn test_wire_symbol() {
        assert_eq!(BinanceClient::to_wire_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(BinanceClient::to_wire_symbol("eth-usdt"), "ETHUSDT");
    }

    #[test]
    fn test_parse_closed_kline() {
        let candle = client()
            .parse_stream_message("BTC/USDT", Timeframe::M1, &kline_message(true))
            .unwrap()
            .unwrap();

        assert_eq!(candle.timestamp_ms, Some(1_704_067_200_000));
        assert_eq!(candle.high, Some(dec!(42020.50)));
        assert_eq!(candle.symbol, "BTC/USDT");
    }

    #[test]
    fn test_open_kline_and_ack_are_skipped() {
        let c = client();
        assert!(c
            .parse_stream_message("BTC/USDT", Timeframe::M1, &kline_message(false))
            .unwrap()
            .is_none());
        assert!(c
            .parse_stream_message("BTC/USDT", Timeframe::M1, r#"{"result":null,"id":1}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        let c = client();
        assert!(c.parse_stream_message("BTC/USDT", Timeframe::M1, "not json").is_err());
        assert!(c
            .parse_stream_message("BTC/USDT", Timeframe::M1, r#"{"e":"kline","s":"BTCUSDT"}"#)
            .is_err());
        assert!(c
            .parse_stream_message("BTC/USDT", Timeframe::H1, &kline_message(true))
            .is_err());
    }

    #[test]
    fn test_unparseable_price_becomes_missing_field() {
        let text = kline_message(true).replace("\"42000.10\"", "\"n/a\"");
        let candle = client()
            .parse_stream_message("BTC/USDT", Timeframe::M1, &text)
            .unwrap()
            .unwrap();
        assert_eq!(candle.open, None);
    }

    #[test]
    fn test_error_code_mapping() {
        assert!(matches!(
            BinanceClient::map_error_code(-1003, "too many"),
            ExchangeError::RateLimited(_)
        ));
        assert!(matches!(
            BinanceClient::map_error_code(-1121, "Invalid symbol."),
            ExchangeError::SymbolNotFound(_)
        ));
        assert!(matches!(
            BinanceClient::map_error_code(-9999, "?"),
            ExchangeError::ApiError { code: -9999, .. }
        ));
    }
}
