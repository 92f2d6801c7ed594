//! 거래소 에러 타입.

use std::time::Duration;

use thiserror::Error;

/// 거래소 관련 에러.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    NetworkError(String),

    /// 거래소 연결 끊김
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// 거래소가 요청 한도 초과를 응답함 (HTTP 429/418, -1003 등)
    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    /// 로컬 RateLimiter에서 마감 시간 안에 토큰을 얻지 못함
    #[error("Rate limit timeout for {exchange} after {waited:?}")]
    RateLimitTimeout { exchange: String, waited: Duration },

    /// Circuit Breaker가 열려 있어 호출하지 않음
    #[error("Circuit '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    /// 거래소 서버 에러 (5xx)
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// API 에러 코드
    #[error("API error {code}: {message}")]
    ApiError { code: i32, message: String },

    /// 파싱/역직렬화 에러
    #[error("Parse error: {0}")]
    ParseError(String),

    /// 심볼을 찾을 수 없음
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    /// 잘못된 요청 인자
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// WebSocket 에러
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// 타임아웃
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// 지원되지 않는 작업
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// 알 수 없는 에러
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ExchangeError {
    /// 재시도 가능한 에러인지 확인.
    ///
    /// `CircuitOpen`은 즉시 호출자에게 전달해야 하므로 재시도 대상이 아닙니다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::NetworkError(_)
                | ExchangeError::Disconnected(_)
                | ExchangeError::RateLimited(_)
                | ExchangeError::RateLimitTimeout { .. }
                | ExchangeError::ServerError { .. }
                | ExchangeError::Timeout(_)
                | ExchangeError::WebSocket(_)
        )
    }

    /// 권장 재시도 대기 시간(밀리초) 반환.
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            ExchangeError::RateLimited(_) => Some(60_000),
            ExchangeError::RateLimitTimeout { .. } => Some(1_000),
            ExchangeError::NetworkError(_) => Some(1_000),
            ExchangeError::ServerError { .. } => Some(2_000),
            ExchangeError::Disconnected(_) => Some(5_000),
            ExchangeError::Timeout(_) => Some(500),
            ExchangeError::WebSocket(_) => Some(2_000),
            ExchangeError::CircuitOpen { retry_after, .. } => {
                Some(retry_after.as_millis() as u64)
            }
            _ => None,
        }
    }

    /// Circuit Breaker 거부인지 확인.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ExchangeError::CircuitOpen { .. })
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            ExchangeError::NetworkError(err.to_string())
        } else if err.is_decode() {
            ExchangeError::ParseError(err.to_string())
        } else {
            ExchangeError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::ParseError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                ExchangeError::Disconnected(err.to_string())
            }
            WsError::Io(e) => ExchangeError::NetworkError(e.to_string()),
            other => ExchangeError::WebSocket(other.to_string()),
        }
    }
}

/// 거래소 결과 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;
