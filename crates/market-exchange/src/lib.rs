//! 거래소 연결 및 시장 데이터 수집.
//!
//! 이 크레이트는 다음을 제공합니다:
//! - CandleSource trait: 통합 캔들 조회 인터페이스
//! - Binance 커넥터 (REST + WebSocket), Coinbase 커넥터 (REST)
//! - Rate limiting: 거래소별 다중 윈도우 토큰 버킷
//! - Circuit breaker: 장애 허용을 위한 회로 차단기
//! - 재시도 정책과 과거 데이터 윈도우 조회
//! - 재연결하는 실시간 캔들 스트림

pub mod circuit_breaker;
pub mod connector;
pub mod error;
pub mod historical;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod traits;

pub use circuit_breaker::{
    CategoryThresholds, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
    ErrorCategory,
};
pub use connector::{BinanceClient, BinanceConfig, CoinbaseClient, CoinbaseConfig};
pub use error::*;
pub use historical::{
    is_closed, plan_windows, FailedBatch, FetchConfig, FetchWindow, HistoricalFetch, HistoricalFetcher,
    WindowOutcome,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateWindow, WindowKind, WindowStatus};
pub use registry::{ExchangeHandle, ExchangeRegistry};
pub use retry::{with_retry, with_retry_if, Backoff, RetryConfig, RetryError};
pub use stream::{LiveCandleStream, StreamConfig, StreamItem};
pub use traits::*;
