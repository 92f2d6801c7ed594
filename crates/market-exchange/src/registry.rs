//! 거래소별 공유 자원 레지스트리.
//!
//! 거래소 하나당 커넥터, RateLimiter, CircuitBreaker가 한 벌씩 존재하며
//! REST 백필과 스트리밍이 같은 인스턴스를 공유합니다. 전역 상태 없이
//! 조립 지점(collector)에서 한 번 만들어 명시적으로 넘깁니다.

use std::collections::BTreeMap;
use std::sync::Arc;

use market_core::ErrorSource;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::rate_limiter::{RateLimitConfig, RateLimiter};
use crate::traits::CandleSource;
use crate::{ExchangeError, ExchangeResult};

/// 거래소 하나의 커넥터와 보호 장치 묶음.
#[derive(Clone)]
pub struct ExchangeHandle {
    pub source: Arc<dyn CandleSource>,
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breaker: Arc<CircuitBreaker>,
}

impl ExchangeHandle {
    /// 커넥터와 설정으로 핸들을 만듭니다.
    pub fn new(
        source: Arc<dyn CandleSource>,
        rate_limit: RateLimitConfig,
        circuit_breaker: CircuitBreakerConfig,
    ) -> Self {
        let id = source.exchange_id().to_string();
        Self {
            rate_limiter: Arc::new(RateLimiter::new(id.clone(), rate_limit)),
            circuit_breaker: Arc::new(CircuitBreaker::new(id, circuit_breaker)),
            source,
        }
    }

    /// 거래소 ID.
    pub fn exchange_id(&self) -> &str {
        self.source.exchange_id()
    }
}

/// 거래소 ID → 핸들.
#[derive(Clone, Default)]
pub struct ExchangeRegistry {
    handles: BTreeMap<String, ExchangeHandle>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 핸들 등록. 같은 ID가 있으면 교체합니다.
    pub fn register(&mut self, handle: ExchangeHandle) {
        tracing::debug!(exchange = handle.exchange_id(), "거래소 등록");
        self.handles.insert(handle.exchange_id().to_string(), handle);
    }

    /// 거래소 핸들 조회.
    pub fn get(&self, exchange: &str) -> ExchangeResult<&ExchangeHandle> {
        self.handles
            .get(exchange)
            .ok_or_else(|| ExchangeError::NotSupported(format!("unknown exchange: {}", exchange)))
    }

    /// 등록된 거래소 ID 목록.
    pub fn exchange_ids(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    /// 헬스 모니터가 읽을 에러 카운터 목록.
    pub fn error_sources(&self) -> Vec<Arc<dyn ErrorSource>> {
        self.handles
            .values()
            .flat_map(|h| {
                [
                    h.rate_limiter.clone() as Arc<dyn ErrorSource>,
                    h.circuit_breaker.clone() as Arc<dyn ErrorSource>,
                ]
            })
            .collect()
    }
}
