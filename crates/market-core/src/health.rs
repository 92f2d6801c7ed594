//! 컴포넌트 에러 카운터 인터페이스.
//!
//! RateLimiter, CircuitBreaker, StorageManager가 구현하며 HealthMonitor가 읽습니다.
//! 구현 크레이트에 직접 의존하지 않고 카운터만 관찰하기 위한 경계입니다.

/// 에러 카운터를 노출하는 컴포넌트.
pub trait ErrorSource: Send + Sync {
    /// 컴포넌트 이름 (예: "rate_limiter:binance").
    fn component(&self) -> String;

    /// 누적 에러 수.
    fn error_count(&self) -> u64;
}
