//! 거래소별 Circuit Breaker.
//!
//! 장애가 난 거래소로의 호출을 빠르게 차단해 REST/스트리밍 경로 전체를 보호합니다.
//!
//! # 상태 전이
//!
//! ```text
//! Closed ──[연속 실패 임계치]──> Open
//!    ↑                            │
//!    │                   [reset_timeout 경과]
//!    │                            ↓
//!    └─[success_threshold 연속 성공]── HalfOpen ──[실패]──> Open
//! ```
//!
//! HalfOpen에서는 동시에 하나의 프로브 호출만 통과합니다.
//! 상태는 `call`을 통과한 호출의 결과로만 바뀝니다.
//!
//! # 에러 카테고리
//!
//! 재시도 가능한 에러만 실패로 집계합니다. 카테고리별 임계치를 주면
//! 전체 연속 실패 수와 별도로 해당 카테고리 연속 실패 수로도 Open 됩니다.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use market_core::ErrorSource;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ExchangeError;

/// 에러 카테고리.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 네트워크/연결 오류
    Network,
    /// 거래소 요청 한도 초과
    RateLimit,
    /// 요청 타임아웃
    Timeout,
    /// 5xx 등 서버 측 오류
    Service,
}

impl ErrorCategory {
    /// ExchangeError에서 카테고리 추출. 재시도 불가능한 에러는 `None`.
    pub fn from_error(error: &ExchangeError) -> Option<Self> {
        match error {
            ExchangeError::NetworkError(_)
            | ExchangeError::Disconnected(_)
            | ExchangeError::WebSocket(_) => Some(ErrorCategory::Network),
            ExchangeError::RateLimited(_) => Some(ErrorCategory::RateLimit),
            ExchangeError::Timeout(_) => Some(ErrorCategory::Timeout),
            ExchangeError::ServerError { .. } => Some(ErrorCategory::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Network => "network",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Service => "service",
        };
        f.write_str(name)
    }
}

/// 카테고리별 연속 실패 임계치.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryThresholds {
    pub network: Option<u32>,
    pub rate_limit: Option<u32>,
    pub timeout: Option<u32>,
    pub service: Option<u32>,
}

impl CategoryThresholds {
    fn get(&self, category: ErrorCategory) -> Option<u32> {
        match category {
            ErrorCategory::Network => self.network,
            ErrorCategory::RateLimit => self.rate_limit,
            ErrorCategory::Timeout => self.timeout,
            ErrorCategory::Service => self.service,
        }
    }
}

/// Circuit Breaker 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// 정상 - 모든 호출 통과
    Closed,
    /// 장애 - 모든 호출 즉시 거부
    Open,
    /// 복구 확인 - 프로브 하나만 통과
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit Breaker 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Open으로 전이하는 연속 실패 수
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Open 유지 시간(밀리초). 경과 후 HalfOpen
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// HalfOpen에서 Closed로 돌아가기 위한 연속 성공 수
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// 카테고리별 임계치
    #[serde(default)]
    pub category_thresholds: CategoryThresholds,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
            category_thresholds: CategoryThresholds::default(),
        }
    }
}

impl CircuitBreakerConfig {
    /// 새 설정 생성.
    pub fn new(failure_threshold: u32, reset_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            failure_threshold,
            reset_timeout_ms: reset_timeout.as_millis() as u64,
            success_threshold,
            category_thresholds: CategoryThresholds::default(),
        }
    }

    /// 카테고리별 임계치 설정.
    pub fn with_category_thresholds(mut self, thresholds: CategoryThresholds) -> Self {
        self.category_thresholds = thresholds;
        self
    }

    /// Open 유지 시간.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    probe_in_flight: bool,
    last_state_change: Instant,
    category_failures: HashMap<ErrorCategory, u32>,
    tripped_by: Option<ErrorCategory>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            probe_in_flight: false,
            last_state_change: Instant::now(),
            category_failures: HashMap::new(),
            tripped_by: None,
        }
    }
}

/// 호출 결과 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure(ErrorCategory),
    /// 재시도 불가능한 에러. 거래소는 응답했으므로 상태를 바꾸지 않습니다.
    Neutral,
}

/// 거래소 하나에 대한 Circuit Breaker.
///
/// ```ignore
/// let breaker = CircuitBreaker::new("binance", CircuitBreakerConfig::default());
/// let klines = breaker.call(|| client.fetch_candles(..)).await?;
/// ```
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
    open_count: AtomicU64,
}

impl CircuitBreaker {
    /// 새 Circuit Breaker 생성.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            total_calls: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
        }
    }

    /// 기본 설정으로 생성.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// 이름 반환.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 현재 상태 반환. reset_timeout이 지난 Open은 HalfOpen으로 보고합니다.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    /// `f`를 Circuit Breaker를 통해 실행합니다.
    ///
    /// Open 상태이거나 HalfOpen 프로브가 이미 진행 중이면 `f`를 호출하지 않고
    /// `ExchangeError::CircuitOpen`을 반환합니다.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, ExchangeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut permit = self.acquire()?;
        let result = f().await;
        permit.complete(classify(&result));
        result
    }

    /// 호출 허가를 얻습니다. 허가가 완료되지 않고 drop되면 프로브 슬롯만 반납합니다.
    pub(crate) fn acquire(&self) -> Result<CallPermit<'_>, ExchangeError> {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);

        let probe = match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = state.last_state_change.elapsed();
                let retry_after = self.config.reset_timeout().saturating_sub(elapsed);
                return Err(self.reject(retry_after));
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    return Err(self.reject(Duration::ZERO));
                }
                state.probe_in_flight = true;
                true
            }
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        Ok(CallPermit {
            breaker: self,
            probe,
            completed: false,
        })
    }

    fn reject(&self, retry_after: Duration) -> ExchangeError {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(circuit_breaker = %self.name, ?retry_after, "Circuit open, call rejected");
        ExchangeError::CircuitOpen {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn record(&self, outcome: Outcome, probe: bool) {
        let mut state = self.lock();
        if probe {
            state.probe_in_flight = false;
        }

        match outcome {
            Outcome::Neutral => {}
            Outcome::Success => {
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                match state.state {
                    CircuitState::Closed => {
                        state.consecutive_failures = 0;
                        state.category_failures.clear();
                    }
                    CircuitState::HalfOpen => {
                        state.half_open_successes += 1;
                        if state.half_open_successes >= self.config.success_threshold {
                            self.transition_to(&mut state, CircuitState::Closed);
                            tracing::info!(
                                circuit_breaker = %self.name,
                                "Circuit breaker recovered: HalfOpen -> Closed"
                            );
                        }
                    }
                    CircuitState::Open => {}
                }
            }
            Outcome::Failure(category) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                match state.state {
                    CircuitState::Closed => {
                        state.consecutive_failures += 1;
                        let cat_count = {
                            let count = state.category_failures.entry(category).or_insert(0);
                            *count += 1;
                            *count
                        };
                        let category_tripped = self
                            .config
                            .category_thresholds
                            .get(category)
                            .is_some_and(|threshold| cat_count >= threshold);

                        if category_tripped
                            || state.consecutive_failures >= self.config.failure_threshold
                        {
                            state.tripped_by = Some(category);
                            self.transition_to(&mut state, CircuitState::Open);
                            tracing::warn!(
                                circuit_breaker = %self.name,
                                failures = state.consecutive_failures,
                                tripped_by = %category,
                                "Circuit breaker tripped: Closed -> Open"
                            );
                        }
                    }
                    CircuitState::HalfOpen => {
                        state.tripped_by = Some(category);
                        self.transition_to(&mut state, CircuitState::Open);
                        tracing::warn!(
                            circuit_breaker = %self.name,
                            category = %category,
                            "Circuit breaker probe failed: HalfOpen -> Open"
                        );
                    }
                    CircuitState::Open => {}
                }
            }
        }
    }

    /// 스트리밍 연결처럼 `call` 밖에서 이어지는 작업의 실패를 기록합니다.
    pub(crate) fn record_error(&self, error: &ExchangeError) {
        if let Some(category) = ErrorCategory::from_error(error) {
            self.record(Outcome::Failure(category), false);
        }
    }

    /// 메트릭 반환.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            open_count: self.open_count.load(Ordering::Relaxed),
            time_in_current_state: state.last_state_change.elapsed(),
            tripped_by: state.tripped_by,
        }
    }

    fn maybe_half_open(&self, state: &mut BreakerState) {
        if state.state == CircuitState::Open
            && state.last_state_change.elapsed() >= self.config.reset_timeout()
        {
            self.transition_to(state, CircuitState::HalfOpen);
            tracing::info!(circuit_breaker = %self.name, "Circuit breaker timeout: Open -> HalfOpen");
        }
    }

    fn transition_to(&self, state: &mut BreakerState, new_state: CircuitState) {
        state.state = new_state;
        state.last_state_change = Instant::now();
        state.half_open_successes = 0;
        state.probe_in_flight = false;

        match new_state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
                state.category_failures.clear();
                state.tripped_by = None;
            }
            CircuitState::Open => {
                self.open_count.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ErrorSource for CircuitBreaker {
    fn component(&self) -> String {
        format!("circuit_breaker:{}", self.name)
    }

    fn error_count(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed) + self.total_rejections.load(Ordering::Relaxed)
    }
}

fn classify<T>(result: &Result<T, ExchangeError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Success,
        Err(e) => ErrorCategory::from_error(e)
            .map(Outcome::Failure)
            .unwrap_or(Outcome::Neutral),
    }
}

/// `CircuitBreaker::acquire`가 내준 호출 허가.
pub(crate) struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    completed: bool,
}

impl CallPermit<'_> {
    fn complete(&mut self, outcome: Outcome) {
        self.completed = true;
        self.breaker.record(outcome, self.probe);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.completed && self.probe {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

/// Circuit Breaker 메트릭.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub open_count: u64,
    #[serde(skip)]
    pub time_in_current_state: Duration,
    pub tripped_by: Option<ErrorCategory>,
}

impl CircuitBreakerMetrics {
    /// 실패율 (0.0 ~ 1.0).
    pub fn failure_rate(&self) -> f64 {
        let finished = self.total_successes + self.total_failures;
        if finished == 0 {
            0.0
        } else {
            self.total_failures as f64 / finished as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn config(failures: u32, reset_secs: u64, successes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(failures, Duration::from_secs(reset_secs), successes)
    }

    async fn fail(cb: &CircuitBreaker) -> Result<(), ExchangeError> {
        cb.call(|| async { Err(ExchangeError::NetworkError("reset".into())) })
            .await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), ExchangeError> {
        cb.call(|| async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures_without_invoking() {
        let cb = CircuitBreaker::new("binance", config(3, 30, 1));

        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let counter = &invoked;
        let result = cb
            .call(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ExchangeError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cb.metrics().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let cb = CircuitBreaker::new("binance", config(3, 30, 1));

        fail(&cb).await.ok();
        fail(&cb).await.ok();
        succeed(&cb).await.unwrap();
        fail(&cb).await.ok();
        fail(&cb).await.ok();

        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_probe() {
        let cb = Arc::new(CircuitBreaker::new("binance", config(1, 10, 1)));
        fail(&cb).await.ok();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // 첫 프로브가 진행 중인 동안 두 번째 호출은 거부되어야 함
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let probe_cb = cb.clone();
        let probe = tokio::spawn(async move {
            probe_cb
                .call(|| async move {
                    release_rx.await.ok();
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;

        let second = succeed(&cb).await;
        assert!(matches!(second, Err(ExchangeError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_threshold_in_half_open() {
        let cb = CircuitBreaker::new("binance", config(1, 5, 3));
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_secs(6)).await;

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("binance", config(1, 5, 2));
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_secs(6)).await;

        succeed(&cb).await.unwrap();
        fail(&cb).await.ok();

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().open_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_neutral() {
        let cb = CircuitBreaker::new("binance", config(1, 5, 1));
        let result: Result<(), _> = cb
            .call(|| async { Err(ExchangeError::ParseError("bad json".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_releases_slot() {
        let cb = CircuitBreaker::new("binance", config(1, 5, 1));
        fail(&cb).await.ok();
        tokio::time::advance(Duration::from_secs(6)).await;

        let permit = cb.acquire().unwrap();
        drop(permit);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_category_threshold_trips_early() {
        let cfg = config(10, 30, 1).with_category_thresholds(CategoryThresholds {
            timeout: Some(2),
            ..Default::default()
        });
        let cb = CircuitBreaker::new("coinbase", cfg);

        for _ in 0..2 {
            let _: Result<(), _> = cb
                .call(|| async { Err(ExchangeError::Timeout("30s".into())) })
                .await;
        }

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.tripped_by, Some(ErrorCategory::Timeout));
        assert!((metrics.failure_rate() - 1.0).abs() < f64::EPSILON);
    }
}
