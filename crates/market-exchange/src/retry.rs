//! 재시도 정책.
//!
//! REST 윈도우 조회, 스트림 재연결, 버퍼 flush가 모두 같은 정책 타입을 씁니다.
//! 호출 지점마다 값만 다르게 줍니다.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ExchangeError;

/// 지수 백오프 재시도 설정.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 최대 시도 횟수 (첫 시도 포함)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 첫 재시도 대기 시간 (밀리초)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// 재시도마다 곱하는 배수
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 대기 시간 상한 (밀리초)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// 지터 비율. 대기 시간에 `[0, delay * jitter]` 범위의 난수를 더합니다.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// 새 설정 생성 (지터 기본값 사용).
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// 스트림 재연결용 기본값 (1초에서 시작, 300초 상한, 사실상 무한 재시도).
    pub fn reconnect() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
            jitter: 0.1,
        }
    }

    /// 지터 비율 설정.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// 지터를 빼고 계산한 `retry` 번째 재시도 대기 시간 (1부터 시작).
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    /// 지터를 포함한 대기 시간. 상한을 넘지 않습니다.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=base.as_secs_f64() * self.jitter);
        (base + Duration::from_secs_f64(extra)).min(Duration::from_millis(self.max_delay_ms))
    }
}

/// 재시도를 모두 소진했거나 재시도 불가 에러로 끝난 결과.
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    /// 마지막 에러
    pub error: E,
    /// 실제 시도 횟수
    pub attempts: u32,
}

impl<E: Display> Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} attempts)", self.error, self.attempts)
    }
}

impl<E: std::fmt::Debug + Display> std::error::Error for RetryError<E> {}

/// `should_retry`가 참인 에러에 대해 지수 백오프로 재시도합니다.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
    should_retry: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "재시도 성공");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    tracing::warn!(operation, attempt, error = %error, "재시도 중단");
                    return Err(RetryError {
                        error,
                        attempts: attempt,
                    });
                }

                let delay = config.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "실패, 재시도 예정"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// 재시도 가능한 `ExchangeError`만 재시도합니다.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    f: F,
) -> Result<T, RetryError<ExchangeError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    with_retry_if(config, operation, f, ExchangeError::is_retryable).await
}

/// 재연결 루프용 백오프 상태.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    retries: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, retries: 0 }
    }

    /// 다음 대기 시간을 계산하고 단계를 올립니다.
    pub fn next_delay(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        self.config.delay_for(self.retries)
    }

    /// 성공 후 하한으로 되돌립니다.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    /// 연속 실패 횟수.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let config = no_jitter(10);
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(4), Duration::from_millis(800));
        assert_eq!(config.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(config.delay_for(40), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = no_jitter(10).with_jitter(0.1);
        for _ in 0..100 {
            let delay = config.delay_for(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(220));
        }
    }

    #[test]
    fn test_backoff_resets_to_floor() {
        let mut backoff = Backoff::new(no_jitter(u32::MAX));
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(&no_jitter(3), "fetch", || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ExchangeError::NetworkError("reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_reports_attempts() {
        let result: Result<(), _> = with_retry(&no_jitter(3), "fetch", || async {
            Err(ExchangeError::Timeout("30s".into()))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.error, ExchangeError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), _> = with_retry(&no_jitter(5), "fetch", || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ExchangeError::ParseError("bad".into()))
        })
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
