//! 거래소별 다중 윈도우 Rate Limiter.
//!
//! 초당/분당 요청 수와 분당 가중치처럼 여러 윈도우를 동시에 적용합니다.
//! 요청은 모든 버킷에 토큰이 충분할 때만 통과하며, 차감은 한 번의 잠금 안에서
//! 모든 버킷에 함께 이루어집니다.
//!
//! # 버킷 모델
//!
//! 각 버킷은 차감 기록을 들고 있고, 차감된 토큰은 정확히 한 주기 뒤에 돌아옵니다.
//! 따라서 길이가 `period`인 어떤 구간에서도 통과한 양이 `capacity`를 넘지 않습니다.
//! 리필은 `acquire` 호출 시점에 경과 시간으로 계산하며 별도 타이머는 없습니다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use market_core::ErrorSource;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{ExchangeError, ExchangeResult};

/// 윈도우가 세는 단위.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// 요청 1건당 1토큰
    Requests,
    /// 요청 가중치만큼 차감
    Weight,
}

/// 윈도우 하나의 한도.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    /// 윈도우 이름 (로그용, 예: "per_second")
    pub name: String,
    /// 주기당 허용량
    pub capacity: u32,
    /// 주기 (밀리초)
    pub period_ms: u64,
    /// 차감 단위
    #[serde(default = "default_window_kind")]
    pub kind: WindowKind,
}

fn default_window_kind() -> WindowKind {
    WindowKind::Requests
}

impl RateWindow {
    /// 요청 수 윈도우.
    pub fn requests(name: impl Into<String>, capacity: u32, period: Duration) -> Self {
        Self {
            name: name.into(),
            capacity,
            period_ms: period.as_millis() as u64,
            kind: WindowKind::Requests,
        }
    }

    /// 가중치 윈도우.
    pub fn weight(name: impl Into<String>, capacity: u32, period: Duration) -> Self {
        Self {
            kind: WindowKind::Weight,
            ..Self::requests(name, capacity, period)
        }
    }
}

/// Rate Limiter 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 동시에 적용할 윈도우 목록
    pub windows: Vec<RateWindow>,
    /// 요청 한 번의 기본 가중치
    #[serde(default = "default_request_weight")]
    pub request_weight: u32,
}

fn default_request_weight() -> u32 {
    1
}

impl RateLimitConfig {
    /// Binance 현물 API 한도 (10/s, 1200/min, weight 6000/min).
    pub fn binance() -> Self {
        Self {
            windows: vec![
                RateWindow::requests("per_second", 10, Duration::from_secs(1)),
                RateWindow::requests("per_minute", 1200, Duration::from_secs(60)),
                RateWindow::weight("weight_per_minute", 6000, Duration::from_secs(60)),
            ],
            // /api/v3/klines limit=1000 요청 가중치
            request_weight: 2,
        }
    }

    /// Coinbase 공개 API 한도 (3/s, 15/min).
    pub fn coinbase() -> Self {
        Self {
            windows: vec![
                RateWindow::requests("per_second", 3, Duration::from_secs(1)),
                RateWindow::requests("per_minute", 15, Duration::from_secs(60)),
            ],
            request_weight: 1,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            windows: vec![RateWindow::requests("per_second", 10, Duration::from_secs(1))],
            request_weight: 1,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    window: RateWindow,
    period: Duration,
    /// (차감 시각, 차감량)
    debits: VecDeque<(Instant, u32)>,
    in_use: u32,
}

impl TokenBucket {
    fn new(window: RateWindow) -> Self {
        Self {
            period: Duration::from_millis(window.period_ms),
            window,
            debits: VecDeque::new(),
            in_use: 0,
        }
    }

    fn cost(&self, weight: u32) -> u32 {
        match self.window.kind {
            WindowKind::Requests => 1,
            WindowKind::Weight => weight,
        }
    }

    /// 한 주기가 지난 차감분을 돌려받습니다.
    fn refill(&mut self, now: Instant) {
        while let Some(&(at, amount)) = self.debits.front() {
            if at + self.period > now {
                break;
            }
            self.debits.pop_front();
            self.in_use -= amount;
        }
    }

    fn available(&self) -> u32 {
        self.window.capacity.saturating_sub(self.in_use)
    }

    /// `cost`만큼 확보되는 시각. 이미 충분하면 `now`.
    fn ready_at(&self, cost: u32, now: Instant) -> Instant {
        let mut available = self.available();
        if available >= cost {
            return now;
        }
        for &(at, amount) in &self.debits {
            available += amount;
            if available >= cost {
                return at + self.period;
            }
        }
        now + self.period
    }

    fn debit(&mut self, cost: u32, now: Instant) {
        self.debits.push_back((now, cost));
        self.in_use += cost;
    }
}

/// 윈도우별 잔여량 스냅샷.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub name: String,
    pub capacity: u32,
    pub available: u32,
}

/// 거래소 하나에 대한 Rate Limiter.
pub struct RateLimiter {
    exchange: String,
    request_weight: u32,
    buckets: Mutex<Vec<TokenBucket>>,
    admitted: AtomicU64,
    timeouts: AtomicU64,
}

impl RateLimiter {
    /// 새 Rate Limiter 생성.
    pub fn new(exchange: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            exchange: exchange.into(),
            request_weight: config.request_weight.max(1),
            buckets: Mutex::new(config.windows.into_iter().map(TokenBucket::new).collect()),
            admitted: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// 거래소 ID.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// 설정된 기본 요청 가중치.
    pub fn request_weight(&self) -> u32 {
        self.request_weight
    }

    /// 모든 윈도우에 `weight`만큼 여유가 생길 때까지 대기한 뒤 차감합니다.
    ///
    /// `deadline`까지 확보하지 못하면 `RateLimitTimeout`을 반환하며 아무것도 차감하지 않습니다.
    pub async fn acquire(&self, weight: u32, deadline: Option<Instant>) -> ExchangeResult<()> {
        let started = Instant::now();

        loop {
            let now = Instant::now();
            let ready_at = {
                let mut buckets = self.lock();
                let mut ready_at = now;
                for bucket in buckets.iter_mut() {
                    let cost = bucket.cost(weight);
                    if cost > bucket.window.capacity {
                        return Err(ExchangeError::InvalidRequest(format!(
                            "weight {} exceeds {} window capacity {}",
                            weight, bucket.window.name, bucket.window.capacity
                        )));
                    }
                    bucket.refill(now);
                    ready_at = ready_at.max(bucket.ready_at(cost, now));
                }

                if ready_at <= now {
                    for bucket in buckets.iter_mut() {
                        let cost = bucket.cost(weight);
                        bucket.debit(cost, now);
                    }
                    self.admitted.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                ready_at
            };

            match deadline {
                Some(deadline) if ready_at > deadline => {
                    // 마감 전에 확보될 수 없으면 마감까지만 기다렸다가 실패
                    tokio::time::sleep_until(deadline).await;
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        exchange = %self.exchange,
                        weight,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Rate limit 대기 시간 초과"
                    );
                    return Err(ExchangeError::RateLimitTimeout {
                        exchange: self.exchange.clone(),
                        waited: started.elapsed(),
                    });
                }
                _ => {
                    tracing::trace!(
                        exchange = %self.exchange,
                        wait_ms = (ready_at - now).as_millis() as u64,
                        "Rate limit 대기"
                    );
                    tokio::time::sleep_until(ready_at).await;
                }
            }
        }
    }

    /// 타임아웃까지 대기하는 편의 함수.
    pub async fn acquire_within(&self, weight: u32, timeout: Duration) -> ExchangeResult<()> {
        self.acquire(weight, Some(Instant::now() + timeout)).await
    }

    /// 윈도우별 현재 잔여량.
    pub fn status(&self) -> Vec<WindowStatus> {
        let now = Instant::now();
        let mut buckets = self.lock();
        buckets
            .iter_mut()
            .map(|bucket| {
                bucket.refill(now);
                WindowStatus {
                    name: bucket.window.name.clone(),
                    capacity: bucket.window.capacity,
                    available: bucket.available(),
                }
            })
            .collect()
    }

    /// 통과한 요청 수.
    pub fn admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }

    /// 대기 시간 초과 횟수.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TokenBucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ErrorSource for RateLimiter {
    fn component(&self) -> String {
        format!("rate_limiter:{}", self.exchange)
    }

    fn error_count(&self) -> u64 {
        self.timeouts()
    }
}
