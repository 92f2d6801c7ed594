//! 취소 가능한 실시간 캔들 스트림.
//!
//! 별도 태스크가 거래소 스트림을 읽어 파싱한 결과를 bounded 채널로 보냅니다.
//! 소비자는 채널에서 꺼내 처리하므로 backpressure와 종료 순서가 명시적입니다.
//!
//! - 연결 시도는 거래소 CircuitBreaker를 통과합니다. 연결된 뒤에도 Breaker가 Open으로
//!   바뀌면(예: REST 실패 누적) 연결을 닫고, 재연결은 Breaker가 다시 허용할 때까지 거부됩니다.
//! - 연결이 끊기면 지수 백오프 + 지터로 재연결하고, 연결에 성공하면 백오프를 초기화합니다.
//! - 형태가 잘못된 메시지는 `StreamItem::Malformed`로 원문과 함께 전달되며 루프를 멈추지 않습니다.

use std::time::Duration;

use futures::StreamExt;
use market_core::{RawCandle, Timeframe};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::CircuitState;
use crate::registry::ExchangeHandle;
use crate::retry::{Backoff, RetryConfig};
use crate::ExchangeError;

/// 조용한 연결에서도 Breaker 상태를 확인하는 주기.
const BREAKER_POLL: Duration = Duration::from_secs(1);

/// 스트림 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// 재연결 백오프
    #[serde(default = "RetryConfig::reconnect")]
    pub reconnect: RetryConfig,
    /// 소비자 채널 크기
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: RetryConfig::reconnect(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// 스트림 태스크가 내보내는 항목.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// 확정 캔들과 원문
    Candle { raw: String, candle: RawCandle },
    /// 형태 검사에 실패한 메시지
    Malformed { raw: String, reason: String },
}

/// 실시간 캔들 스트림.
pub struct LiveCandleStream {
    handle: ExchangeHandle,
    symbol: String,
    timeframe: Timeframe,
    config: StreamConfig,
}

impl LiveCandleStream {
    pub fn new(
        handle: ExchangeHandle,
        symbol: impl Into<String>,
        timeframe: Timeframe,
        config: StreamConfig,
    ) -> Self {
        Self {
            handle,
            symbol: symbol.into(),
            timeframe,
            config,
        }
    }

    /// 스트림 태스크를 시작합니다. `cancel`이 취소되면 태스크가 끝나고 채널이 닫힙니다.
    pub fn spawn(self, cancel: CancellationToken) -> (mpsc::Receiver<StreamItem>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let task = tokio::spawn(async move { self.run(tx, cancel).await });
        (rx, task)
    }

    async fn run(self, tx: mpsc::Sender<StreamItem>, cancel: CancellationToken) {
        let source = &self.handle.source;
        let breaker = &self.handle.circuit_breaker;
        let exchange = source.exchange_id().to_string();
        let mut backoff = Backoff::new(self.config.reconnect.clone());

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = breaker.call(|| source.connect_stream(&self.symbol, self.timeframe)) => result,
            };

            match connected {
                Ok(mut messages) => {
                    backoff.reset();
                    info!(exchange = %exchange, symbol = %self.symbol, timeframe = %self.timeframe, "스트림 연결 성공");

                    let mut poll = tokio::time::interval(BREAKER_POLL);
                    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    let disconnect = loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => break None,
                            _ = poll.tick() => {
                                if breaker.state() == CircuitState::Open {
                                    break Some(ExchangeError::CircuitOpen {
                                        name: breaker.name().to_string(),
                                        retry_after: Duration::ZERO,
                                    });
                                }
                                continue;
                            }
                            next = messages.next() => next,
                        };
                        match next {
                            Some(Ok(text)) => {
                                if let Some(item) = self.parse(text) {
                                    if tx.send(item).await.is_err() {
                                        debug!(exchange = %exchange, "소비자 채널 닫힘, 스트림 종료");
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => break Some(e),
                            None => break Some(ExchangeError::Disconnected("stream ended".into())),
                        }
                    };

                    match disconnect {
                        None => break,
                        Some(e) if e.is_circuit_open() => {
                            warn!(exchange = %exchange, symbol = %self.symbol, "Circuit Open, 스트림 연결 종료");
                        }
                        Some(e) => {
                            breaker.record_error(&e);
                            warn!(exchange = %exchange, symbol = %self.symbol, error = %e, "스트림 연결 끊김");
                        }
                    }
                }
                Err(e @ ExchangeError::NotSupported(_)) => {
                    error!(exchange = %exchange, error = %e, "스트리밍을 지원하지 않는 거래소");
                    break;
                }
                Err(e) => {
                    warn!(exchange = %exchange, symbol = %self.symbol, error = %e, "스트림 연결 실패");
                }
            }

            let delay = backoff.next_delay();
            info!(
                exchange = %exchange,
                attempt = backoff.retries(),
                delay_ms = delay.as_millis() as u64,
                "재연결 대기"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(exchange = %exchange, symbol = %self.symbol, "스트림 태스크 종료");
    }

    fn parse(&self, text: String) -> Option<StreamItem> {
        match self
            .handle
            .source
            .parse_stream_message(&self.symbol, self.timeframe, &text)
        {
            Ok(Some(candle)) => Some(StreamItem::Candle { raw: text, candle }),
            Ok(None) => None,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "잘못된 스트림 메시지");
                Some(StreamItem::Malformed {
                    raw: text,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::rate_limiter::RateLimitConfig;
    use crate::traits::{CandleSource, RawMessageStream};
    use crate::ExchangeResult;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    /// 첫 `drops`번 연결은 메시지 두 개 후 끊기고, 이후에는 대기만 하는 소스.
    struct FlakySource {
        connects: AtomicU32,
        drops: u32,
    }

    #[async_trait]
    impl CandleSource for FlakySource {
        fn exchange_id(&self) -> &str {
            "flaky"
        }

        fn max_candles_per_request(&self) -> u32 {
            100
        }

        async fn fetch_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _since: DateTime<Utc>,
            _limit: u32,
        ) -> ExchangeResult<Vec<RawCandle>> {
            Ok(Vec::new())
        }

        async fn connect_stream(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
        ) -> ExchangeResult<RawMessageStream> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            if n < self.drops {
                let items: Vec<ExchangeResult<String>> = vec![Ok(format!("{{\"ts\":{}}}", n)), Ok("garbage".to_string())];
                Ok(Box::pin(futures::stream::iter(items)))
            } else {
                Ok(Box::pin(futures::stream::pending::<ExchangeResult<String>>()))
            }
        }

        fn parse_stream_message(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            text: &str,
        ) -> ExchangeResult<Option<RawCandle>> {
            let value: serde_json::Value = serde_json::from_str(text)?;
            Ok(Some(RawCandle {
                exchange: "flaky".into(),
                symbol: symbol.into(),
                timeframe,
                timestamp_ms: value["ts"].as_i64(),
                open: None,
                high: None,
                low: None,
                close: None,
                volume: None,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_forwards_malformed_messages() {
        let source = Arc::new(FlakySource {
            connects: AtomicU32::new(0),
            drops: 2,
        });
        let handle = ExchangeHandle::new(
            source.clone(),
            RateLimitConfig::default(),
            CircuitBreakerConfig::new(10, Duration::from_secs(30), 1),
        );
        let config = StreamConfig {
            reconnect: RetryConfig::new(u32::MAX, Duration::from_millis(10), Duration::from_secs(1)),
            channel_capacity: 16,
        };
        let cancel = CancellationToken::new();
        let (mut rx, task) =
            LiveCandleStream::new(handle, "BTC/USDT", Timeframe::M1, config).spawn(cancel.clone());

        let mut candles = 0;
        let mut malformed = 0;
        while candles + malformed < 4 {
            match rx.recv().await.unwrap() {
                StreamItem::Candle { .. } => candles += 1,
                StreamItem::Malformed { raw, .. } => {
                    assert_eq!(raw, "garbage");
                    malformed += 1;
                }
            }
        }

        assert_eq!(candles, 2);
        assert_eq!(malformed, 2);

        cancel.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(source.connects.load(Ordering::SeqCst) >= 3);
    }

    /// 스트림이 drop되면 표시합니다.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// 메시지 하나를 보낸 뒤 끊기지 않고 대기하는 소스.
    struct QuietSource {
        connects: AtomicU32,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CandleSource for QuietSource {
        fn exchange_id(&self) -> &str {
            "quiet"
        }

        fn max_candles_per_request(&self) -> u32 {
            100
        }

        async fn fetch_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _since: DateTime<Utc>,
            _limit: u32,
        ) -> ExchangeResult<Vec<RawCandle>> {
            Ok(Vec::new())
        }

        async fn connect_stream(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
        ) -> ExchangeResult<RawMessageStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.dropped.store(false, Ordering::SeqCst);
            let guard = DropFlag(self.dropped.clone());
            let items: Vec<ExchangeResult<String>> = vec![Ok("{\"ts\":0}".to_string())];
            Ok(Box::pin(
                futures::stream::iter(items)
                    .chain(futures::stream::pending())
                    .map(move |item| {
                        let _ = &guard;
                        item
                    }),
            ))
        }

        fn parse_stream_message(
            &self,
            symbol: &str,
            timeframe: Timeframe,
            _text: &str,
        ) -> ExchangeResult<Option<RawCandle>> {
            Ok(Some(RawCandle {
                exchange: "quiet".into(),
                symbol: symbol.into(),
                timeframe,
                timestamp_ms: Some(0),
                open: None,
                high: None,
                low: None,
                close: None,
                volume: None,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_closes_live_connection() {
        let source = Arc::new(QuietSource {
            connects: AtomicU32::new(0),
            dropped: Arc::new(AtomicBool::new(false)),
        });
        let handle = ExchangeHandle::new(
            source.clone(),
            RateLimitConfig::default(),
            CircuitBreakerConfig::new(2, Duration::from_secs(30), 1),
        );
        let config = StreamConfig {
            reconnect: RetryConfig::new(u32::MAX, Duration::from_millis(10), Duration::from_secs(1)),
            channel_capacity: 16,
        };
        let cancel = CancellationToken::new();
        let (mut rx, task) = LiveCandleStream::new(handle.clone(), "BTC/USDT", Timeframe::M1, config)
            .spawn(cancel.clone());

        assert!(matches!(rx.recv().await.unwrap(), StreamItem::Candle { .. }));
        assert!(!source.dropped.load(Ordering::SeqCst));

        // 같은 거래소의 REST 호출이 연속 실패해 Breaker가 열림
        for _ in 0..2 {
            let result = handle
                .circuit_breaker
                .call(|| async { Err::<(), _>(ExchangeError::NetworkError("down".into())) })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(handle.circuit_breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(source.dropped.load(Ordering::SeqCst));
        assert_eq!(source.connects.load(Ordering::SeqCst), 1);

        // reset_timeout 이후 HalfOpen 프로브로 재연결
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(source.connects.load(Ordering::SeqCst), 2);
        assert!(matches!(rx.recv().await.unwrap(), StreamItem::Candle { .. }));
        assert_eq!(handle.circuit_breaker.state(), CircuitState::Closed);

        cancel.cancel();
        task.await.unwrap();
    }
}
