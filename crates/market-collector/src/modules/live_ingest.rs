//! 실시간 캔들 수집.
//!
//! 심볼마다 `LiveCandleStream` 태스크를 띄우고, 읽기 루프가 모든 채널을 합쳐
//! 소비합니다. 별도 flush 태스크가 주기적으로 버퍼를 비우고, 읽기 루프는 행 수
//! 기준에 도달하면 직접 flush합니다.
//!
//! ```text
//! stream task ─┐
//! stream task ─┼─> 읽기 루프 ─> Validator ─> StreamBuffer ─> StorageManager
//! stream task ─┘        │              │             │
//!                       └──────────────┴──> DeadLetterSink
//! ```
//!
//! 종료 신호를 받으면 읽기 루프가 멈추고 flush 태스크를 세운 뒤 마지막으로
//! 한 번 더 flush합니다.

use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, BoxStream, StreamExt};
use market_core::{SeriesKey, Timeframe};
use market_data::{AlertLevel, AlertManager, DeadLetterKind, DeadLetterSink, Validator};
use market_exchange::{ExchangeHandle, LiveCandleStream, StreamConfig, StreamItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::modules::stream_buffer::{FlushOutcome, StreamBuffer};
use crate::stats::IngestStats;
use crate::Result;

const ALERT_SOURCE: &str = "live_ingest";

/// 실시간 수집기
pub struct LiveIngest {
    handle: ExchangeHandle,
    buffer: Arc<StreamBuffer>,
    dead_letters: Arc<DeadLetterSink>,
    alerts: Arc<AlertManager>,
    validator: Validator,
    stream_config: StreamConfig,
}

impl LiveIngest {
    pub fn new(
        handle: ExchangeHandle,
        buffer: Arc<StreamBuffer>,
        dead_letters: Arc<DeadLetterSink>,
        alerts: Arc<AlertManager>,
        stream_config: StreamConfig,
    ) -> Self {
        Self {
            handle,
            buffer,
            dead_letters,
            alerts,
            validator: Validator::new(),
            stream_config,
        }
    }

    pub fn buffer(&self) -> &Arc<StreamBuffer> {
        &self.buffer
    }

    /// `cancel`이 취소되거나 모든 스트림이 끝날 때까지 수집합니다.
    pub async fn run(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        cancel: CancellationToken,
    ) -> Result<IngestStats> {
        let started = Instant::now();
        let mut stats = IngestStats::default();

        // 스트림 태스크는 읽기 루프가 끝나면 함께 멈춥니다.
        let streams_cancel = cancel.child_token();
        let mut tasks = Vec::with_capacity(symbols.len());
        let mut receivers: Vec<BoxStream<'static, (SeriesKey, StreamItem)>> = Vec::new();
        for symbol in symbols {
            let key = SeriesKey::new(self.handle.exchange_id(), symbol.clone(), timeframe);
            let stream = LiveCandleStream::new(
                self.handle.clone(),
                symbol.clone(),
                timeframe,
                self.stream_config.clone(),
            );
            let (rx, task) = stream.spawn(streams_cancel.clone());
            tasks.push(task);
            receivers.push(
                stream::unfold((rx, key), |(mut rx, key)| async move {
                    let item = rx.recv().await?;
                    Some(((key.clone(), item), (rx, key)))
                })
                .boxed(),
            );
        }
        let mut merged = stream::select_all(receivers);

        let flusher_stop = CancellationToken::new();
        let flusher = tokio::spawn(flush_periodically(
            self.buffer.clone(),
            self.alerts.clone(),
            flusher_stop.clone(),
        ));

        info!(
            exchange = %self.handle.exchange_id(),
            symbols = symbols.len(),
            %timeframe,
            "실시간 수집 시작"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = merged.next() => next,
            };
            let Some((key, item)) = next else {
                warn!("모든 스트림 종료");
                break;
            };

            match item {
                StreamItem::Candle { raw, candle } => {
                    stats.received += 1;
                    match self.validator.validate_row(&candle) {
                        Ok(record) => {
                            let pending = self.buffer.push([record]).await;
                            if self.buffer.is_full(pending) {
                                report_flush(&self.buffer, &self.alerts).await;
                            }
                        }
                        Err(reason) => {
                            stats.rejected += 1;
                            self.dead_letter(&key, raw, reason.to_string()).await;
                        }
                    }
                }
                StreamItem::Malformed { raw, reason } => {
                    stats.malformed += 1;
                    self.dead_letter(&key, raw, reason).await;
                }
            }
        }

        streams_cancel.cancel();
        flusher_stop.cancel();
        if let Err(e) = flusher.await {
            error!(error = %e, "flush 태스크 비정상 종료");
        }

        // 마지막 flush
        report_flush(&self.buffer, &self.alerts).await;

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "스트림 태스크 비정상 종료");
            }
        }

        stats.stored = self.buffer.stored_rows();
        stats.dead_lettered_rows = self.buffer.dead_lettered_rows();
        stats.flushes = self.buffer.flush_count();
        stats.elapsed = started.elapsed();
        Ok(stats)
    }

    /// 원문 메시지를 데드레터에 기록합니다. 기록마저 실패하면 critical 알림을 남깁니다.
    async fn dead_letter(&self, key: &SeriesKey, raw: String, reason: String) {
        if let Err(e) = self
            .dead_letters
            .record(DeadLetterKind::WireMessage, Some(key.clone()), raw, reason, 1)
            .await
        {
            error!(series = %key, error = %e, "데드레터 기록 실패");
            let message = format!("dead-letter write failed for {}", key);
            if let Err(e) = self.alerts.emit(AlertLevel::Critical, ALERT_SOURCE, message).await {
                error!(error = %e, "알림 기록 실패");
            }
        }
    }
}

/// 주기적 flush 루프.
async fn flush_periodically(
    buffer: Arc<StreamBuffer>,
    alerts: Arc<AlertManager>,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(buffer.config().flush_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // 첫 tick은 즉시 발생
    interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => report_flush(&buffer, &alerts).await,
        }
    }
    debug!("flush 태스크 종료");
}

/// flush 결과를 로그/알림으로 남깁니다.
async fn report_flush(buffer: &StreamBuffer, alerts: &AlertManager) {
    let alert = match buffer.flush().await {
        Ok(FlushOutcome::Empty) | Ok(FlushOutcome::Stored(_)) => None,
        Ok(FlushOutcome::DeadLettered { .. }) => {
            Some((AlertLevel::Error, "stream batch dead-lettered".to_string()))
        }
        Err(e) => {
            error!(error = %e, "flush 실패, 행은 버퍼에 남음");
            Some((AlertLevel::Critical, "stream flush failed".to_string()))
        }
    };

    if let Some((level, message)) = alert {
        if let Err(e) = alerts.emit(level, ALERT_SOURCE, message).await {
            error!(error = %e, "알림 기록 실패");
        }
    }
}
