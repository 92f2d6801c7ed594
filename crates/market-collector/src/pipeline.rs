//! 조립 지점.
//!
//! 저장소, 거래소 레지스트리, 데드레터, 알림, 체크포인트를 한 번 만들고
//! 작업마다 필요한 것만 명시적으로 넘깁니다.

use std::sync::Arc;

use market_data::{AlertManager, DeadLetterSink, HealthMonitor, StorageManager};
use market_exchange::{ExchangeRegistry, HistoricalFetcher};

use crate::config::CollectorConfig;
use crate::modules::{BackfillJob, CheckpointStore, LiveIngest, StreamBuffer};
use crate::Result;

/// 수집 파이프라인 구성 요소
pub struct Pipeline {
    pub config: CollectorConfig,
    pub storage: Arc<StorageManager>,
    pub registry: ExchangeRegistry,
    pub dead_letters: Arc<DeadLetterSink>,
    pub alerts: Arc<AlertManager>,
    pub checkpoints: CheckpointStore,
}

impl Pipeline {
    /// 설정의 거래소로 파이프라인을 엽니다.
    pub async fn open(config: CollectorConfig) -> Result<Self> {
        let registry = config.build_registry()?;
        Self::with_registry(config, registry).await
    }

    /// 주어진 레지스트리로 파이프라인을 엽니다.
    pub async fn with_registry(config: CollectorConfig, registry: ExchangeRegistry) -> Result<Self> {
        let storage = Arc::new(StorageManager::open(&config.storage).await?);
        let dead_letters = Arc::new(DeadLetterSink::open(&config.dead_letter.dir).await?);
        let alerts = Arc::new(AlertManager::new(
            config.alerts.path.clone(),
            config.alerts.cooldown(),
        ));
        let checkpoints = CheckpointStore::new(&config.checkpoint.dir);

        tracing::info!(exchanges = ?registry.exchange_ids(), "파이프라인 준비 완료");
        Ok(Self {
            config,
            storage,
            registry,
            dead_letters,
            alerts,
            checkpoints,
        })
    }

    /// 거래소 하나의 백필 작업.
    pub fn backfill_job(&self, exchange: &str) -> Result<BackfillJob> {
        let handle = self.registry.get(exchange)?.clone();
        let fetcher = HistoricalFetcher::new(handle, self.config.backfill.clone());
        Ok(BackfillJob::new(
            fetcher,
            self.storage.clone(),
            self.checkpoints.clone(),
            self.alerts.clone(),
            self.config.backfill.retry.clone(),
        ))
    }

    /// 거래소 하나의 실시간 수집기.
    pub fn live_ingest(&self, exchange: &str) -> Result<LiveIngest> {
        let handle = self.registry.get(exchange)?.clone();
        let buffer = Arc::new(StreamBuffer::new(
            self.storage.clone(),
            self.dead_letters.clone(),
            self.config.stream.buffer.clone(),
        ));
        Ok(LiveIngest::new(
            handle,
            buffer,
            self.dead_letters.clone(),
            self.alerts.clone(),
            self.config.stream.connection.clone(),
        ))
    }

    /// 저장소와 모든 거래소의 에러 카운터를 보는 상태 모니터.
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.storage.clone(), self.config.health.thresholds)
            .with_sources(self.registry.error_sources())
            .with_alerts(self.alerts.clone())
    }

    /// 저장소 연결을 닫습니다.
    pub async fn close(&self) {
        self.storage.close().await;
    }
}
