//! 데이터 신선도와 컴포넌트 상태 점검.
//!
//! 파이프라인에 대해 읽기 전용입니다. 저장소 메타데이터와 각 컴포넌트의
//! 에러 카운터만 관찰하고, 이상이 있으면 AlertManager로 알립니다.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use market_core::{ErrorSource, SeriesKey};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alert::{AlertLevel, AlertManager};
use crate::error::Result;
use crate::storage::{DataQualityMetadata, StorageManager};

/// 시계열 신선도.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Freshness {
    Fresh,
    Stale,
    NoData,
}

/// 시계열 하나의 신선도 점검 결과.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessCheck {
    pub series: SeriesKey,
    pub status: Freshness,
    pub last_timestamp: Option<DateTime<Utc>>,
    /// 마지막 캔들 이후 경과 시간 (초)
    pub age_secs: Option<i64>,
}

/// 컴포넌트/전체 상태.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// 프로세스 종료 코드 (0 정상, 1 저하, 2 비정상).
    pub fn exit_code(&self) -> i32 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// 에러 수 임계값.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// 이 값을 넘으면 Degraded
    #[serde(default = "default_degraded")]
    pub degraded: u64,
    /// 이 값을 넘으면 Unhealthy
    #[serde(default = "default_unhealthy")]
    pub unhealthy: u64,
}

fn default_degraded() -> u64 {
    5
}
fn default_unhealthy() -> u64 {
    20
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded: default_degraded(),
            unhealthy: default_unhealthy(),
        }
    }
}

impl HealthThresholds {
    /// 에러 수로 상태 분류.
    pub fn classify(&self, error_count: u64) -> HealthStatus {
        if error_count > self.unhealthy {
            HealthStatus::Unhealthy
        } else if error_count > self.degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// 컴포넌트 상태.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub error_count: u64,
    pub status: HealthStatus,
}

/// 전체 점검 보고서.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub series: Vec<FreshnessCheck>,
    pub checked_at: DateTime<Utc>,
}

/// 상태 모니터.
pub struct HealthMonitor {
    storage: Arc<StorageManager>,
    sources: Vec<Arc<dyn ErrorSource>>,
    thresholds: HealthThresholds,
    alerts: Option<Arc<AlertManager>>,
}

impl HealthMonitor {
    /// 저장소는 항상 에러 카운터 출처에 포함됩니다.
    pub fn new(storage: Arc<StorageManager>, thresholds: HealthThresholds) -> Self {
        let sources = vec![storage.clone() as Arc<dyn ErrorSource>];
        Self {
            storage,
            sources,
            thresholds,
            alerts: None,
        }
    }

    /// 에러 카운터 출처 추가 (RateLimiter, CircuitBreaker 등).
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = Arc<dyn ErrorSource>>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// 점검 결과를 알림으로 보낼 AlertManager 설정.
    pub fn with_alerts(mut self, alerts: Arc<AlertManager>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// 시계열 하나의 신선도.
    pub async fn check_freshness(
        &self,
        key: &SeriesKey,
        max_age: chrono::Duration,
    ) -> Result<FreshnessCheck> {
        let meta = self.storage.get_metadata(key).await?;
        Ok(evaluate_freshness(key, meta.as_ref(), max_age, Utc::now()))
    }

    /// 메타데이터가 있는 모든 시계열의 신선도.
    pub async fn check_all(&self, max_age: chrono::Duration) -> Result<Vec<FreshnessCheck>> {
        let now = Utc::now();
        let checks = self
            .storage
            .list_metadata()
            .await?
            .iter()
            .map(|m| evaluate_freshness(&m.series_key(), Some(m), max_age, now))
            .collect();
        Ok(checks)
    }

    /// 컴포넌트별 상태.
    pub fn component_health(&self) -> Vec<ComponentHealth> {
        self.sources
            .iter()
            .map(|s| {
                let error_count = s.error_count();
                ComponentHealth {
                    component: s.component(),
                    error_count,
                    status: self.thresholds.classify(error_count),
                }
            })
            .collect()
    }

    /// 전체 점검. 오래된 시계열은 Degraded로 계산하고, 이상은 알림으로 보냅니다.
    pub async fn report(&self, max_age: chrono::Duration) -> Result<HealthReport> {
        let series = self.check_all(max_age).await?;
        let components = self.component_health();

        let component_status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let freshness_status = if series.iter().any(|s| s.status != Freshness::Fresh) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let status = component_status.max(freshness_status);

        if let Some(alerts) = &self.alerts {
            for check in series.iter().filter(|s| s.status == Freshness::Stale) {
                alerts
                    .emit(
                        AlertLevel::Warning,
                        "health_monitor",
                        format!("series {} is stale", check.series),
                    )
                    .await?;
            }
            for c in &components {
                let level = match c.status {
                    HealthStatus::Healthy => continue,
                    HealthStatus::Degraded => AlertLevel::Warning,
                    HealthStatus::Unhealthy => AlertLevel::Error,
                };
                alerts
                    .emit(
                        level,
                        c.component.clone(),
                        format!("component is {:?}", c.status),
                    )
                    .await?;
            }
        }

        debug!(status = ?status, series = series.len(), "상태 점검 완료");
        Ok(HealthReport {
            status,
            components,
            series,
            checked_at: Utc::now(),
        })
    }
}

/// 메타데이터의 마지막 캔들 시각과 현재 시각을 비교합니다.
pub fn evaluate_freshness(
    key: &SeriesKey,
    meta: Option<&DataQualityMetadata>,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> FreshnessCheck {
    match meta {
        None => FreshnessCheck {
            series: key.clone(),
            status: Freshness::NoData,
            last_timestamp: None,
            age_secs: None,
        },
        Some(m) => {
            let age = now - m.last_timestamp;
            FreshnessCheck {
                series: key.clone(),
                status: if age > max_age {
                    Freshness::Stale
                } else {
                    Freshness::Fresh
                },
                last_timestamp: Some(m.last_timestamp),
                age_secs: Some(age.num_seconds()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use market_core::{OhlcvRecord, Timeframe};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter(AtomicU64);

    impl ErrorSource for Counter {
        fn component(&self) -> String {
            "rate_limiter:test".into()
        }
        fn error_count(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn metadata(last: DateTime<Utc>) -> DataQualityMetadata {
        DataQualityMetadata {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timeframe: Timeframe::M1,
            first_timestamp: last,
            last_timestamp: last,
            total_records: 1,
            last_validated_at: last,
        }
    }

    #[test]
    fn test_evaluate_freshness() {
        let now = Utc::now();
        let key = SeriesKey::new("binance", "BTC/USDT", Timeframe::M1);
        let max_age = chrono::Duration::minutes(5);

        let fresh = metadata(now - chrono::Duration::minutes(2));
        assert_eq!(evaluate_freshness(&key, Some(&fresh), max_age, now).status, Freshness::Fresh);

        let stale = metadata(now - chrono::Duration::minutes(10));
        let check = evaluate_freshness(&key, Some(&stale), max_age, now);
        assert_eq!(check.status, Freshness::Stale);
        assert_eq!(check.age_secs, Some(600));

        assert_eq!(evaluate_freshness(&key, None, max_age, now).status, Freshness::NoData);
    }

    #[test]
    fn test_threshold_classification() {
        let t = HealthThresholds {
            degraded: 5,
            unhealthy: 20,
        };
        assert_eq!(t.classify(0), HealthStatus::Healthy);
        assert_eq!(t.classify(5), HealthStatus::Healthy);
        assert_eq!(t.classify(6), HealthStatus::Degraded);
        assert_eq!(t.classify(21), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::Unhealthy.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_report_combines_components_and_freshness() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(StorageManager::open(&StorageConfig::in_dir(dir.path())).await.unwrap());
        let alerts = Arc::new(AlertManager::new(dir.path().join("alerts.jsonl"), std::time::Duration::ZERO));

        // 오래된 캔들 하나
        let old = Utc::now() - chrono::Duration::days(2);
        let ts = old.timestamp_millis() / 60_000 * 60_000;
        let record = OhlcvRecord {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timeframe: Timeframe::M1,
            timestamp: market_core::utc_from_millis(ts).unwrap(),
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(0),
        };
        storage.insert(&[record]).await.unwrap();

        let counter = Arc::new(Counter(AtomicU64::new(25)));
        let monitor = HealthMonitor::new(storage.clone(), HealthThresholds::default())
            .with_sources([counter.clone() as Arc<dyn ErrorSource>])
            .with_alerts(alerts.clone());

        let report = monitor.report(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.components.len(), 2);
        assert_eq!(report.series.len(), 1);
        assert_eq!(report.series[0].status, Freshness::Stale);

        let logged = alerts.read_all().await.unwrap();
        assert!(logged.iter().any(|a| a.level == AlertLevel::Warning && a.source == "health_monitor"));
        assert!(logged.iter().any(|a| a.level == AlertLevel::Error && a.source == "rate_limiter:test"));

        counter.0.store(0, Ordering::Relaxed);
        let report = monitor.report(chrono::Duration::days(7)).await.unwrap();
        assert_eq!(report.status, HealthStatus::Healthy);
    }
}
