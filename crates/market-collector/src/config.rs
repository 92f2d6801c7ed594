//! 파일 + 환경변수 기반 설정 모듈.
//!
//! `config/collector.toml`(없어도 됨) 위에 `MARKET__` 접두사 환경변수를 덮어씁니다.
//! 예: `MARKET__STORAGE__DATABASE_PATH=/var/lib/market/market.db`.
//! 모든 섹션에 기본값이 있으므로 빈 설정도 유효합니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use market_data::{HealthThresholds, StorageConfig};
use market_exchange::{
    BinanceClient, BinanceConfig, CircuitBreakerConfig, CoinbaseClient, CoinbaseConfig,
    ExchangeHandle, ExchangeRegistry, FetchConfig, RateLimitConfig, StreamConfig,
};
use serde::{Deserialize, Serialize};

use crate::modules::stream_buffer::StreamBufferConfig;
use crate::Result;

/// 기본 설정 파일 경로
pub const DEFAULT_CONFIG_PATH: &str = "config/collector.toml";

/// Collector 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// 저장소 설정
    #[serde(default)]
    pub storage: StorageConfig,
    /// 체크포인트 설정
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// 데드레터 설정
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,
    /// 알림 설정
    #[serde(default)]
    pub alerts: AlertConfig,
    /// 백필 조회 설정 (재시도, RateLimiter 대기 상한)
    #[serde(default)]
    pub backfill: FetchConfig,
    /// 실시간 수집 설정
    #[serde(default)]
    pub stream: StreamSettings,
    /// 상태 점검 설정
    #[serde(default)]
    pub health: HealthConfig,
    /// 거래소별 설정
    #[serde(default)]
    pub exchanges: ExchangesConfig,
}

/// 체크포인트 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// 체크포인트 파일 디렉터리
    #[serde(default = "default_checkpoint_dir")]
    pub dir: PathBuf,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("data/checkpoints")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

/// 데드레터 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// 항목 디렉터리
    #[serde(default = "default_dead_letter_dir")]
    pub dir: PathBuf,
}

fn default_dead_letter_dir() -> PathBuf {
    PathBuf::from("data/dead_letter")
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            dir: default_dead_letter_dir(),
        }
    }
}

/// 알림 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// JSON Lines 로그 경로
    #[serde(default = "default_alert_path")]
    pub path: PathBuf,
    /// 같은 알림 억제 시간 (초)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// 보존 기간 (일)
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

fn default_alert_path() -> PathBuf {
    PathBuf::from("data/alerts.jsonl")
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_retention_days() -> i64 {
    30
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            path: default_alert_path(),
            cooldown_secs: default_cooldown_secs(),
            retention_days: default_retention_days(),
        }
    }
}

impl AlertConfig {
    /// 쿨다운을 Duration으로 반환
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// 보존 기간
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

/// 실시간 수집 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSettings {
    /// 버퍼 flush 정책
    #[serde(default)]
    pub buffer: StreamBufferConfig,
    /// 연결/재연결 정책
    #[serde(default)]
    pub connection: StreamConfig,
}

/// 상태 점검 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// 에러 수 임계값
    #[serde(default)]
    pub thresholds: HealthThresholds,
    /// 이보다 오래된 시계열은 Stale (초)
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: i64,
}

fn default_max_age_secs() -> i64 {
    7_200
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

impl HealthConfig {
    /// 신선도 기준
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_age_secs)
    }
}

/// 거래소별 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangesConfig {
    #[serde(default)]
    pub binance: BinanceSettings,
    #[serde(default)]
    pub coinbase: CoinbaseSettings,
}

/// Binance 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceSettings {
    /// 레지스트리 등록 여부
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 클라이언트 설정 (URL, 테스트넷, 타임아웃)
    #[serde(default)]
    pub client: BinanceConfig,
    #[serde(default = "RateLimitConfig::binance")]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for BinanceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            client: BinanceConfig::default(),
            rate_limit: RateLimitConfig::binance(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Coinbase 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinbaseSettings {
    /// 레지스트리 등록 여부
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub client: CoinbaseConfig,
    #[serde(default = "RateLimitConfig::coinbase")]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for CoinbaseSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            client: CoinbaseConfig::default(),
            rate_limit: RateLimitConfig::coinbase(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl CollectorConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 파일이 없으면 기본값과 환경 변수만 사용합니다.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("MARKET")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        tracing::debug!(
            path = %path.display(),
            database = %loaded.storage.database_path.display(),
            "설정 로드 완료"
        );
        Ok(loaded)
    }

    /// 활성화된 거래소로 레지스트리를 만듭니다.
    pub fn build_registry(&self) -> Result<ExchangeRegistry> {
        let mut registry = ExchangeRegistry::new();

        let binance = &self.exchanges.binance;
        if binance.enabled {
            let client = BinanceClient::new(binance.client.clone())?;
            registry.register(ExchangeHandle::new(
                Arc::new(client),
                binance.rate_limit.clone(),
                binance.circuit_breaker.clone(),
            ));
        }

        let coinbase = &self.exchanges.coinbase;
        if coinbase.enabled {
            let client = CoinbaseClient::new(coinbase.client.clone())?;
            registry.register(ExchangeHandle::new(
                Arc::new(client),
                coinbase.rate_limit.clone(),
                coinbase.circuit_breaker.clone(),
            ));
        }

        Ok(registry)
    }
}
