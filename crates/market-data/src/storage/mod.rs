//! 영속 저장소.
//!
//! - `ohlcv` - SQLite 기반 트랜잭션 저장소 (`StorageManager`)
//! - `columnar` - 월 단위 Parquet 아카이브 (`ColumnarArchive`)

pub mod columnar;
pub mod ohlcv;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use columnar::{ArchiveStats, ColumnarArchive, MonthPartition};
pub use ohlcv::{DataQualityMetadata, Gap, InsertReport, IntegrityReport, StorageManager, StorageStats};

/// 저장소 설정.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite 데이터베이스 파일 경로
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Parquet 아카이브 루트
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// 아카이브 사용 여부
    #[serde(default = "default_archive_enabled")]
    pub archive_enabled: bool,
    /// 풀의 최대 연결 수
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// SQLite busy 타임아웃 (초)
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/market.db")
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/archive")
}
fn default_archive_enabled() -> bool {
    true
}
fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout() -> u64 {
    5
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            archive_dir: default_archive_dir(),
            archive_enabled: default_archive_enabled(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout(),
        }
    }
}

impl StorageConfig {
    /// 디렉터리 하나 아래에 데이터베이스와 아카이브를 두는 설정.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            database_path: dir.join("market.db"),
            archive_dir: dir.join("archive"),
            ..Default::default()
        }
    }
}
