//! OHLCV 데이터 검증 및 저장.
//!
//! 이 crate는 다음을 제공합니다:
//! - 구조 검증기 (OHLC 관계, 거래량, 필수 필드, 타임스탬프)
//! - SQLite 트랜잭션 저장소와 Parquet 아카이브
//! - 데드레터 저장소
//! - 알림 로그와 상태 모니터

pub mod alert;
pub mod dead_letter;
pub mod error;
pub mod health;
pub mod storage;
pub mod validator;

pub use alert::{Alert, AlertLevel, AlertManager};
pub use dead_letter::{DeadLetterEntry, DeadLetterKind, DeadLetterSink};
pub use error::{DataError, Result};
pub use health::{
    evaluate_freshness, ComponentHealth, Freshness, FreshnessCheck, HealthMonitor, HealthReport,
    HealthStatus, HealthThresholds,
};
pub use storage::{
    ArchiveStats, ColumnarArchive, DataQualityMetadata, Gap, InsertReport, IntegrityReport,
    MonthPartition, StorageConfig, StorageManager, StorageStats,
};
pub use validator::{RejectReason, RejectedRow, ValidationOutcome, Validator};
