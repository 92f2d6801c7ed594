//! OHLCV 수집 파이프라인 실행기.
//!
//! 이 crate는 저장소와 거래소 커넥터를 묶어 다음 작업을 제공합니다:
//! - 체크포인트 기반 과거 데이터 백필 (중단 후 재개)
//! - 실시간 스트림 수집 (버퍼 + 데드레터)
//! - 데드레터 재처리, 상태 점검, 무결성 점검

pub mod config;
pub mod error;
pub mod modules;
pub mod pipeline;
pub mod stats;

pub use config::CollectorConfig;
pub use error::{CollectorError, Result};
pub use pipeline::Pipeline;
pub use stats::{BackfillReport, IngestStats, ReplayReport};
