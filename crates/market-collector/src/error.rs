//! 에러 타입 정의.

use std::path::PathBuf;

use market_data::DataError;
use market_exchange::ExchangeError;
use thiserror::Error;

/// Collector 에러 타입
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 거래소 에러
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// 저장소/검증 에러
    #[error(transparent)]
    Data(#[from] DataError),

    /// 체크포인트 파일을 해석할 수 없음. 처음부터 다시 시작하지 않고 운영자 판단을 기다립니다.
    #[error("Checkpoint {path} is corrupt: {reason}")]
    CheckpointCorruption { path: PathBuf, reason: String },

    /// 파일 I/O 에러
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 잘못된 인자
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<config::ConfigError> for CollectorError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;
