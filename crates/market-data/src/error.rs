//! 데이터 모듈 오류 타입.

use thiserror::Error;

/// 데이터 관련 오류.
#[derive(Debug, Error)]
pub enum DataError {
    /// 데이터베이스 연결 오류
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// 쿼리 실행 오류
    #[error("Query error: {0}")]
    QueryError(String),

    /// 레코드를 찾을 수 없음
    #[error("Record not found: {0}")]
    NotFound(String),

    /// 제약 조건 위반 (CHECK, NOT NULL 등)
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// 잘못된 데이터 형식
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// 마이그레이션 오류
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// 연결 풀 소진
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// 데이터 삽입 오류
    #[error("Insert error: {0}")]
    InsertError(String),

    /// 컬럼형 아카이브 오류
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// 파일 입출력 오류
    #[error("IO error: {0}")]
    IoError(String),

    /// 파싱 오류
    #[error("Parse error: {0}")]
    ParseError(String),
}

impl DataError {
    /// 같은 배치로 다시 시도할 가치가 있는 오류인지 확인합니다.
    ///
    /// 제약 조건 위반이나 형식 오류는 몇 번을 다시 써도 같은 결과입니다.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataError::ConnectionError(_)
                | DataError::QueryError(_)
                | DataError::PoolExhausted
                | DataError::InsertError(_)
                | DataError::ArchiveError(_)
                | DataError::IoError(_)
        )
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DataError::NotFound("Row not found".to_string()),
            sqlx::Error::PoolTimedOut => DataError::PoolExhausted,
            sqlx::Error::Io(e) => DataError::ConnectionError(e.to_string()),
            sqlx::Error::Database(db_err) => {
                if db_err.is_check_violation() || db_err.is_unique_violation() {
                    DataError::ConstraintViolation(db_err.message().to_string())
                } else {
                    DataError::QueryError(db_err.message().to_string())
                }
            }
            _ => DataError::QueryError(err.to_string()),
        }
    }
}

impl From<std::io::Error> for DataError {
    fn from(err: std::io::Error) -> Self {
        DataError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        DataError::SerializationError(err.to_string())
    }
}

impl From<polars::prelude::PolarsError> for DataError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        DataError::ArchiveError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(DataError::PoolExhausted.is_retryable());
        assert!(DataError::IoError("disk full".into()).is_retryable());
        assert!(!DataError::ConstraintViolation("CHECK failed".into()).is_retryable());
        assert!(!DataError::InvalidData("bad".into()).is_retryable());
    }
}
