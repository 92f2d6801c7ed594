//! 백필 체크포인트 관리 모듈.
//!
//! 장시간 실행되는 백필 작업의 중단/재개를 지원합니다.
//!
//! # 주요 기능
//!
//! - **체크포인트 저장**: 윈도우가 커밋될 때마다 마지막 완료 시각 저장
//! - **중단점 재개**: `last_completed_timestamp` 다음 캔들부터 이어서 처리
//! - **수동 복구**: 시계열당 TOML 파일 하나 (`<dir>/<exchange>_<symbol>_<timeframe>.toml`)
//!
//! # 사용 예
//!
//! ```rust,ignore
//! let store = CheckpointStore::new("data/checkpoints");
//! let resume_from = store.load(&key).await?;
//!
//! // 윈도우 커밋 후
//! checkpoint.advance(window.end, rows);
//! store.save(&checkpoint).await?;
//!
//! // 완료 시
//! store.delete(&key).await?;
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use market_core::{SeriesKey, Timeframe};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CollectorError;
use crate::Result;

/// 체크포인트 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// 실행 중
    Running,
    /// 중단됨 (재개 가능)
    Interrupted,
}

/// 백필 체크포인트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillCheckpoint {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// 작업이 요청받은 구간
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    /// 커밋이 끊김 없이 이어진 마지막 캔들 시각
    pub last_completed_timestamp: Option<DateTime<Utc>>,
    /// 커밋된 윈도우에서 받은 누적 행 수
    pub records_fetched: u64,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackfillCheckpoint {
    /// 새 작업의 체크포인트
    pub fn new(key: &SeriesKey, range_start: DateTime<Utc>, range_end: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            range_start,
            range_end,
            last_completed_timestamp: None,
            records_fetched: 0,
            status: CheckpointStatus::Running,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.timeframe)
    }

    /// 재개 시작 시각 (마지막 완료 캔들의 다음 캔들).
    pub fn resume_from(&self) -> DateTime<Utc> {
        match self.last_completed_timestamp {
            Some(ts) => ts + chrono::Duration::milliseconds(self.timeframe.duration_ms()),
            None => self.range_start,
        }
    }

    /// 커밋된 윈도우만큼 진행.
    pub fn advance(&mut self, completed: DateTime<Utc>, records: u64) {
        self.last_completed_timestamp = Some(completed);
        self.records_fetched += records;
        self.updated_at = Utc::now();
    }
}

/// 파일 기반 체크포인트 저장소
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 시계열의 체크포인트 파일 경로.
    pub fn path(&self, key: &SeriesKey) -> PathBuf {
        self.dir.join(format!("{}.toml", key.file_stem()))
    }

    /// 체크포인트 로드.
    ///
    /// # Returns
    /// * `Ok(Some(_))` - 저장된 체크포인트
    /// * `Ok(None)` - 파일 없음
    /// * `Err(CheckpointCorruption)` - 파일을 해석할 수 없거나 다른 시계열의 체크포인트
    pub async fn load(&self, key: &SeriesKey) -> Result<Option<BackfillCheckpoint>> {
        let path = self.path(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let checkpoint = parse_checkpoint(&path, &content)?;
        if checkpoint.series_key() != *key {
            return Err(CollectorError::CheckpointCorruption {
                path,
                reason: format!("belongs to {}, expected {}", checkpoint.series_key(), key),
            });
        }
        Ok(Some(checkpoint))
    }

    /// 체크포인트 저장. 임시 파일에 쓴 뒤 rename합니다.
    pub async fn save(&self, checkpoint: &BackfillCheckpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let key = checkpoint.series_key();
        let path = self.path(&key);
        let tmp = self.dir.join(format!(".{}.toml.tmp", key.file_stem()));
        let body = toml::to_string_pretty(checkpoint).map_err(|e| {
            CollectorError::InvalidArgument(format!("checkpoint serialization failed: {}", e))
        })?;

        tokio::fs::write(&tmp, body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(
            series = %key,
            last_completed = ?checkpoint.last_completed_timestamp,
            records = checkpoint.records_fetched,
            "체크포인트 저장"
        );
        Ok(())
    }

    /// 체크포인트 삭제. 존재했으면 `true`.
    pub async fn delete(&self, key: &SeriesKey) -> Result<bool> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => {
                info!(series = %key, "체크포인트 삭제");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 실행 중인 체크포인트를 "interrupted"로 마킹.
    ///
    /// 프로세스 종료 시 호출하여 다음 실행에서 재개 가능하도록 합니다.
    pub async fn mark_interrupted(&self, key: &SeriesKey) -> Result<bool> {
        match self.load(key).await? {
            Some(mut checkpoint) if checkpoint.status == CheckpointStatus::Running => {
                checkpoint.status = CheckpointStatus::Interrupted;
                checkpoint.updated_at = Utc::now();
                self.save(&checkpoint).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// 모든 체크포인트 조회 (파일명순). 해석할 수 없는 파일은 경고 후 건너뜁니다.
    pub async fn list(&self) -> Result<Vec<BackfillCheckpoint>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let visible = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'));
            if visible && path.extension().and_then(|e| e.to_str()) == Some("toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut checkpoints = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(content) => parse_checkpoint(&path, &content),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(c) => checkpoints.push(c),
                Err(e) => warn!(path = %path.display(), error = %e, "체크포인트 읽기 실패"),
            }
        }
        Ok(checkpoints)
    }
}

fn parse_checkpoint(path: &Path, content: &str) -> Result<BackfillCheckpoint> {
    toml::from_str(content).map_err(|e| CollectorError::CheckpointCorruption {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
