//! 데드레터 저장소.
//!
//! 영구 실패한 메시지/배치를 항목당 JSON 파일 하나로 보관합니다.
//! 파일명은 `<도착 시각 ms>-<순번>-<uuid>.json`이라 이름순이 곧 도착순입니다.
//! 원문은 그대로 보존되며 주 저장소와 섞이지 않습니다.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use market_core::SeriesKey;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DataError, Result};

const ENTRY_EXTENSION: &str = "json";

/// 데드레터 항목 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// 파싱 또는 검증에 실패한 원본 스트림 메시지
    WireMessage,
    /// 재시도를 소진한 검증 완료 배치 (`OhlcvRecord` 배열 JSON)
    CandleBatch,
}

/// 데드레터 항목.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// 파일 stem과 같은 ID
    pub id: String,
    pub kind: DeadLetterKind,
    /// 출처 시계열
    pub series: Option<SeriesKey>,
    /// 원문 그대로의 페이로드
    pub raw_payload: String,
    /// 실패 사유
    pub reason: String,
    pub first_seen_at: DateTime<Utc>,
    /// 포기하기 전까지 시도한 횟수
    pub attempt_count: u32,
}

/// 파일 기반 데드레터 저장소.
#[derive(Debug)]
pub struct DeadLetterSink {
    dir: PathBuf,
    sequence: AtomicU64,
    recorded: AtomicU64,
}

impl DeadLetterSink {
    /// 디렉터리를 만들고 저장소를 엽니다.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            sequence: AtomicU64::new(0),
            recorded: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 이 인스턴스가 기록한 항목 수.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// 항목을 기록합니다. 임시 파일에 쓴 뒤 rename하므로 반쯤 쓰인 항목은 보이지 않습니다.
    pub async fn record(
        &self,
        kind: DeadLetterKind,
        series: Option<SeriesKey>,
        raw_payload: impl Into<String>,
        reason: impl Into<String>,
        attempt_count: u32,
    ) -> Result<DeadLetterEntry> {
        let now = Utc::now();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let entry = DeadLetterEntry {
            id: format!("{:013}-{:06}-{}", now.timestamp_millis(), seq, Uuid::new_v4()),
            kind,
            series,
            raw_payload: raw_payload.into(),
            reason: reason.into(),
            first_seen_at: now,
            attempt_count,
        };

        let body = serde_json::to_vec_pretty(&entry)?;
        let path = self.entry_path(&entry.id);
        let tmp = self.dir.join(format!(".{}.tmp", entry.id));
        tokio::fs::write(&tmp, body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        self.recorded.fetch_add(1, Ordering::Relaxed);
        warn!(
            id = %entry.id,
            kind = ?entry.kind,
            series = ?entry.series.as_ref().map(|s| s.to_string()),
            reason = %entry.reason,
            attempts = entry.attempt_count,
            "데드레터 기록"
        );
        Ok(entry)
    }

    /// 모든 항목 (도착순). 읽을 수 없는 파일은 경고 후 건너뜁니다.
    pub async fn list(&self) -> Result<Vec<DeadLetterEntry>> {
        let mut paths = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let visible = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.starts_with('.'));
            if visible && path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            match read_entry(&path).await {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "데드레터 항목 읽기 실패"),
            }
        }
        Ok(entries)
    }

    /// ID로 항목 조회.
    pub async fn get(&self, id: &str) -> Result<Option<DeadLetterEntry>> {
        let path = self.entry_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        read_entry(&path).await.map(Some)
    }

    /// 항목 삭제. 존재했으면 `true`.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.entry_path(id)).await {
            Ok(()) => {
                info!(id = %id, "데드레터 항목 삭제");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 항목 수.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, ENTRY_EXTENSION))
    }
}

async fn read_entry(path: &Path) -> Result<DeadLetterEntry> {
    let body = tokio::fs::read(path).await?;
    serde_json::from_slice(&body)
        .map_err(|e| DataError::SerializationError(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::Timeframe;

    #[tokio::test]
    async fn test_record_list_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DeadLetterSink::open(dir.path().join("dlq")).await.unwrap();
        let series = SeriesKey::new("binance", "BTC/USDT", Timeframe::M1);

        let first = sink
            .record(DeadLetterKind::WireMessage, Some(series.clone()), "{not json", "parse error", 1)
            .await
            .unwrap();
        let second = sink
            .record(DeadLetterKind::CandleBatch, Some(series), "[]", "storage down", 3)
            .await
            .unwrap();

        let entries = sink.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, first.id);
        assert_eq!(entries[0].raw_payload, "{not json");
        assert_eq!(entries[1].attempt_count, 3);
        assert_eq!(sink.recorded(), 2);

        assert_eq!(sink.get(&second.id).await.unwrap(), Some(second.clone()));
        assert!(sink.remove(&second.id).await.unwrap());
        assert!(!sink.remove(&second.id).await.unwrap());
        assert_eq!(sink.get(&second.id).await.unwrap(), None);
        assert_eq!(sink.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_skips_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DeadLetterSink::open(dir.path()).await.unwrap();
        sink.record(DeadLetterKind::WireMessage, None, "x", "bad", 1)
            .await
            .unwrap();
        std::fs::write(dir.path().join("0000000000000-broken.json"), "garbage").unwrap();
        std::fs::write(dir.path().join(".half-written.tmp"), "{").unwrap();

        let entries = sink.list().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].raw_payload, "x");
    }
}
