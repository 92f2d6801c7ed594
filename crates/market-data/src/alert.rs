//! 알림 로그.
//!
//! JSON Lines 파일에 한 줄씩 추가합니다. 외부 모니터는 파이프라인 내부와
//! 무관하게 이 파일만 읽으면 됩니다. 같은 (레벨, 출처, 메시지) 알림은
//! 쿨다운 동안 한 번만 기록됩니다.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// 알림 레벨.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// 알림 한 건.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub message: String,
    /// 알림을 낸 컴포넌트
    pub source: String,
    pub created_at: DateTime<Utc>,
}

type AlertKey = (AlertLevel, String, String);

/// 알림 관리자.
pub struct AlertManager {
    path: PathBuf,
    cooldown: Duration,
    /// 최근 기록 시각. 파일 쓰기도 이 잠금 아래에서 합니다.
    recent: Mutex<HashMap<AlertKey, Instant>>,
}

impl AlertManager {
    /// 로그 파일 경로와 중복 억제 쿨다운으로 생성합니다.
    pub fn new(path: impl Into<PathBuf>, cooldown: Duration) -> Self {
        Self {
            path: path.into(),
            cooldown,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 알림을 기록합니다. 쿨다운으로 억제되면 `false`.
    pub async fn emit(
        &self,
        level: AlertLevel,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<bool> {
        let alert = Alert {
            level,
            source: source.into(),
            message: message.into(),
            created_at: Utc::now(),
        };
        let key = (alert.level, alert.source.clone(), alert.message.clone());

        let mut recent = self.recent.lock().await;
        let now = Instant::now();
        // 쿨다운이 지난 키는 더 이상 억제하지 않으므로 버립니다.
        recent.retain(|_, last| now.duration_since(*last) < self.cooldown);
        if recent.contains_key(&key) {
            debug!(level = %alert.level, source = %alert.source, "알림 억제 (쿨다운)");
            return Ok(false);
        }

        match alert.level {
            AlertLevel::Info => info!(source = %alert.source, "{}", alert.message),
            AlertLevel::Warning => warn!(source = %alert.source, "{}", alert.message),
            AlertLevel::Error | AlertLevel::Critical => {
                error!(level = %alert.level, source = %alert.source, "{}", alert.message)
            }
        }

        self.append(&alert).await?;
        recent.insert(key, now);
        Ok(true)
    }

    async fn append(&self, alert: &Alert) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_string(alert)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 쿨다운 중인 (레벨, 출처, 메시지) 수.
    pub async fn throttled_keys(&self) -> usize {
        self.recent.lock().await.len()
    }

    /// 기록된 모든 알림. 해석할 수 없는 줄은 건너뜁니다.
    pub async fn read_all(&self) -> Result<Vec<Alert>> {
        let _guard = self.recent.lock().await;
        self.read_unlocked().await
    }

    async fn read_unlocked(&self) -> Result<Vec<Alert>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut alerts = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Alert>(line) {
                Ok(a) => alerts.push(a),
                Err(e) => warn!(line = i + 1, error = %e, "알림 로그 줄 해석 실패"),
            }
        }
        Ok(alerts)
    }

    /// 보존 기간보다 오래된 알림을 지웁니다. 로그를 원자적으로 다시 씁니다.
    pub async fn prune(&self, retention: chrono::Duration) -> Result<usize> {
        let _guard = self.recent.lock().await;

        let alerts = self.read_unlocked().await?;
        let cutoff = Utc::now() - retention;
        let (kept, expired): (Vec<_>, Vec<_>) =
            alerts.into_iter().partition(|a| a.created_at >= cutoff);
        if expired.is_empty() {
            return Ok(0);
        }

        let mut body = String::new();
        for alert in &kept {
            body.push_str(&serde_json::to_string(alert)?);
            body.push('\n');
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, body).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        info!(removed = expired.len(), kept = kept.len(), "알림 로그 정리");
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let alerts = AlertManager::new(dir.path().join("alerts.jsonl"), Duration::ZERO);

        assert!(alerts.emit(AlertLevel::Info, "backfill", "started").await.unwrap());
        assert!(alerts.emit(AlertLevel::Critical, "checkpoint", "corrupt").await.unwrap());

        let all = alerts.read_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].level, AlertLevel::Critical);
        assert_eq!(all[1].source, "checkpoint");

        let raw = std::fs::read_to_string(alerts.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"level\":\"critical\""));
    }

    #[tokio::test]
    async fn test_identical_alerts_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let alerts = AlertManager::new(dir.path().join("alerts.jsonl"), Duration::from_secs(3600));

        assert!(alerts.emit(AlertLevel::Warning, "health", "stale").await.unwrap());
        assert!(!alerts.emit(AlertLevel::Warning, "health", "stale").await.unwrap());
        // 레벨이나 메시지가 다르면 별개 알림
        assert!(alerts.emit(AlertLevel::Error, "health", "stale").await.unwrap());
        assert!(alerts.emit(AlertLevel::Warning, "health", "other").await.unwrap());

        assert_eq!(alerts.read_all().await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cooldown_keys_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let alerts = AlertManager::new(dir.path().join("alerts.jsonl"), Duration::from_secs(60));

        for i in 0..50 {
            let message = format!("flush failed after {} rows", i);
            assert!(alerts.emit(AlertLevel::Error, "stream", message).await.unwrap());
        }
        assert_eq!(alerts.throttled_keys().await, 50);

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(alerts.emit(AlertLevel::Error, "stream", "flush failed after 0 rows").await.unwrap());
        assert_eq!(alerts.throttled_keys().await, 1);
        assert_eq!(alerts.read_all().await.unwrap().len(), 51);
    }

    #[tokio::test]
    async fn test_prune_removes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let old = Alert {
            level: AlertLevel::Info,
            message: "old".into(),
            source: "test".into(),
            created_at: Utc::now() - chrono::Duration::days(40),
        };
        std::fs::write(&path, format!("{}\nnot-json\n", serde_json::to_string(&old).unwrap())).unwrap();

        let alerts = AlertManager::new(&path, Duration::ZERO);
        alerts.emit(AlertLevel::Info, "test", "new").await.unwrap();

        let removed = alerts.prune(chrono::Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = alerts.read_all().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "new");
        assert!(!dir.path().join("alerts.jsonl.tmp").exists());
    }
}
