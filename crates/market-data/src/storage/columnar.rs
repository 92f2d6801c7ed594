//! Parquet 컬럼형 아카이브.
//!
//! 레이아웃: `{root}/{exchange}/{symbol}/{timeframe}/year=YYYY/month=MM/data.parquet`
//!
//! - 월 단위 파티션을 통째로 다시 씁니다. 트랜잭션 안에서 조회한 한 달치 행이 원본입니다.
//! - 쓰기는 같은 디렉터리의 숨김 임시 파일에 한 뒤 rename으로 교체합니다.
//! - 임시 파일(`.`으로 시작)은 목록/통계/읽기에서 보이지 않습니다.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{Datelike, TimeZone, Utc};
use market_core::{utc_from_millis, OhlcvRecord, SeriesKey};
use polars::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{DataError, Result};

const PARTITION_FILE: &str = "data.parquet";

/// 아카이브 파티션 (연, 월).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthPartition {
    pub year: i32,
    pub month: u32,
}

impl MonthPartition {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// 레코드 타임스탬프가 속한 파티션.
    pub fn of(record: &OhlcvRecord) -> Self {
        Self::new(record.timestamp.year(), record.timestamp.month())
    }

    /// 파티션의 [시작, 끝) 범위 (Unix 밀리초).
    pub fn bounds_ms(&self) -> Result<(i64, i64)> {
        let (next_year, next_month) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        let start = Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0).single();
        let end = Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0).single();
        match (start, end) {
            (Some(s), Some(e)) => Ok((s.timestamp_millis(), e.timestamp_millis())),
            _ => Err(DataError::InvalidData(format!(
                "invalid partition {}-{:02}",
                self.year, self.month
            ))),
        }
    }
}

/// 아카이브 통계.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub files: u64,
    pub bytes: u64,
}

/// 임시 경로에 써 두고 아직 공개하지 않은 파티션 파일.
#[derive(Debug)]
pub(crate) struct StagedPartition {
    tmp: PathBuf,
    target: PathBuf,
}

impl StagedPartition {
    /// rename으로 공개합니다. 실패하면 임시 파일을 지웁니다.
    ///
    /// rename 뒤 디렉터리 엔트리까지 디스크에 내려야 충돌 후에도 새 파일이 남습니다.
    pub(crate) fn publish(self) -> Result<PathBuf> {
        match fs::rename(&self.tmp, &self.target) {
            Ok(()) => {
                if let Some(dir) = self.target.parent() {
                    if let Err(e) = sync_dir(dir) {
                        warn!(path = %dir.display(), error = %e, "아카이브 디렉터리 fsync 실패");
                    }
                }
                Ok(self.target)
            }
            Err(e) => {
                let _ = fs::remove_file(&self.tmp);
                Err(DataError::ArchiveError(format!(
                    "atomic rename to {} failed: {}",
                    self.target.display(),
                    e
                )))
            }
        }
    }

    /// 공개하지 않고 임시 파일을 지웁니다.
    pub(crate) fn discard(self) {
        if let Err(e) = fs::remove_file(&self.tmp) {
            warn!(path = %self.tmp.display(), error = %e, "임시 아카이브 파일 삭제 실패");
        }
    }
}

/// Parquet 아카이브.
#[derive(Debug, Clone)]
pub struct ColumnarArchive {
    root: PathBuf,
}

impl ColumnarArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 아카이브 루트.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn series_dir(&self, key: &SeriesKey) -> PathBuf {
        self.root
            .join(&key.exchange)
            .join(key.symbol_segment())
            .join(key.timeframe.as_str())
    }

    /// 파티션 파일 경로.
    pub fn partition_path(&self, key: &SeriesKey, partition: MonthPartition) -> PathBuf {
        self.series_dir(key)
            .join(format!("year={:04}", partition.year))
            .join(format!("month={:02}", partition.month))
            .join(PARTITION_FILE)
    }

    /// 한 달치 행을 임시 파일에 씁니다. 실패하면 임시 파일을 남기지 않습니다.
    pub(crate) fn stage(
        &self,
        key: &SeriesKey,
        partition: MonthPartition,
        rows: &[OhlcvRecord],
    ) -> Result<StagedPartition> {
        let target = self.partition_path(key, partition);
        let dir = target
            .parent()
            .ok_or_else(|| DataError::ArchiveError(format!("no parent for {}", target.display())))?;
        fs::create_dir_all(dir).map_err(|e| {
            DataError::ArchiveError(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let tmp = dir.join(format!(".{}.{}.tmp", PARTITION_FILE, Uuid::new_v4()));
        if let Err(e) = write_parquet(rows, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        debug!(path = %target.display(), rows = rows.len(), "아카이브 파티션 준비");
        Ok(StagedPartition { tmp, target })
    }

    /// [`stage`](Self::stage)를 blocking 스레드 풀에서 실행합니다.
    ///
    /// 한 달치 Parquet 재작성은 런타임 worker를 오래 점유하므로 async 쓰기 경로는 이쪽을 씁니다.
    pub(crate) async fn stage_blocking(
        &self,
        key: &SeriesKey,
        partition: MonthPartition,
        rows: Vec<OhlcvRecord>,
    ) -> Result<StagedPartition> {
        let archive = self.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || archive.stage(&key, partition, &rows))
            .await
            .map_err(join_error)?
    }

    /// 준비된 파티션들을 blocking 스레드 풀에서 공개합니다.
    pub(crate) async fn publish_all(staged: Vec<StagedPartition>) -> Result<Vec<Result<PathBuf>>> {
        tokio::task::spawn_blocking(move || {
            staged
                .into_iter()
                .map(StagedPartition::publish)
                .collect::<Vec<_>>()
        })
        .await
        .map_err(join_error)
    }

    /// [`stats`](Self::stats)를 blocking 스레드 풀에서 실행합니다.
    pub async fn stats_blocking(&self) -> Result<ArchiveStats> {
        let archive = self.clone();
        tokio::task::spawn_blocking(move || archive.stats())
            .await
            .map_err(join_error)?
    }

    /// 파티션 하나를 읽습니다. 파일이 없으면 빈 벡터.
    pub fn read_partition(
        &self,
        key: &SeriesKey,
        partition: MonthPartition,
    ) -> Result<Vec<OhlcvRecord>> {
        let path = self.partition_path(key, partition);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_parquet(&path)
    }

    /// 시계열의 공개된 파티션 목록 (오름차순).
    pub fn list_partitions(&self, key: &SeriesKey) -> Result<Vec<MonthPartition>> {
        let series_dir = self.series_dir(key);
        if !series_dir.exists() {
            return Ok(Vec::new());
        }

        let mut partitions = Vec::new();
        for year_entry in fs::read_dir(&series_dir)? {
            let year_path = year_entry?.path();
            let Some(year) = parse_segment::<i32>(&year_path, "year=") else {
                continue;
            };
            for month_entry in fs::read_dir(&year_path)? {
                let month_path = month_entry?.path();
                let Some(month) = parse_segment::<u32>(&month_path, "month=") else {
                    continue;
                };
                if month_path.join(PARTITION_FILE).is_file() {
                    partitions.push(MonthPartition::new(year, month));
                }
            }
        }

        partitions.sort();
        Ok(partitions)
    }

    /// 공개된 파티션 파일 수와 전체 크기.
    pub fn stats(&self) -> Result<ArchiveStats> {
        let mut stats = ArchiveStats::default();
        if self.root.exists() {
            collect_stats(&self.root, &mut stats)?;
        }
        Ok(stats)
    }
}

fn join_error(e: tokio::task::JoinError) -> DataError {
    DataError::ArchiveError(format!("archive task failed: {}", e))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

// 디렉터리 핸들을 열 수 없는 플랫폼에서는 rename만 보장합니다.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn parse_segment<T: FromStr>(path: &Path, prefix: &str) -> Option<T> {
    if !path.is_dir() {
        return None;
    }
    path.file_name()?
        .to_str()?
        .strip_prefix(prefix)?
        .parse()
        .ok()
}

fn collect_stats(dir: &Path, stats: &mut ArchiveStats) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_stats(&path, stats)?;
        } else if entry.file_name() == PARTITION_FILE {
            stats.files += 1;
            stats.bytes += entry.metadata()?.len();
        }
    }
    Ok(())
}

// ── Parquet I/O ─────────────────────────────────────────────────────

/// 가격은 Decimal 정밀도를 유지하도록 문자열 컬럼으로 저장합니다.
fn records_to_dataframe(rows: &[OhlcvRecord]) -> Result<DataFrame> {
    let mut exchange = Vec::with_capacity(rows.len());
    let mut symbol = Vec::with_capacity(rows.len());
    let mut timeframe = Vec::with_capacity(rows.len());
    let mut timestamp = Vec::with_capacity(rows.len());
    let mut open = Vec::with_capacity(rows.len());
    let mut high = Vec::with_capacity(rows.len());
    let mut low = Vec::with_capacity(rows.len());
    let mut close = Vec::with_capacity(rows.len());
    let mut volume = Vec::with_capacity(rows.len());

    for r in rows {
        exchange.push(r.exchange.clone());
        symbol.push(r.symbol.clone());
        timeframe.push(r.timeframe.as_str().to_string());
        timestamp.push(r.timestamp_ms());
        open.push(r.open.to_string());
        high.push(r.high.to_string());
        low.push(r.low.to_string());
        close.push(r.close.to_string());
        volume.push(r.volume.to_string());
    }

    let df = DataFrame::new(vec![
        Column::new("exchange".into(), exchange),
        Column::new("symbol".into(), symbol),
        Column::new("timeframe".into(), timeframe),
        Column::new("timestamp_ms".into(), timestamp),
        Column::new("open".into(), open),
        Column::new("high".into(), high),
        Column::new("low".into(), low),
        Column::new("close".into(), close),
        Column::new("volume".into(), volume),
    ])?;
    Ok(df)
}

fn write_parquet(rows: &[OhlcvRecord], path: &Path) -> Result<()> {
    let mut df = records_to_dataframe(rows)?;
    let mut file = fs::File::create(path).map_err(|e| {
        DataError::ArchiveError(format!("create {} failed: {}", path.display(), e))
    })?;
    ParquetWriter::new(&mut file).finish(&mut df)?;
    // rename 전에 내용이 디스크에 있어야 공개된 파일이 잘리지 않습니다.
    file.sync_all().map_err(|e| {
        DataError::ArchiveError(format!("fsync {} failed: {}", path.display(), e))
    })?;
    Ok(())
}

fn read_parquet(path: &Path) -> Result<Vec<OhlcvRecord>> {
    let file = fs::File::open(path)?;
    let df = ParquetReader::new(file).finish()?;

    let exchange = df.column("exchange")?.str()?;
    let symbol = df.column("symbol")?.str()?;
    let timeframe = df.column("timeframe")?.str()?;
    let timestamp = df.column("timestamp_ms")?.i64()?;
    let open = df.column("open")?.str()?;
    let high = df.column("high")?.str()?;
    let low = df.column("low")?.str()?;
    let close = df.column("close")?.str()?;
    let volume = df.column("volume")?.str()?;

    let null = |col: &str, i: usize| DataError::ArchiveError(format!("null {} at row {}", col, i));
    let dec = |s: Option<&str>, col: &str, i: usize| -> Result<Decimal> {
        let s = s.ok_or_else(|| null(col, i))?;
        Decimal::from_str(s).map_err(|e| DataError::ParseError(format!("{} at row {}: {}", col, i, e)))
    };

    let mut records = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let ts = timestamp.get(i).ok_or_else(|| null("timestamp_ms", i))?;
        let tf = timeframe.get(i).ok_or_else(|| null("timeframe", i))?;
        records.push(OhlcvRecord {
            exchange: exchange.get(i).ok_or_else(|| null("exchange", i))?.to_string(),
            symbol: symbol.get(i).ok_or_else(|| null("symbol", i))?.to_string(),
            timeframe: tf.parse().map_err(DataError::ParseError)?,
            timestamp: utc_from_millis(ts)
                .ok_or_else(|| DataError::ParseError(format!("timestamp {} at row {}", ts, i)))?,
            open: dec(open.get(i), "open", i)?,
            high: dec(high.get(i), "high", i)?,
            low: dec(low.get(i), "low", i)?,
            close: dec(close.get(i), "close", i)?,
            volume: dec(volume.get(i), "volume", i)?,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::Timeframe;
    use rust_decimal_macros::dec;

    fn record(ts: i64) -> OhlcvRecord {
        OhlcvRecord {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timeframe: Timeframe::H1,
            timestamp: utc_from_millis(ts).unwrap(),
            open: dec!(100.5),
            high: dec!(101.25),
            low: dec!(99.125),
            close: dec!(100),
            volume: dec!(3.5),
        }
    }

    #[test]
    fn test_partition_bounds() {
        let (start, end) = MonthPartition::new(2024, 12).bounds_ms().unwrap();
        assert_eq!(start, 1_733_011_200_000); // 2024-12-01
        assert_eq!(end, 1_735_689_600_000); // 2025-01-01
        assert!(MonthPartition::new(2024, 13).bounds_ms().is_err());
    }

    #[test]
    fn test_stage_publish_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ColumnarArchive::new(dir.path());
        let key = SeriesKey::new("binance", "BTC/USDT", Timeframe::H1);
        let rows = vec![record(1_704_067_200_000), record(1_704_070_800_000)];
        let partition = MonthPartition::of(&rows[0]);

        let staged = archive.stage(&key, partition, &rows).unwrap();
        // 공개 전에는 보이지 않음
        assert!(archive.list_partitions(&key).unwrap().is_empty());
        assert_eq!(archive.stats().unwrap().files, 0);

        let path = staged.publish().unwrap();
        assert!(path.ends_with("binance/BTC-USDT/1h/year=2024/month=01/data.parquet"));
        assert_eq!(archive.list_partitions(&key).unwrap(), vec![partition]);
        assert_eq!(archive.read_partition(&key, partition).unwrap(), rows);

        let stats = archive.stats().unwrap();
        assert_eq!(stats.files, 1);
        assert!(stats.bytes > 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_blocking_stage_and_publish_leave_only_partition_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ColumnarArchive::new(dir.path());
        let key = SeriesKey::new("binance", "BTC/USDT", Timeframe::H1);
        let rows = vec![record(1_704_067_200_000), record(1_704_070_800_000)];
        let partition = MonthPartition::of(&rows[0]);

        let staged = archive
            .stage_blocking(&key, partition, rows.clone())
            .await
            .unwrap();
        let published = ColumnarArchive::publish_all(vec![staged]).await.unwrap();
        assert_eq!(published.len(), 1);
        let path = published.into_iter().next().unwrap().unwrap();

        let month_dir = path.parent().unwrap();
        let names: Vec<String> = fs::read_dir(month_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![PARTITION_FILE.to_string()]);
        assert_eq!(archive.read_partition(&key, partition).unwrap(), rows);
        assert_eq!(archive.stats_blocking().await.unwrap().files, 1);
    }

    #[test]
    fn test_discard_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ColumnarArchive::new(dir.path());
        let key = SeriesKey::new("binance", "BTC/USDT", Timeframe::H1);
        let rows = vec![record(1_704_067_200_000)];
        let partition = MonthPartition::of(&rows[0]);

        archive.stage(&key, partition, &rows).unwrap().discard();

        let month_dir = archive.partition_path(&key, partition);
        let entries: Vec<_> = fs::read_dir(month_dir.parent().unwrap()).unwrap().collect();
        assert!(entries.is_empty());
        assert!(archive.read_partition(&key, partition).unwrap().is_empty());
    }
}
