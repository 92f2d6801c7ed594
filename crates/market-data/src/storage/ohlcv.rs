//! OHLCV 트랜잭션 저장소.
//!
//! 영속 데이터를 변경하는 유일한 경로입니다.
//!
//! # insert 동작 방식
//!
//! 1. 배치 내 자연키 중복 제거 (첫 번째 행 유지)
//! 2. 쓰기 잠금 획득
//! 3. 트랜잭션 시작
//! 4. `ON CONFLICT DO NOTHING`으로 삽입 (이미 저장된 키는 건너뜀)
//! 5. 같은 트랜잭션에서 시계열별 품질 메타데이터 갱신
//! 6. 변경된 월 파티션을 아카이브 임시 파일로 준비
//! 7. 커밋 후 임시 파일을 rename으로 공개
//!
//! 어느 단계에서든 실패하면 트랜잭션을 롤백하고 임시 파일을 지웁니다.
//! 읽기는 읽기 잠금을 잡으므로 서로 동시에 진행되고 쓰기와만 직렬화됩니다.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use market_core::{utc_from_millis, ErrorSource, OhlcvRecord, SeriesKey, Timeframe};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use super::columnar::{ArchiveStats, ColumnarArchive, MonthPartition, StagedPartition};
use super::StorageConfig;
use crate::error::{DataError, Result};

/// 한 INSERT 문에 묶는 행 수. 행당 바인딩 10개, SQLite 기본 상한 999.
const INSERT_CHUNK: usize = 90;

const SELECT_COLUMNS: &str =
    "SELECT exchange, symbol, timeframe, ts, open, high, low, close, volume FROM ohlcv_raw";

// =============================================================================
// 레코드 / 보고서 타입
// =============================================================================

#[derive(Debug, FromRow)]
struct OhlcvRow {
    exchange: String,
    symbol: String,
    timeframe: String,
    ts: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
}

impl OhlcvRow {
    fn into_record(self) -> Result<OhlcvRecord> {
        Ok(OhlcvRecord {
            timeframe: parse_timeframe(&self.timeframe)?,
            timestamp: parse_millis(self.ts)?,
            open: parse_decimal(&self.open)?,
            high: parse_decimal(&self.high)?,
            low: parse_decimal(&self.low)?,
            close: parse_decimal(&self.close)?,
            volume: parse_decimal(&self.volume)?,
            exchange: self.exchange,
            symbol: self.symbol,
        })
    }
}

#[derive(Debug, FromRow)]
struct MetadataRow {
    exchange: String,
    symbol: String,
    timeframe: String,
    first_ts: i64,
    last_ts: i64,
    total_records: i64,
    last_validated_at: i64,
}

impl MetadataRow {
    fn into_metadata(self) -> Result<DataQualityMetadata> {
        Ok(DataQualityMetadata {
            timeframe: parse_timeframe(&self.timeframe)?,
            first_timestamp: parse_millis(self.first_ts)?,
            last_timestamp: parse_millis(self.last_ts)?,
            total_records: self.total_records.max(0) as u64,
            last_validated_at: parse_millis(self.last_validated_at)?,
            exchange: self.exchange,
            symbol: self.symbol,
        })
    }
}

/// 시계열별 품질 메타데이터.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQualityMetadata {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// 가장 오래된 캔들
    pub first_timestamp: DateTime<Utc>,
    /// 가장 최근 캔들
    pub last_timestamp: DateTime<Utc>,
    /// 저장된 행 수
    pub total_records: u64,
    /// 마지막으로 검증된 배치가 커밋된 시각
    pub last_validated_at: DateTime<Utc>,
}

impl DataQualityMetadata {
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.timeframe)
    }
}

/// insert 결과.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertReport {
    /// 입력 행 수
    pub received: usize,
    /// 배치 안에서 제거된 중복
    pub batch_duplicates: usize,
    /// 이미 저장되어 있어 건너뛴 행
    pub existing_duplicates: usize,
    /// 새로 저장된 행
    pub inserted: usize,
    /// 영향받은 시계열 수
    pub series: usize,
    /// 공개된 아카이브 파티션 수
    pub archived_partitions: usize,
}

impl InsertReport {
    /// 제거된 중복의 합.
    pub fn duplicates(&self) -> usize {
        self.batch_duplicates + self.existing_duplicates
    }
}

/// 연속 캔들 사이의 빈 구간.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    /// 빈 구간 직전 캔들
    pub after: DateTime<Utc>,
    /// 빈 구간 직후 캔들
    pub before: DateTime<Utc>,
    /// 누락된 캔들 수
    pub missing_candles: i64,
}

/// 시계열 무결성 점검 결과.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub series: SeriesKey,
    pub total_records: u64,
    pub invalid_ohlc: u64,
    pub duplicates: u64,
    pub gaps: Vec<Gap>,
    pub checked_at: DateTime<Utc>,
}

impl IntegrityReport {
    /// 발견된 문제 수.
    pub fn issue_count(&self) -> u64 {
        self.invalid_ohlc + self.duplicates + self.gaps.len() as u64
    }

    pub fn is_clean(&self) -> bool {
        self.issue_count() == 0
    }
}

/// 저장소 전체 통계.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStats {
    pub series: u64,
    pub total_records: u64,
    /// 데이터베이스 + WAL 파일 크기
    pub database_bytes: u64,
    pub archive: Option<ArchiveStats>,
}

// =============================================================================
// StorageManager
// =============================================================================

/// 단일 쓰기 게이트웨이.
pub struct StorageManager {
    pool: SqlitePool,
    database_path: PathBuf,
    archive: Option<ColumnarArchive>,
    lock: RwLock<()>,
    errors: AtomicU64,
}

impl StorageManager {
    /// 데이터베이스를 열고 마이그레이션을 적용합니다.
    #[instrument(skip(config), fields(path = %config.database_path.display()))]
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        if let Some(parent) = config.database_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| DataError::ConnectionError(e.to_string()))?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| DataError::MigrationError(e.to_string()))?;

        let archive = config
            .archive_enabled
            .then(|| ColumnarArchive::new(&config.archive_dir));

        info!(
            archive = ?archive.as_ref().map(|a| a.root().display().to_string()),
            "저장소 열림"
        );

        Ok(Self {
            pool,
            database_path: config.database_path.clone(),
            archive,
            lock: RwLock::new(()),
            errors: AtomicU64::new(0),
        })
    }

    /// 아카이브 (비활성화면 `None`).
    pub fn archive(&self) -> Option<&ColumnarArchive> {
        self.archive.as_ref()
    }

    /// 연결 풀을 닫습니다.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// 검증된 행을 하나의 트랜잭션으로 저장합니다.
    ///
    /// 실패하면 아무 행도 보이지 않고 아카이브 임시 파일도 남지 않습니다.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn insert(&self, rows: &[OhlcvRecord]) -> Result<InsertReport> {
        let mut report = InsertReport {
            received: rows.len(),
            ..Default::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }

        let unique = dedup_batch(rows);
        report.batch_duplicates = rows.len() - unique.len();
        if report.batch_duplicates > 0 {
            info!(removed = report.batch_duplicates, "배치 내 중복 제거");
        }

        let series = group_by_series(&unique);
        report.series = series.len();

        let _guard = self.lock.write().await;
        match self.write_locked(&series, &mut report).await {
            Ok(()) => {
                report.existing_duplicates = unique.len() - report.inserted;
                if report.existing_duplicates > 0 {
                    info!(removed = report.existing_duplicates, "기존 행과 중복 제거");
                }
                debug!(inserted = report.inserted, series = report.series, "배치 커밋");
                Ok(report)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, rows = unique.len(), "배치 저장 실패, 롤백");
                Err(e)
            }
        }
    }

    async fn write_locked(
        &self,
        series: &BTreeMap<SeriesKey, Vec<&OhlcvRecord>>,
        report: &mut InsertReport,
    ) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut changed = Vec::new();

        for (key, rows) in series {
            let inserted = insert_rows(&mut tx, rows, now_ms).await?;
            upsert_metadata(&mut tx, key, rows, inserted, now_ms).await?;
            report.inserted += inserted as usize;
            if inserted > 0 {
                changed.push((key, rows));
            }
        }

        let mut staged = Vec::new();
        if let Some(archive) = &self.archive {
            if let Err(e) = stage_archive(archive, &mut tx, &changed, &mut staged).await {
                staged.into_iter().for_each(StagedPartition::discard);
                return Err(e);
            }
        }

        if let Err(e) = tx.commit().await {
            staged.into_iter().for_each(StagedPartition::discard);
            return Err(e.into());
        }

        // 데이터는 이미 커밋됨. 아카이브는 다음 쓰기에서 다시 만들어집니다.
        if staged.is_empty() {
            return Ok(());
        }
        let published = match ColumnarArchive::publish_all(staged).await {
            Ok(results) => results,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "아카이브 파티션 공개 실패");
                return Ok(());
            }
        };
        for result in published {
            match result {
                Ok(_) => report.archived_partitions += 1,
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "아카이브 파티션 공개 실패");
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // 조회
    // =========================================================================

    /// [start, end] 구간 캔들을 시간순으로 조회합니다.
    #[instrument(skip(self))]
    pub async fn query_range(
        &self,
        key: &SeriesKey,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<OhlcvRecord>> {
        let _guard = self.lock.read().await;

        let rows: Vec<OhlcvRow> = sqlx::query_as(&format!(
            "{} WHERE exchange = ? AND symbol = ? AND timeframe = ? AND ts >= ? AND ts <= ? ORDER BY ts ASC",
            SELECT_COLUMNS
        ))
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.timeframe.as_str())
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(OhlcvRow::into_record).collect()
    }

    /// 가장 최근 캔들 시각.
    pub async fn latest_timestamp(&self, key: &SeriesKey) -> Result<Option<DateTime<Utc>>> {
        let _guard = self.lock.read().await;

        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(ts) FROM ohlcv_raw WHERE exchange = ? AND symbol = ? AND timeframe = ?",
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.timeframe.as_str())
        .fetch_one(&self.pool)
        .await?;

        latest.map(parse_millis).transpose()
    }

    /// 시계열 행 수.
    pub async fn count(&self, key: &SeriesKey) -> Result<u64> {
        let _guard = self.lock.read().await;
        self.count_unlocked(key).await
    }

    async fn count_unlocked(&self, key: &SeriesKey) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM ohlcv_raw WHERE exchange = ? AND symbol = ? AND timeframe = ?",
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.timeframe.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// 시계열 품질 메타데이터.
    pub async fn get_metadata(&self, key: &SeriesKey) -> Result<Option<DataQualityMetadata>> {
        let _guard = self.lock.read().await;

        let row: Option<MetadataRow> = sqlx::query_as(
            r#"
            SELECT exchange, symbol, timeframe, first_ts, last_ts, total_records, last_validated_at
            FROM data_quality_metadata
            WHERE exchange = ? AND symbol = ? AND timeframe = ?
            "#,
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.timeframe.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MetadataRow::into_metadata).transpose()
    }

    /// 모든 시계열의 메타데이터.
    pub async fn list_metadata(&self) -> Result<Vec<DataQualityMetadata>> {
        let _guard = self.lock.read().await;

        let rows: Vec<MetadataRow> = sqlx::query_as(
            r#"
            SELECT exchange, symbol, timeframe, first_ts, last_ts, total_records, last_validated_at
            FROM data_quality_metadata
            ORDER BY exchange, symbol, timeframe
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MetadataRow::into_metadata).collect()
    }

    // =========================================================================
    // 품질 점검
    // =========================================================================

    /// 연속 캔들 간격이 타임프레임의 1.5배를 넘는 구간.
    #[instrument(skip(self))]
    pub async fn detect_gaps(&self, key: &SeriesKey) -> Result<Vec<Gap>> {
        let _guard = self.lock.read().await;
        self.detect_gaps_unlocked(key).await
    }

    async fn detect_gaps_unlocked(&self, key: &SeriesKey) -> Result<Vec<Gap>> {
        let tf_ms = key.timeframe.duration_ms();

        let pairs: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT ts, next_ts FROM (
                SELECT ts, LEAD(ts) OVER (ORDER BY ts) AS next_ts
                FROM ohlcv_raw
                WHERE exchange = ? AND symbol = ? AND timeframe = ?
            )
            WHERE next_ts IS NOT NULL AND (next_ts - ts) * 2 > ? * 3
            ORDER BY ts
            "#,
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.timeframe.as_str())
        .bind(tf_ms)
        .fetch_all(&self.pool)
        .await?;

        let gaps = pairs
            .into_iter()
            .map(|(ts, next)| {
                Ok(Gap {
                    after: parse_millis(ts)?,
                    before: parse_millis(next)?,
                    missing_candles: (next - ts) / tf_ms - 1,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(series = %key, gaps = gaps.len(), "갭 탐지");
        Ok(gaps)
    }

    /// OHLC 관계, 중복, 갭을 점검합니다.
    #[instrument(skip(self))]
    pub async fn integrity_report(&self, key: &SeriesKey) -> Result<IntegrityReport> {
        let _guard = self.lock.read().await;

        let (total, invalid, distinct): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN
                    CAST(high AS REAL) < CAST(low AS REAL)
                    OR CAST(high AS REAL) < CAST(open AS REAL)
                    OR CAST(high AS REAL) < CAST(close AS REAL)
                    OR CAST(low AS REAL) > CAST(open AS REAL)
                    OR CAST(low AS REAL) > CAST(close AS REAL)
                    OR CAST(volume AS REAL) < 0
                THEN 1 ELSE 0 END), 0),
                COUNT(DISTINCT ts)
            FROM ohlcv_raw
            WHERE exchange = ? AND symbol = ? AND timeframe = ?
            "#,
        )
        .bind(&key.exchange)
        .bind(&key.symbol)
        .bind(key.timeframe.as_str())
        .fetch_one(&self.pool)
        .await?;

        let gaps = self.detect_gaps_unlocked(key).await?;

        Ok(IntegrityReport {
            series: key.clone(),
            total_records: total.max(0) as u64,
            invalid_ohlc: invalid.max(0) as u64,
            duplicates: (total - distinct).max(0) as u64,
            gaps,
            checked_at: Utc::now(),
        })
    }

    /// 저장소 전체 통계.
    pub async fn storage_stats(&self) -> Result<StorageStats> {
        let _guard = self.lock.read().await;

        let (series, total): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(total_records), 0) FROM data_quality_metadata",
        )
        .fetch_one(&self.pool)
        .await?;

        let mut database_bytes = 0;
        for suffix in ["", "-wal"] {
            let mut path = self.database_path.clone().into_os_string();
            path.push(suffix);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                database_bytes += meta.len();
            }
        }

        let archive = match &self.archive {
            Some(a) => Some(a.stats_blocking().await?),
            None => None,
        };

        Ok(StorageStats {
            series: series.max(0) as u64,
            total_records: total.max(0) as u64,
            database_bytes,
            archive,
        })
    }
}

impl ErrorSource for StorageManager {
    fn component(&self) -> String {
        "storage".to_string()
    }

    fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

// =============================================================================
// 헬퍼 함수
// =============================================================================

/// 자연키 기준 배치 내 중복 제거. 첫 번째 행을 유지합니다.
fn dedup_batch(rows: &[OhlcvRecord]) -> Vec<&OhlcvRecord> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.iter()
        .filter(|r| {
            seen.insert((
                r.exchange.as_str(),
                r.symbol.as_str(),
                r.timeframe,
                r.timestamp_ms(),
            ))
        })
        .collect()
}

fn group_by_series<'a>(rows: &[&'a OhlcvRecord]) -> BTreeMap<SeriesKey, Vec<&'a OhlcvRecord>> {
    let mut series: BTreeMap<SeriesKey, Vec<&OhlcvRecord>> = BTreeMap::new();
    for row in rows {
        series.entry(row.series_key()).or_default().push(row);
    }
    series
}

async fn insert_rows(
    tx: &mut Transaction<'static, Sqlite>,
    rows: &[&OhlcvRecord],
    now_ms: i64,
) -> Result<u64> {
    let mut inserted = 0;

    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "INSERT INTO ohlcv_raw (exchange, symbol, timeframe, ts, open, high, low, close, volume, ingested_at) ",
        );
        qb.push_values(chunk, |mut b, r| {
            b.push_bind(r.exchange.clone())
                .push_bind(r.symbol.clone())
                .push_bind(r.timeframe.as_str())
                .push_bind(r.timestamp_ms())
                .push_bind(r.open.to_string())
                .push_bind(r.high.to_string())
                .push_bind(r.low.to_string())
                .push_bind(r.close.to_string())
                .push_bind(r.volume.to_string())
                .push_bind(now_ms);
        });
        qb.push(" ON CONFLICT (exchange, symbol, timeframe, ts) DO NOTHING");

        inserted += qb.build().execute(&mut **tx).await?.rows_affected();
    }

    Ok(inserted)
}

async fn upsert_metadata(
    tx: &mut Transaction<'static, Sqlite>,
    key: &SeriesKey,
    rows: &[&OhlcvRecord],
    inserted: u64,
    now_ms: i64,
) -> Result<()> {
    let first = rows.iter().map(|r| r.timestamp_ms()).min();
    let last = rows.iter().map(|r| r.timestamp_ms()).max();
    let (Some(first), Some(last)) = (first, last) else {
        return Ok(());
    };

    sqlx::query(
        r#"
        INSERT INTO data_quality_metadata
            (exchange, symbol, timeframe, first_ts, last_ts, total_records, last_validated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (exchange, symbol, timeframe) DO UPDATE SET
            first_ts = MIN(first_ts, excluded.first_ts),
            last_ts = MAX(last_ts, excluded.last_ts),
            total_records = total_records + excluded.total_records,
            last_validated_at = excluded.last_validated_at
        "#,
    )
    .bind(&key.exchange)
    .bind(&key.symbol)
    .bind(key.timeframe.as_str())
    .bind(first)
    .bind(last)
    .bind(inserted as i64)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// 변경된 월 파티션을 트랜잭션 시점의 내용으로 임시 파일에 씁니다.
async fn stage_archive(
    archive: &ColumnarArchive,
    tx: &mut Transaction<'static, Sqlite>,
    changed: &[(&SeriesKey, &Vec<&OhlcvRecord>)],
    staged: &mut Vec<StagedPartition>,
) -> Result<()> {
    for (key, rows) in changed {
        let months: BTreeSet<MonthPartition> = rows.iter().map(|r| MonthPartition::of(r)).collect();

        for month in months {
            let (start, end) = month.bounds_ms()?;
            let month_rows: Vec<OhlcvRow> = sqlx::query_as(&format!(
                "{} WHERE exchange = ? AND symbol = ? AND timeframe = ? AND ts >= ? AND ts < ? ORDER BY ts ASC",
                SELECT_COLUMNS
            ))
            .bind(&key.exchange)
            .bind(&key.symbol)
            .bind(key.timeframe.as_str())
            .bind(start)
            .bind(end)
            .fetch_all(&mut **tx)
            .await?;

            let records = month_rows
                .into_iter()
                .map(OhlcvRow::into_record)
                .collect::<Result<Vec<_>>>()?;
            staged.push(archive.stage_blocking(key, month, records).await?);
        }
    }
    Ok(())
}

fn parse_timeframe(s: &str) -> Result<Timeframe> {
    s.parse().map_err(DataError::ParseError)
}

fn parse_millis(ts: i64) -> Result<DateTime<Utc>> {
    utc_from_millis(ts).ok_or_else(|| DataError::ParseError(format!("timestamp out of range: {}", ts)))
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|e| DataError::ParseError(format!("decimal '{}': {}", s, e)))
}
