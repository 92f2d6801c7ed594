//! 데드레터 재처리.
//!
//! 항목을 다시 검증기에 통과시켜 저장합니다. 저장에 성공한 항목만 지우고,
//! 여전히 실패하는 항목은 사유를 로그로 남긴 채 그대로 둡니다.
//!
//! - `wire_message`: 거래소 커넥터로 원문을 다시 해석
//! - `candle_batch`: `OhlcvRecord` 배열 JSON을 역직렬화

use market_core::{OhlcvRecord, RawCandle};
use market_data::{DeadLetterEntry, DeadLetterKind, DeadLetterSink, StorageManager, Validator};
use market_exchange::ExchangeRegistry;
use tracing::{info, warn};

use crate::stats::ReplayReport;
use crate::Result;

/// 재처리 판정
enum Replayable {
    /// 다시 검증할 행
    Rows(Vec<RawCandle>),
    /// 저장할 캔들이 없는 메시지 (구독 응답, 미확정 캔들 등)
    Nothing,
    /// 아직 처리할 수 없음
    Unusable(String),
}

/// 모든 데드레터 항목을 재처리합니다.
pub async fn replay_dead_letters(
    sink: &DeadLetterSink,
    storage: &StorageManager,
    registry: &ExchangeRegistry,
    validator: Validator,
) -> Result<ReplayReport> {
    let entries = sink.list().await?;
    let mut report = ReplayReport {
        entries: entries.len(),
        ..Default::default()
    };

    for entry in entries {
        let rows = match decode(&entry, registry) {
            Replayable::Rows(rows) => rows,
            Replayable::Nothing => {
                info!(id = %entry.id, "저장할 캔들 없음, 항목 삭제");
                sink.remove(&entry.id).await?;
                report.replayed += 1;
                continue;
            }
            Replayable::Unusable(reason) => {
                warn!(id = %entry.id, reason = %reason, "재처리 불가");
                report.still_failing += 1;
                continue;
            }
        };

        let outcome = validator.validate(&rows);
        if let Some(first) = outcome.rejected.first() {
            warn!(
                id = %entry.id,
                rejected = outcome.rejected.len(),
                reason = %first.reason,
                "재검증 실패"
            );
            report.still_failing += 1;
            continue;
        }

        match storage.insert(&outcome.clean).await {
            Ok(inserted) => {
                sink.remove(&entry.id).await?;
                report.replayed += 1;
                report.rows_inserted += inserted.inserted;
            }
            Err(e) => {
                warn!(id = %entry.id, error = %e, "재처리 저장 실패");
                report.still_failing += 1;
            }
        }
    }

    Ok(report)
}

fn decode(entry: &DeadLetterEntry, registry: &ExchangeRegistry) -> Replayable {
    match entry.kind {
        DeadLetterKind::CandleBatch => {
            match serde_json::from_str::<Vec<OhlcvRecord>>(&entry.raw_payload) {
                Ok(records) => Replayable::Rows(records.iter().map(OhlcvRecord::to_raw).collect()),
                Err(e) => Replayable::Unusable(format!("batch payload: {}", e)),
            }
        }
        DeadLetterKind::WireMessage => {
            let Some(series) = &entry.series else {
                return Replayable::Unusable("wire message without series".to_string());
            };
            let handle = match registry.get(&series.exchange) {
                Ok(h) => h,
                Err(e) => return Replayable::Unusable(e.to_string()),
            };
            match handle
                .source
                .parse_stream_message(&series.symbol, series.timeframe, &entry.raw_payload)
            {
                Ok(Some(candle)) => Replayable::Rows(vec![candle]),
                Ok(None) => Replayable::Nothing,
                Err(e) => Replayable::Unusable(e.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_core::{utc_from_millis, SeriesKey, Timeframe};
    use market_data::StorageConfig;
    use market_exchange::{
        BinanceClient, BinanceConfig, CircuitBreakerConfig, ExchangeHandle, RateLimitConfig,
    };
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn registry() -> ExchangeRegistry {
        let mut registry = ExchangeRegistry::new();
        let client = BinanceClient::new(BinanceConfig::default()).unwrap();
        registry.register(ExchangeHandle::new(
            Arc::new(client),
            RateLimitConfig::default(),
            CircuitBreakerConfig::default(),
        ));
        registry
    }

    #[tokio::test]
    async fn test_replay_batches_and_keeps_failures() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageManager::open(&StorageConfig::in_dir(dir.path())).await.unwrap();
        let sink = DeadLetterSink::open(dir.path().join("dlq")).await.unwrap();
        let key = SeriesKey::new("binance", "BTC/USDT", Timeframe::M1);

        let rows: Vec<OhlcvRecord> = (0..3)
            .map(|i| OhlcvRecord {
                exchange: "binance".into(),
                symbol: "BTC/USDT".into(),
                timeframe: Timeframe::M1,
                timestamp: utc_from_millis(1_704_067_200_000 + i * 60_000).unwrap(),
                open: dec!(42000),
                high: dec!(42010),
                low: dec!(41990),
                close: dec!(42005),
                volume: dec!(1.5),
            })
            .collect();
        sink.record(
            DeadLetterKind::CandleBatch,
            Some(key.clone()),
            serde_json::to_string(&rows).unwrap(),
            "database is locked",
            3,
        )
        .await
        .unwrap();
        sink.record(DeadLetterKind::WireMessage, Some(key.clone()), "{garbage", "parse error", 1)
            .await
            .unwrap();

        let report = replay_dead_letters(&sink, &storage, &registry(), Validator::new())
            .await
            .unwrap();

        assert_eq!(report.entries, 2);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.rows_inserted, 3);
        assert_eq!(report.still_failing, 1);
        assert_eq!(storage.count(&key).await.unwrap(), 3);

        let left = sink.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].raw_payload, "{garbage");
    }
}
