//! 거래소 capability trait 정의.
//!
//! 거래소별 구현은 "한 페이지 조회", "원시 스트림 연결", "메시지 해석"만 담당합니다.
//! 페이지 분할, 재시도, Rate limit, Circuit Breaker는 `HistoricalFetcher`와
//! `LiveCandleStream`에서 모든 거래소에 공통으로 적용됩니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use market_core::{RawCandle, Timeframe};

use crate::{ExchangeError, ExchangeResult};

/// 원시 텍스트 메시지 스트림.
pub type RawMessageStream = BoxStream<'static, ExchangeResult<String>>;

/// 거래소 캔들 데이터 소스.
#[async_trait]
pub trait CandleSource: Send + Sync {
    /// 거래소 ID (예: "binance").
    fn exchange_id(&self) -> &str;

    /// REST 요청 한 번에 받을 수 있는 최대 캔들 수.
    fn max_candles_per_request(&self) -> u32;

    /// 지원하는 타임프레임인지 확인.
    fn supports_timeframe(&self, _timeframe: Timeframe) -> bool {
        true
    }

    /// `since`부터 최대 `limit`개의 캔들을 조회합니다.
    ///
    /// 응답의 오른쪽 경계는 거래소가 보장하지 않으므로 호출자가 잘라야 합니다.
    async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: DateTime<Utc>,
        limit: u32,
    ) -> ExchangeResult<Vec<RawCandle>>;

    /// 캔들 스트림에 연결해 원시 텍스트 메시지를 흘려보냅니다.
    async fn connect_stream(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> ExchangeResult<RawMessageStream> {
        let _ = (symbol, timeframe);
        Err(ExchangeError::NotSupported(format!(
            "{} does not provide a candle stream",
            self.exchange_id()
        )))
    }

    /// 스트림 메시지 하나를 해석합니다.
    ///
    /// - `Ok(Some(_))`: 확정된 캔들
    /// - `Ok(None)`: 무시할 메시지 (구독 응답, 미확정 캔들 등)
    /// - `Err(_)`: 형태가 잘못된 메시지
    fn parse_stream_message(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        text: &str,
    ) -> ExchangeResult<Option<RawCandle>> {
        let _ = (symbol, timeframe, text);
        Err(ExchangeError::NotSupported(format!(
            "{} does not provide a candle stream",
            self.exchange_id()
        )))
    }
}
