//! 캔들스틱 데이터를 위한 타임프레임 정의.
//!
//! 직렬화 시에는 거래소 공통 간격 문자열(`1m`, `1h`, `1d` ...)을 사용하므로
//! 체크포인트 파일과 설정 파일에서 그대로 읽고 쓸 수 있습니다.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// 캔들스틱 타임프레임.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Timeframe {
    /// 1분봉
    M1,
    /// 3분봉
    M3,
    /// 5분봉
    M5,
    /// 15분봉
    M15,
    /// 30분봉
    M30,
    /// 1시간봉
    H1,
    /// 2시간봉
    H2,
    /// 4시간봉
    H4,
    /// 6시간봉
    H6,
    /// 8시간봉
    H8,
    /// 12시간봉
    H12,
    /// 일봉
    D1,
    /// 3일봉
    D3,
    /// 주봉
    W1,
    /// 월봉
    MN1,
}

const MINUTE_MS: i64 = 60_000;

impl Timeframe {
    /// 지원하는 모든 타임프레임.
    pub const ALL: [Timeframe; 15] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::D3,
        Timeframe::W1,
        Timeframe::MN1,
    ];

    /// 캔들 하나의 길이(밀리초).
    ///
    /// 월봉은 30일 근사값입니다.
    pub fn duration_ms(&self) -> i64 {
        let minutes = match self {
            Timeframe::M1 => 1,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H2 => 2 * 60,
            Timeframe::H4 => 4 * 60,
            Timeframe::H6 => 6 * 60,
            Timeframe::H8 => 8 * 60,
            Timeframe::H12 => 12 * 60,
            Timeframe::D1 => 24 * 60,
            Timeframe::D3 => 3 * 24 * 60,
            Timeframe::W1 => 7 * 24 * 60,
            Timeframe::MN1 => 30 * 24 * 60,
        };
        minutes * MINUTE_MS
    }

    /// 이 타임프레임의 기간을 반환합니다.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms() as u64)
    }

    /// chrono 기간으로 변환합니다.
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.duration_ms())
    }

    /// 타임스탬프가 캔들 경계에 정렬되어 있는지 확인합니다.
    ///
    /// 일봉 이하만 epoch 기준으로 검사합니다. 3일봉/주봉/월봉은 거래소마다
    /// 기준점이 달라 항상 `true`를 반환합니다.
    pub fn is_aligned(&self, timestamp_ms: i64) -> bool {
        if *self > Timeframe::D1 {
            return true;
        }
        timestamp_ms.rem_euclid(self.duration_ms()) == 0
    }

    /// 간격 문자열로 변환합니다.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::D3 => "3d",
            Timeframe::W1 => "1w",
            Timeframe::MN1 => "1M",
        }
    }

    /// 간격 문자열에서 파싱합니다.
    pub fn from_interval(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tf| tf.as_str() == s)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_interval(s).ok_or_else(|| format!("Invalid timeframe: {}", s))
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

impl TryFrom<String> for Timeframe {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
