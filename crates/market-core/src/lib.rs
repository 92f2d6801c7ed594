//! # Market Core
//!
//! OHLCV 수집 파이프라인 전반에서 공유하는 도메인 타입을 제공합니다.
//!
//! - 타임프레임 및 시계열 키
//! - 원시 캔들(`RawCandle`)과 검증된 캔들(`OhlcvRecord`)
//! - 컴포넌트 에러 카운터 인터페이스
//! - 로깅 인프라

pub mod domain;
pub mod health;
pub mod logging;
pub mod types;

pub use domain::*;
pub use health::*;
pub use logging::*;
pub use types::*;
