//! 캔들 도메인 모델.

mod candle;

pub use candle::*;
