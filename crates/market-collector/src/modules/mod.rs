//! 수집 작업 모듈.

pub mod backfill;
pub mod checkpoint;
pub mod live_ingest;
pub mod replay;
pub mod stream_buffer;

pub use backfill::{BackfillJob, BackfillRequest};
pub use checkpoint::{BackfillCheckpoint, CheckpointStatus, CheckpointStore};
pub use live_ingest::LiveIngest;
pub use replay::replay_dead_letters;
pub use stream_buffer::{FlushOutcome, StreamBuffer, StreamBufferConfig};
