pub mod encoder;
pub mod log;
pub mod wire;

pub use encoder::{encode_flush, encode_snapshot};
pub use log::DeltaLog;
pub use wire::{DeltaMsg, EventMsg, Seq, SNAPSHOT_SEQ};
