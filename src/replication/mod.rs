// ABOUTME: Watermark-based incremental replication from SQLite partitions to PostgreSQL
// ABOUTME: Checkpoint store, extractor, backoff and the cycle driver

pub mod backoff;
pub mod checkpoint;
pub mod driver;
pub mod extractor;

pub use backoff::Backoff;
pub use checkpoint::CheckpointStore;
pub use driver::{
    ConnectionHolder, CycleOutcome, CycleReport, DriverConfig, DriverState, ReplicationDriver,
};
pub use extractor::{Extraction, Extractor};
