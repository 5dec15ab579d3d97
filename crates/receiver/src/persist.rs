//! Storage port for soil records and the post-session flush.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::record::{SoilReading, StoredSoilRecord};

/// Storage collaborator for completed sessions.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist one reading as a new record at the head of the collection.
    async fn save_record(&self, reading: &SoilReading) -> Result<StoredSoilRecord>;

    /// All records, newest first.
    async fn list_records(&self) -> Result<Vec<StoredSoilRecord>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub saved: usize,
    pub failed: usize,
}

/// Save each reading independently.  A failed write is logged and the
/// remaining readings are still attempted.
pub async fn flush(store: &dyn RecordStore, readings: &[SoilReading]) -> FlushReport {
    let mut report = FlushReport::default();
    for reading in readings {
        match store.save_record(reading).await {
            Ok(rec) => {
                report.saved += 1;
                tracing::debug!(id = %rec.id, timestamp = %reading.timestamp, "record saved");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(timestamp = %reading.timestamp, "failed to save record: {e:#}");
            }
        }
    }
    tracing::info!(saved = report.saved, failed = report.failed, "session flushed");
    report
}

// ===========================================================================
// Tests
// ===========================================================================
