//! Push channel for committed ingest events.
//!
//! Downstream consumers (AI analysis and the like) either subscribe here or
//! poll the ingest log through [crate::MetadataIndex::list_events].

use tokio::sync::broadcast;

use crate::metadata_index::IngestEventRow;

#[derive(Clone)]
pub struct IngestNotifier {
    tx: broadcast::Sender<IngestEventRow>,
}

impl IngestNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEventRow> {
        self.tx.subscribe()
    }

    /// Publish a committed event. Having no subscribers is not an error.
    pub fn publish(&self, row: IngestEventRow) {
        let _ = self.tx.send(row);
    }
}

impl Default for IngestNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}
