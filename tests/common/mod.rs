#![allow(dead_code)]

pub mod mock_server;

use async_trait::async_trait;
use std::sync::Mutex;
use traceview::{BackendError, BatchPoints, MetricsBackend};

/// Backend that keeps every batch in memory.
#[derive(Default)]
pub struct RecordingBackend {
    pub batches: Mutex<Vec<BatchPoints>>,
}

impl RecordingBackend {
    pub fn hostnames(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|batch| batch.points.iter())
            .map(|point| point.tags.get("hostname").cloned().unwrap_or_default())
            .collect()
    }
}

#[async_trait]
impl MetricsBackend for RecordingBackend {
    async fn write(&self, batch: BatchPoints) -> Result<(), BackendError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}
