//! Bounded transform dispatch onto the blocking thread pool.

use crate::error::{EngineError, EngineResult};
use crate::transform::{TransformOutput, transform};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct TransformPool {
    permits: Arc<Semaphore>,
}

impl TransformPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Transforms currently allowed to start
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn transform(&self, source: Bytes) -> EngineResult<TransformOutput> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::internal("transform pool closed"))?;

        tokio::task::spawn_blocking(move || transform(&source))
            .await
            .map_err(|e| EngineError::internal(format!("transform task failed: {}", e)))?
    }
}

impl Default for TransformPool {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}
