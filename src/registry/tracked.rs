//! In-flight deployment record with single-writer persistence

use std::sync::Arc;

use tokio::sync::Mutex;

use super::Registry;
use crate::error::AppResult;
use crate::models::Deployment;

/// A deployment being worked on.
///
/// Concurrent tasks (cluster creation, rule application) mutate the record
/// only through [`TrackedDeployment::update`], which applies the change and
/// flushes the full record to the registry while holding the lock. Updates
/// are therefore serialized and none of them is lost.
#[derive(Clone)]
pub struct TrackedDeployment {
    record: Arc<Mutex<Deployment>>,
    registry: Registry,
}

impl TrackedDeployment {
    pub fn new(record: Deployment, registry: Registry) -> Self {
        Self {
            record: Arc::new(Mutex::new(record)),
            registry,
        }
    }

    /// Apply `f` to the record and persist the result
    pub async fn update<F, R>(&self, f: F) -> AppResult<R>
    where
        F: FnOnce(&mut Deployment) -> R,
    {
        let mut record = self.record.lock().await;
        let result = f(&mut record);
        record.touch();
        self.registry.save(&record).await?;
        Ok(result)
    }

    /// Copy of the current record
    pub async fn snapshot(&self) -> Deployment {
        self.record.lock().await.clone()
    }

    /// Read from the record without persisting anything
    pub async fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Deployment) -> R,
    {
        let record = self.record.lock().await;
        f(&record)
    }
}
