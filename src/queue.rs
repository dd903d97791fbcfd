//! Per-partition admission control.
//!
//! Control planes throttle mutations per account/region/datacenter. Each
//! partition gets a lane: a fair semaphore whose permits bound how many
//! provisioning tasks run against it at once. Waiters are admitted FIFO.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tracing::debug;

use crate::resources::Partition;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// Cancelled before a slot freed up. The task never ran.
    #[error("submission to partition {partition} cancelled while queued")]
    Cancelled { partition: Partition },

    #[error("queue for partition {partition} is closed")]
    Closed { partition: Partition },
}

pub struct ProvisioningQueue {
    default_limit: usize,
    limits: HashMap<Partition, usize>,
    lanes: Mutex<Lanes>,
}

/// The closed flag lives under the same lock as the lanes, so no lane is
/// created after `close()` has swept them.
#[derive(Default)]
struct Lanes {
    closed: bool,
    by_partition: HashMap<Partition, Arc<Semaphore>>,
}

impl ProvisioningQueue {
    /// `default_limit` applies to every partition without its own limit. Zero is treated as one.
    pub fn new(default_limit: usize) -> Self {
        Self {
            default_limit: default_limit.max(1),
            limits: HashMap::new(),
            lanes: Mutex::new(Lanes::default()),
        }
    }

    pub fn with_partition_limit(mut self, partition: Partition, limit: usize) -> Self {
        self.limits.insert(partition, limit.max(1));
        self
    }

    pub fn limit(&self, partition: &Partition) -> usize {
        self.limits
            .get(partition)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Run `task` once the partition has a free slot.
    pub async fn submit<F, Fut, T>(&self, partition: &Partition, task: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.submit_with_cancel(partition, std::future::pending::<()>(), task)
            .await
    }

    /// Like [`submit`](Self::submit), but gives up if `cancel` resolves while still queued.
    ///
    /// Once the task has started, `cancel` is ignored: the task owns any
    /// cancellation checks of its own, since remote calls can't be recalled.
    pub async fn submit_with_cancel<C, F, Fut, T>(
        &self,
        partition: &Partition,
        cancel: C,
        task: F,
    ) -> Result<T, QueueError>
    where
        C: Future<Output = ()>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lane = self.lane(partition)?;
        debug!(%partition, available = lane.available_permits(), "queued");

        let permit = tokio::select! {
            biased;
            _ = cancel => {
                debug!(%partition, "cancelled while queued");
                return Err(QueueError::Cancelled { partition: partition.clone() });
            }
            permit = lane.acquire_owned() => permit.map_err(|_| QueueError::Closed {
                partition: partition.clone(),
            })?,
        };

        debug!(%partition, "admitted");
        let output = task().await;
        drop(permit);
        Ok(output)
    }

    /// Tasks currently holding a slot in `partition`.
    pub fn running(&self, partition: &Partition) -> usize {
        match self.lanes().by_partition.get(partition) {
            Some(lane) => self.limit(partition) - lane.available_permits(),
            None => 0,
        }
    }

    /// Reject queued and future submissions. Running tasks finish normally.
    pub fn close(&self) {
        let mut lanes = self.lanes();
        lanes.closed = true;
        for lane in lanes.by_partition.values() {
            lane.close();
        }
    }

    fn lane(&self, partition: &Partition) -> Result<Arc<Semaphore>, QueueError> {
        let limit = self.limit(partition);
        let mut lanes = self.lanes();
        if lanes.closed {
            return Err(QueueError::Closed {
                partition: partition.clone(),
            });
        }
        Ok(lanes
            .by_partition
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(limit)))
            .clone())
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
