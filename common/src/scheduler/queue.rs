// Per-target serialization queues. One bounded channel and one consumer task
// per pipeline/job: at most one run/build per target leaves `pending` at a
// time, and FIFO order falls out of the channel itself.

use crate::errors::{StoreError, TriggerError};
use crate::scheduler::cancel::CancelToken;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// A pipeline or freestyle job, the unit of serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetId {
    Pipeline(Uuid),
    Job(Uuid),
}

/// What the consumer task hands to the execution engine
#[derive(Debug, Clone)]
pub struct Work {
    pub target: TargetId,
    /// Run id for pipelines, build id for freestyle jobs
    pub id: Uuid,
    pub cancel: CancelToken,
}

/// Implemented by the execution engine; invoked sequentially per target
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, work: Work);
}

struct TargetSlot {
    tx: mpsc::Sender<Work>,
    /// Serializes reserve-allocate-send so queue order matches number order
    gate: tokio::sync::Mutex<()>,
}

pub struct TargetQueues {
    depth: usize,
    dispatcher: Arc<dyn Dispatcher>,
    slots: Mutex<HashMap<TargetId, Arc<TargetSlot>>>,
}

impl TargetQueues {
    pub fn new(depth: usize, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            depth,
            dispatcher,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Submit work for a target. `make` runs only after a queue slot is
    /// reserved, so a `Busy` rejection leaves no side effects; within it the
    /// caller allocates the run/build number and persists the pending record.
    pub async fn submit<F>(&self, target: TargetId, make: F) -> Result<Work, TriggerError>
    where
        F: FnOnce() -> Result<Work, TriggerError>,
    {
        let slot = self.slot(target);
        let _gate = slot.gate.lock().await;
        let permit = slot.tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => TriggerError::Busy,
            mpsc::error::TrySendError::Closed(()) => {
                TriggerError::Store(StoreError::NotFound(format!("target {:?}", target)))
            }
        })?;
        let work = make()?;
        debug!(target = ?target, id = %work.id, "Queued work");
        permit.send(work.clone());
        Ok(work)
    }

    /// Tear down a target's queue when the pipeline/job is deleted. Queued
    /// work already handed to the consumer still drains.
    pub fn remove_target(&self, target: TargetId) {
        if self.lock_slots().remove(&target).is_some() {
            info!(target = ?target, "Removed target queue");
        }
    }

    fn slot(&self, target: TargetId) -> Arc<TargetSlot> {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get(&target) {
            return Arc::clone(slot);
        }
        let (tx, mut rx) = mpsc::channel::<Work>(self.depth);
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            while let Some(work) = rx.recv().await {
                dispatcher.dispatch(work).await;
            }
            debug!(target = ?target, "Target consumer stopped");
        });
        let slot = Arc::new(TargetSlot {
            tx,
            gate: tokio::sync::Mutex::new(()),
        });
        slots.insert(target, Arc::clone(&slot));
        slot
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<TargetId, Arc<TargetSlot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    struct Recording {
        order: Mutex<Vec<Uuid>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
        block: AsyncMutex<()>,
    }

    struct RecordingDispatcher(Arc<Recording>);

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(&self, work: Work) {
            let now = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.max_running.fetch_max(now, Ordering::SeqCst);
            let _hold = self.0.block.lock().await;
            self.0.order.lock().unwrap().push(work.id);
            self.0.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn work(target: TargetId, id: Uuid) -> Work {
        Work {
            target,
            id,
            cancel: CancelToken::never(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order_per_target() {
        let rec = Arc::new(Recording {
            order: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            block: AsyncMutex::new(()),
        });
        let queues = TargetQueues::new(8, Arc::new(RecordingDispatcher(Arc::clone(&rec))));
        let target = TargetId::Job(Uuid::new_v4());
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            let id = *id;
            queues
                .submit(target, || Ok(work(target, id)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*rec.order.lock().unwrap(), ids);
        assert_eq!(rec.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_overflow_rejected_with_busy() {
        let rec = Arc::new(Recording {
            order: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            block: AsyncMutex::new(()),
        });
        let queues = TargetQueues::new(2, Arc::new(RecordingDispatcher(Arc::clone(&rec))));
        let target = TargetId::Job(Uuid::new_v4());

        // Stall the consumer so submissions pile up
        let hold = rec.block.lock().await;
        let mut accepted = 0;
        let mut busy = 0;
        // 1 in flight + 2 queued fit; everything beyond gets Busy
        for _ in 0..6 {
            let id = Uuid::new_v4();
            match queues.submit(target, || Ok(work(target, id))).await {
                Ok(_) => accepted += 1,
                Err(TriggerError::Busy) => busy += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
            tokio::task::yield_now().await;
        }
        drop(hold);
        assert!(busy > 0, "expected at least one Busy rejection");
        assert!(accepted >= 2);
    }

    #[tokio::test]
    async fn test_busy_leaves_no_side_effects() {
        let rec = Arc::new(Recording {
            order: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            block: AsyncMutex::new(()),
        });
        let queues = TargetQueues::new(1, Arc::new(RecordingDispatcher(Arc::clone(&rec))));
        let target = TargetId::Job(Uuid::new_v4());
        let hold = rec.block.lock().await;

        let made = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let made = Arc::clone(&made);
            let id = Uuid::new_v4();
            let _ = queues
                .submit(target, move || {
                    made.fetch_add(1, Ordering::SeqCst);
                    Ok(work(target, id))
                })
                .await;
            tokio::task::yield_now().await;
        }
        drop(hold);
        tokio::time::sleep(Duration::from_millis(100)).await;
        // `make` ran exactly as many times as work items were accepted
        assert_eq!(
            made.load(Ordering::SeqCst),
            rec.order.lock().unwrap().len()
        );
    }

    #[tokio::test]
    async fn test_targets_run_independently() {
        let rec = Arc::new(Recording {
            order: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            block: AsyncMutex::new(()),
        });
        let queues = TargetQueues::new(8, Arc::new(RecordingDispatcher(Arc::clone(&rec))));
        let a = TargetId::Job(Uuid::new_v4());
        let b = TargetId::Pipeline(Uuid::new_v4());
        for target in [a, b, a, b] {
            let id = Uuid::new_v4();
            queues
                .submit(target, || Ok(work(target, id)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(rec.order.lock().unwrap().len(), 4);
    }
}
