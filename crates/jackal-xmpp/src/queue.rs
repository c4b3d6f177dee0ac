//! Owner-keyed operation queue.
//!
//! Roster and blocklist mutations for one user must never interleave, while
//! different users proceed in parallel. Each owner gets a FIFO slot guarded
//! by a fair async mutex; at most `depth` operations may wait on a slot and
//! each one is bounded by the per-operation timeout (measured from enqueue).
//! A slot is evicted as soon as its last pending operation finishes.
//!
//! Operations must not enqueue into their own owner's slot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::config::QueueConfig;
use crate::{Context, XmppError};

struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    pending: usize,
}

pub struct OwnerQueue {
    name: &'static str,
    depth: usize,
    operation_timeout: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl std::fmt::Debug for OwnerQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerQueue")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .field("active_owners", &self.active_owners())
            .finish()
    }
}

impl OwnerQueue {
    pub fn new(name: &'static str, config: &QueueConfig) -> Self {
        Self {
            name,
            depth: config.depth.max(1),
            operation_timeout: config.operation_timeout(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Run `op` after every earlier operation for `owner` has finished.
    ///
    /// Fails with `resource-constraint` when the owner's queue is full, and
    /// with [`XmppError::Timeout`] when the operation does not complete in
    /// time.
    pub async fn run<T, F>(&self, ctx: &Context, owner: &str, op: F) -> Result<T, XmppError>
    where
        F: Future<Output = Result<T, XmppError>>,
    {
        let lock = self.reserve(owner)?;
        let _reservation = Reservation { queue: self, owner };

        let op_ctx = ctx.with_timeout(self.operation_timeout);
        op_ctx
            .run(async move {
                let _turn = lock.lock().await;
                op.await
            })
            .await
    }

    /// Number of owners with pending operations.
    pub fn active_owners(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    fn reserve(&self, owner: &str) -> Result<Arc<tokio::sync::Mutex<()>>, XmppError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| XmppError::internal("owner queue lock poisoned"))?;
        let slot = slots.entry(owner.to_string()).or_insert_with(|| Slot {
            lock: Arc::new(tokio::sync::Mutex::new(())),
            pending: 0,
        });
        if slot.pending >= self.depth {
            debug!(queue = self.name, owner, depth = self.depth, "Owner queue full");
            return Err(XmppError::resource_constraint(Some(format!(
                "Too many pending {} operations",
                self.name
            ))));
        }
        slot.pending += 1;
        Ok(Arc::clone(&slot.lock))
    }

    fn release(&self, owner: &str) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        if let Some(slot) = slots.get_mut(owner) {
            slot.pending = slot.pending.saturating_sub(1);
            if slot.pending == 0 {
                slots.remove(owner);
            }
        }
    }
}

struct Reservation<'a> {
    queue: &'a OwnerQueue,
    owner: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.queue.release(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StanzaErrorCondition;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue(depth: usize, timeout_ms: u64) -> Arc<OwnerQueue> {
        Arc::new(OwnerQueue::new(
            "test",
            &QueueConfig {
                depth,
                operation_timeout_ms: timeout_ms,
            },
        ))
    }

    #[tokio::test]
    async fn test_operations_for_one_owner_do_not_interleave() {
        let queue = queue(32, 5_000);
        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let running = running.clone();
            let overlaps = overlaps.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(&Context::background(), "ortuman", async {
                        if running.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(queue.active_owners(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_resource_constraint() {
        let queue = queue(1, 5_000);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .run(&Context::background(), "noelia", async {
                        let _ = release_rx.await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        while queue.active_owners() == 0 {
            tokio::task::yield_now().await;
        }

        let res = queue
            .run(&Context::background(), "noelia", async { Ok(()) })
            .await;
        match res {
            Err(e) => assert_eq!(e.condition(), Some(StanzaErrorCondition::ResourceConstraint)),
            Ok(()) => panic!("expected overflow"),
        }

        // other owners are unaffected
        queue
            .run(&Context::background(), "ortuman", async { Ok(()) })
            .await
            .unwrap();

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        assert_eq!(queue.active_owners(), 0);
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() {
        let queue = queue(4, 20);
        let res = queue
            .run(&Context::background(), "romeo", async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(XmppError::Timeout(_))));
        assert_eq!(queue.active_owners(), 0);
    }
}
