//! Per-resource sync queues with bounded concurrent claims.
//!
//! ## Capacity
//!
//! A queue is *ready* while the number of claimed items is below its
//! `size_limit`. Every claim re-checks readiness after locking the queue row, in
//! the same transaction that stamps the item, so two nodes can never both take
//! the last slot.
//!
//! ## Ordering
//!
//! Within one queue items are claimed oldest-insertion-first. Across queues
//! there is no global FIFO: a newer item in an under-full queue may be claimed
//! before an older item in a full one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use asyncjob_core::{NodeId, QueueId, QueueItemId};

use crate::job_store::{JobDataStore, StoreResult, StoreTx};

use super::types::{ResourceKey, SyncQueue, SyncQueueItem};

/// Queue operations, each in its own store transaction.
#[derive(Debug)]
pub struct SyncQueueManager<S> {
    store: Arc<S>,
}

impl<S> Clone for SyncQueueManager<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: JobDataStore> SyncQueueManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Ensure the queue for `key` exists (raising its limit if needed) and
    /// append an item for `content`.
    pub fn queue(
        &self,
        key: &ResourceKey,
        content_type: &str,
        content_id: i64,
        size_limit: u32,
    ) -> StoreResult<(SyncQueue, SyncQueueItem)> {
        self.store.transaction(|tx| {
            queue_in_tx(tx, key, content_type, content_id, size_limit, Utc::now())
        })
    }

    /// Claim the oldest unclaimed item of one queue, if it has capacity.
    pub fn dequeue_from_one(
        &self,
        queue_id: QueueId,
        node: NodeId,
    ) -> StoreResult<Option<SyncQueueItem>> {
        self.store
            .transaction(|tx| dequeue_from_one_in_tx(tx, queue_id, node, Utc::now()))
    }

    /// Claim up to `max_items` unclaimed items across all queues.
    ///
    /// Each candidate is claimed in its own transaction after re-validating its
    /// queue's readiness; candidates whose queue is full are skipped and stay
    /// eligible for a later scan.
    pub fn dequeue_from_any(&self, node: NodeId, max_items: usize) -> StoreResult<Vec<SyncQueueItem>> {
        let candidates = self
            .store
            .transaction(|tx| tx.unclaimed_items(max_items))?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self
                .store
                .transaction(|tx| claim_item_in_tx(tx, candidate.id, node, Utc::now()))
            {
                Ok(Some(item)) => claimed.push(item),
                Ok(None) => {
                    debug!(item_id = %candidate.id, queue_id = %candidate.queue_id, "queue not ready, skipping item");
                }
                Err(e) => {
                    warn!(item_id = %candidate.id, error = %e, "failed to claim queue item");
                }
            }
        }
        Ok(claimed)
    }

    /// Delete an item. Tolerates the item already being gone.
    pub fn purge_item(&self, item_id: QueueItemId) -> StoreResult<bool> {
        self.store
            .transaction(|tx| purge_item_in_tx(tx, item_id, Utc::now()))
            .map(|purged| purged.is_some())
    }

    /// Release an item's claim so it can be redrawn.
    pub fn return_item(&self, item_id: QueueItemId) -> StoreResult<bool> {
        self.store
            .transaction(|tx| return_item_in_tx(tx, item_id, Utc::now()))
    }

    /// Items claimed longer ago than `threshold` and never purged.
    pub fn blocked_items(&self, threshold: Duration) -> StoreResult<Vec<SyncQueueItem>> {
        let cutoff = Utc::now() - to_chrono(threshold);
        self.store.transaction(|tx| tx.items_claimed_before(cutoff))
    }

    pub fn find_queue(&self, key: &ResourceKey) -> StoreResult<Option<SyncQueue>> {
        self.store.transaction(|tx| tx.find_queue_by_key(key))
    }
}

/// Convert a config duration, saturating at a century.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    let century = chrono::Duration::days(36_500);
    chrono::Duration::from_std(d).map_or(century, |d| d.min(century))
}

pub(crate) fn queue_in_tx(
    tx: &mut dyn StoreTx,
    key: &ResourceKey,
    content_type: &str,
    content_id: i64,
    size_limit: u32,
    now: DateTime<Utc>,
) -> StoreResult<(SyncQueue, SyncQueueItem)> {
    let queue = tx.ensure_queue(key, size_limit.max(1), now)?;
    let item = tx.insert_item(queue.id, content_type, content_id, now)?;
    debug!(
        queue_id = %queue.id,
        item_id = %item.id,
        resource = %key,
        content_id,
        "queued item"
    );
    Ok((queue, item))
}

fn queue_ready_to_process(tx: &mut dyn StoreTx, queue: &SyncQueue) -> StoreResult<bool> {
    Ok(tx.active_item_count(queue.id)? < queue.size_limit)
}

fn stamp_claim(
    tx: &mut dyn StoreTx,
    mut queue: SyncQueue,
    mut item: SyncQueueItem,
    node: NodeId,
    now: DateTime<Utc>,
) -> StoreResult<SyncQueueItem> {
    queue.last_process_number += 1;
    queue.queue_size += 1;
    queue.last_updated = now;
    item.claim(node, queue.last_process_number, now);
    tx.update_item(&item)?;
    tx.update_queue(&queue)?;
    debug!(
        queue_id = %queue.id,
        item_id = %item.id,
        node_id = %node,
        process_number = queue.last_process_number,
        "claimed queue item"
    );
    Ok(item)
}

pub(crate) fn dequeue_from_one_in_tx(
    tx: &mut dyn StoreTx,
    queue_id: QueueId,
    node: NodeId,
    now: DateTime<Utc>,
) -> StoreResult<Option<SyncQueueItem>> {
    let Some(queue) = tx.lock_queue(queue_id)? else {
        return Ok(None);
    };
    if !queue_ready_to_process(tx, &queue)? {
        return Ok(None);
    }
    let Some(item) = tx.next_unclaimed_item(queue_id)? else {
        return Ok(None);
    };
    stamp_claim(tx, queue, item, node, now).map(Some)
}

/// Claim one specific item if it is still unclaimed and its queue has room.
pub(crate) fn claim_item_in_tx(
    tx: &mut dyn StoreTx,
    item_id: QueueItemId,
    node: NodeId,
    now: DateTime<Utc>,
) -> StoreResult<Option<SyncQueueItem>> {
    let Some(peek) = tx.find_item(item_id)? else {
        return Ok(None);
    };
    // Queue row first, then item row.
    let Some(queue) = tx.lock_queue(peek.queue_id)? else {
        return Ok(None);
    };
    let Some(item) = tx.lock_item(item_id)? else {
        return Ok(None);
    };
    if item.is_claimed() || !queue_ready_to_process(tx, &queue)? {
        return Ok(None);
    }
    stamp_claim(tx, queue, item, node, now).map(Some)
}

pub(crate) fn purge_item_in_tx(
    tx: &mut dyn StoreTx,
    item_id: QueueItemId,
    now: DateTime<Utc>,
) -> StoreResult<Option<SyncQueueItem>> {
    let Some(peek) = tx.find_item(item_id)? else {
        return Ok(None);
    };
    let queue = tx.lock_queue(peek.queue_id)?;
    let Some(item) = tx.lock_item(item_id)? else {
        return Ok(None);
    };
    if !tx.delete_item(item_id)? {
        return Ok(None);
    }
    if item.is_claimed() {
        if let Some(mut queue) = queue {
            queue.queue_size = queue.queue_size.saturating_sub(1);
            queue.last_updated = now;
            tx.update_queue(&queue)?;
        }
    }
    debug!(item_id = %item.id, queue_id = %item.queue_id, "purged queue item");
    Ok(Some(item))
}

/// Purge whatever item references `content`, if any.
pub(crate) fn purge_content_in_tx(
    tx: &mut dyn StoreTx,
    content_type: &str,
    content_id: i64,
    now: DateTime<Utc>,
) -> StoreResult<Option<SyncQueueItem>> {
    match tx.find_item_by_content(content_type, content_id)? {
        Some(item) => purge_item_in_tx(tx, item.id, now),
        None => Ok(None),
    }
}

pub(crate) fn return_item_in_tx(
    tx: &mut dyn StoreTx,
    item_id: QueueItemId,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let Some(peek) = tx.find_item(item_id)? else {
        return Ok(false);
    };
    let queue = tx.lock_queue(peek.queue_id)?;
    let Some(mut item) = tx.lock_item(item_id)? else {
        return Ok(false);
    };
    if !item.is_claimed() {
        return Ok(false);
    }
    item.release_claim();
    tx.update_item(&item)?;
    if let Some(mut queue) = queue {
        queue.queue_size = queue.queue_size.saturating_sub(1);
        queue.last_updated = now;
        tx.update_queue(&queue)?;
    }
    debug!(item_id = %item.id, queue_id = %item.queue_id, "returned queue item");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::job_store::{InMemoryJobDataStore, StoreError};
    use crate::jobs::types::JOB_CONTENT_TYPE;

    fn manager() -> (Arc<InMemoryJobDataStore>, SyncQueueManager<InMemoryJobDataStore>) {
        let store = InMemoryJobDataStore::arc();
        (store.clone(), SyncQueueManager::new(store))
    }

    fn vm(id: i64) -> ResourceKey {
        ResourceKey::new("VirtualMachine", id)
    }

    const NODE: NodeId = NodeId::new(1);

    #[test]
    fn dequeue_respects_limit_and_fifo() {
        let (_store, queues) = manager();
        let (queue, first) = queues.queue(&vm(1), JOB_CONTENT_TYPE, 10, 1).unwrap();
        queues.queue(&vm(1), JOB_CONTENT_TYPE, 11, 1).unwrap();

        let claimed = queues.dequeue_from_one(queue.id, NODE).unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.last_process_msid, Some(NODE));
        assert_eq!(claimed.last_process_number, Some(1));

        assert!(queues.dequeue_from_one(queue.id, NODE).unwrap().is_none());

        assert!(queues.purge_item(claimed.id).unwrap());
        let next = queues.dequeue_from_one(queue.id, NODE).unwrap().unwrap();
        assert_eq!(next.content_id, 11);
        assert_eq!(next.last_process_number, Some(2));
    }

    #[test]
    fn queue_size_counts_claims_not_enqueues() {
        let (store, queues) = manager();
        let (queue, item) = queues.queue(&vm(3), JOB_CONTENT_TYPE, 1, 2).unwrap();
        queues.queue(&vm(3), JOB_CONTENT_TYPE, 2, 2).unwrap();
        assert_eq!(store.queues()[0].queue_size, 0);

        queues.dequeue_from_one(queue.id, NODE).unwrap().unwrap();
        assert_eq!(store.queues()[0].queue_size, 1);

        assert!(queues.return_item(item.id).unwrap());
        assert_eq!(store.queues()[0].queue_size, 0);
    }

    #[test]
    fn purge_is_idempotent_and_releases_capacity_once() {
        let (store, queues) = manager();
        let (queue, item) = queues.queue(&vm(2), JOB_CONTENT_TYPE, 1, 2).unwrap();
        queues.dequeue_from_one(queue.id, NODE).unwrap().unwrap();

        assert!(queues.purge_item(item.id).unwrap());
        assert!(!queues.purge_item(item.id).unwrap());
        assert_eq!(store.queues()[0].queue_size, 0);
    }

    #[test]
    fn returned_item_is_redrawn() {
        let (store, queues) = manager();
        let (queue, item) = queues.queue(&vm(3), JOB_CONTENT_TYPE, 1, 1).unwrap();
        queues.dequeue_from_one(queue.id, NODE).unwrap().unwrap();

        assert!(queues.return_item(item.id).unwrap());
        assert!(!queues.return_item(item.id).unwrap());
        assert!(!store.items()[0].is_claimed());

        let again = queues.dequeue_from_one(queue.id, NodeId::new(2)).unwrap().unwrap();
        assert_eq!(again.id, item.id);
        assert_eq!(again.last_process_msid, Some(NodeId::new(2)));
    }

    #[test]
    fn dequeue_from_any_skips_full_queues() {
        let (_store, queues) = manager();
        // Queue A: limit 1, two items. Queue B: limit 1, one item.
        queues.queue(&vm(10), JOB_CONTENT_TYPE, 1, 1).unwrap();
        queues.queue(&vm(10), JOB_CONTENT_TYPE, 2, 1).unwrap();
        queues.queue(&vm(11), JOB_CONTENT_TYPE, 3, 1).unwrap();

        let claimed = queues.dequeue_from_any(NODE, 10).unwrap();
        let ids: Vec<i64> = claimed.iter().map(|i| i.content_id).collect();
        assert_eq!(ids, vec![1, 3]);

        // Item 2 is still there, waiting for queue A's slot.
        assert!(queues.dequeue_from_any(NODE, 10).unwrap().is_empty());
    }

    #[test]
    fn blocked_items_are_old_claims() {
        let (_store, queues) = manager();
        let (queue, _) = queues.queue(&vm(4), JOB_CONTENT_TYPE, 1, 1).unwrap();
        queues.dequeue_from_one(queue.id, NODE).unwrap().unwrap();

        assert!(queues.blocked_items(Duration::from_secs(3600)).unwrap().is_empty());
        thread::sleep(Duration::from_millis(5));
        assert_eq!(queues.blocked_items(Duration::ZERO).unwrap().len(), 1);
    }

    #[test]
    fn store_full_is_reported() {
        let store = Arc::new(InMemoryJobDataStore::new().with_capacity(1));
        let queues = SyncQueueManager::new(store);
        queues.queue(&vm(5), JOB_CONTENT_TYPE, 1, 1).unwrap();
        let err = queues.queue(&vm(5), JOB_CONTENT_TYPE, 2, 1).unwrap_err();
        assert!(matches!(err, StoreError::StoreFull(_)));
    }

    #[test]
    fn concurrent_claims_never_exceed_limit() {
        const ITEMS: i64 = 100;
        const LIMIT: u32 = 3;
        const THREADS: usize = 8;

        let (store, queues) = manager();
        for content in 0..ITEMS {
            queues.queue(&vm(42), JOB_CONTENT_TYPE, content, LIMIT).unwrap();
        }
        let queue_id = queues.find_queue(&vm(42)).unwrap().unwrap().id;

        let processed = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let queues = queues.clone();
                let store = store.clone();
                let processed = processed.clone();
                let in_flight = in_flight.clone();
                let max_seen = max_seen.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let node = NodeId::new(t as u64 + 1);
                    barrier.wait();
                    while processed.load(Ordering::SeqCst) < ITEMS as usize {
                        let claimed = if t % 2 == 0 {
                            queues.dequeue_from_one(queue_id, node).unwrap().into_iter().collect()
                        } else {
                            queues.dequeue_from_any(node, 2).unwrap()
                        };
                        if claimed.is_empty() {
                            thread::yield_now();
                            continue;
                        }
                        let now = in_flight.fetch_add(claimed.len(), Ordering::SeqCst) + claimed.len();
                        max_seen.fetch_max(now, Ordering::SeqCst);

                        let durable = store.items().iter().filter(|i| i.is_claimed()).count();
                        assert!(durable <= LIMIT as usize, "{durable} claimed items");

                        for item in claimed {
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            assert!(queues.purge_item(item.id).unwrap());
                            processed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(processed.load(Ordering::SeqCst), ITEMS as usize);
        assert!(max_seen.load(Ordering::SeqCst) <= LIMIT as usize);
        assert!(store.items().is_empty());
        let queue = &store.queues()[0];
        assert_eq!(queue.queue_size, 0);
        assert_eq!(queue.last_process_number, ITEMS);
    }
}
