//! Single-process backends for development and tests.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BinaryHeap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    dead_letter::{DeadLetterPage, DeadLetterStore},
    error::DispatchError,
    idempotency::{Admission, IdempotencyStore},
    models::{
        message::{DeadLetterEntry, QueueMessage},
        record::{NotificationRecord, RecordVersion},
        request::Channel,
        status::NotificationStatus,
    },
    queue::{Delivery, DeliveryHandle, MessageSource, QueueFabric, broker_priority},
    records::{RecordPage, RecordStore},
};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, DispatchError> {
    mutex
        .lock()
        .map_err(|_| DispatchError::Internal(anyhow!("in-memory backend lock poisoned")))
}

fn page_bounds(page: u64, limit: u64) -> (usize, usize) {
    let skip = page.saturating_sub(1).saturating_mul(limit) as usize;
    (skip, limit as usize)
}

struct Binding {
    notification_id: Uuid,
    expires_at: Option<Instant>,
}

impl Binding {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

fn prune_expired(bindings: &mut HashMap<String, Binding>, now: Instant) {
    bindings.retain(|_, binding| !binding.expired(now));
}

pub struct MemoryIdempotencyStore {
    bindings: Mutex<HashMap<String, Binding>>,
    retention: Duration,
}

impl MemoryIdempotencyStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            bindings: Mutex::new(HashMap::new()),
            retention,
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn admit(&self, request_id: &str, candidate: Uuid) -> Result<Admission, DispatchError> {
        let mut bindings = lock(&self.bindings)?;
        prune_expired(&mut bindings, Instant::now());

        if let Some(binding) = bindings.get(request_id) {
            return Ok(Admission::Duplicate(binding.notification_id));
        }

        bindings.insert(
            request_id.to_string(),
            Binding {
                notification_id: candidate,
                expires_at: None,
            },
        );
        Ok(Admission::Fresh)
    }

    async fn release(&self, request_id: &str, notification_id: Uuid) -> Result<(), DispatchError> {
        let mut bindings = lock(&self.bindings)?;

        if bindings
            .get(request_id)
            .is_some_and(|b| b.notification_id == notification_id)
        {
            bindings.remove(request_id);
        }
        Ok(())
    }

    async fn retire(&self, request_id: &str) -> Result<(), DispatchError> {
        let mut bindings = lock(&self.bindings)?;
        let now = Instant::now();

        if let Some(binding) = bindings.get_mut(request_id) {
            binding.expires_at = Some(now + self.retention);
        }
        prune_expired(&mut bindings, now);
        Ok(())
    }
}

#[derive(Default)]
struct RecordTables {
    by_id: HashMap<Uuid, NotificationRecord>,
    by_request_id: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    tables: Mutex<RecordTables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.tables).map(|t| t.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a record, as if the store had been rebuilt without it.
    pub fn forget(&self, notification_id: Uuid) -> Option<NotificationRecord> {
        let mut tables = lock(&self.tables).ok()?;
        let record = tables.by_id.remove(&notification_id)?;
        tables.by_request_id.remove(record.request_id());
        Some(record)
    }

    /// Overwrites a record without a version check.
    pub fn put(&self, record: NotificationRecord) {
        if let Ok(mut tables) = lock(&self.tables) {
            tables
                .by_request_id
                .insert(record.request_id().to_string(), record.notification_id);
            tables.by_id.insert(record.notification_id, record);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn insert(&self, record: &NotificationRecord) -> Result<(), DispatchError> {
        let mut tables = lock(&self.tables)?;

        if tables.by_id.contains_key(&record.notification_id)
            || tables.by_request_id.contains_key(record.request_id())
        {
            return Err(DispatchError::Internal(anyhow!(
                "record for request {} already exists",
                record.request_id()
            )));
        }

        tables
            .by_request_id
            .insert(record.request_id().to_string(), record.notification_id);
        tables.by_id.insert(record.notification_id, record.clone());
        Ok(())
    }

    async fn get(
        &self,
        notification_id: Uuid,
    ) -> Result<Option<NotificationRecord>, DispatchError> {
        Ok(lock(&self.tables)?.by_id.get(&notification_id).cloned())
    }

    async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<NotificationRecord>, DispatchError> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .by_request_id
            .get(request_id)
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn update(
        &self,
        record: &NotificationRecord,
        expected: RecordVersion,
    ) -> Result<bool, DispatchError> {
        let mut tables = lock(&self.tables)?;

        match tables.by_id.get_mut(&record.notification_id) {
            Some(stored) if stored.version() == expected => {
                *stored = record.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(DispatchError::NotificationNotFound(record.notification_id)),
        }
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        page: u64,
        limit: u64,
    ) -> Result<RecordPage, DispatchError> {
        let tables = lock(&self.tables)?;

        let mut records: Vec<_> = tables
            .by_id
            .values()
            .filter(|r| r.user_id() == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = records.len() as u64;
        let (skip, take) = page_bounds(page, limit);

        Ok(RecordPage {
            records: records.into_iter().skip(skip).take(take).collect(),
            total,
        })
    }

    async fn list_stale(
        &self,
        status: NotificationStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, DispatchError> {
        let tables = lock(&self.tables)?;

        let mut records: Vec<_> = tables
            .by_id
            .values()
            .filter(|r| r.status == status && r.updated_at < updated_before)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        records.truncate(limit);

        Ok(records)
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn append(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        let mut entries = lock(&self.entries)?;

        if !entries.iter().any(|e| e.id == entry.id) {
            entries.push(entry.clone());
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, DispatchError> {
        Ok(lock(&self.entries)?.iter().find(|e| e.id == id).cloned())
    }

    async fn list(&self, page: u64, limit: u64) -> Result<DeadLetterPage, DispatchError> {
        let mut entries = lock(&self.entries)?.clone();
        entries.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));

        let total = entries.len() as u64;
        let (skip, take) = page_bounds(page, limit);

        Ok(DeadLetterPage {
            entries: entries.into_iter().skip(skip).take(take).collect(),
            total,
        })
    }

    async fn mark_replayed(&self, id: Uuid, replayed_as: Uuid) -> Result<(), DispatchError> {
        let mut entries = lock(&self.entries)?;

        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(DispatchError::DeadLetterNotFound(id))?;
        entry.replayed_as = Some(replayed_as);
        Ok(())
    }
}

struct Ready<T> {
    priority: u8,
    seq: u64,
    redelivered: bool,
    payload: T,
}

impl<T> PartialEq for Ready<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Ready<T> {}

impl<T> PartialOrd for Ready<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap: highest priority first, then lowest sequence (FIFO).
impl<T> Ord for Ready<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Scheduled<T> {
    priority: u8,
    payload: T,
}

struct QueueState<T> {
    ready: BinaryHeap<Ready<T>>,
    scheduled: BTreeMap<(DateTime<Utc>, u64), Scheduled<T>>,
    unacked: HashMap<u64, (u8, T)>,
    next_seq: u64,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            ready: BinaryHeap::new(),
            scheduled: BTreeMap::new(),
            unacked: HashMap::new(),
            next_seq: 0,
        }
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(entry) = self.scheduled.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), scheduled) = entry.remove_entry();
            self.ready.push(Ready {
                priority: scheduled.priority,
                seq,
                redelivered: false,
                payload: scheduled.payload,
            });
        }
    }
}

struct MemoryQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T: Clone + Send + Sync + 'static> MemoryQueue<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
        })
    }

    fn push(
        &self,
        payload: T,
        priority: u8,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), DispatchError> {
        {
            let mut state = lock(&self.state)?;
            let seq = state.seq();

            match not_before {
                Some(due) if due > Utc::now() => {
                    state
                        .scheduled
                        .insert((due, seq), Scheduled { priority, payload });
                }
                _ => state.ready.push(Ready {
                    priority,
                    seq,
                    redelivered: false,
                    payload,
                }),
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    fn settle(&self, tag: u64, requeue: bool) -> Result<(), DispatchError> {
        {
            let mut state = lock(&self.state)?;
            let Some((priority, payload)) = state.unacked.remove(&tag) else {
                return Ok(());
            };

            if requeue {
                let seq = state.seq();
                state.ready.push(Ready {
                    priority,
                    seq,
                    redelivered: true,
                    payload,
                });
            }
        }

        if requeue {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        lock(&self.state)
            .map(|s| s.ready.len() + s.scheduled.len() + s.unacked.len())
            .unwrap_or(0)
    }

    async fn pop(self: &Arc<Self>) -> Result<Delivery<T>, DispatchError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_due = {
                let mut state = lock(&self.state)?;
                state.promote_due(Utc::now());

                if let Some(ready) = state.ready.pop() {
                    state
                        .unacked
                        .insert(ready.seq, (ready.priority, ready.payload.clone()));

                    let handle = MemoryDeliveryHandle {
                        queue: Arc::clone(self),
                        tag: ready.seq,
                    };
                    return Ok(Delivery::new(
                        ready.payload,
                        ready.redelivered,
                        Box::new(handle),
                    ));
                }

                state.scheduled.keys().next().map(|(due, _)| *due)
            };

            match next_due {
                Some(due) => {
                    let wait = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

struct MemoryDeliveryHandle<T> {
    queue: Arc<MemoryQueue<T>>,
    tag: u64,
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> DeliveryHandle for MemoryDeliveryHandle<T> {
    async fn ack(&self) -> Result<(), DispatchError> {
        self.queue.settle(self.tag, false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), DispatchError> {
        self.queue.settle(self.tag, requeue)
    }
}

struct MemorySource<T> {
    queue: Arc<MemoryQueue<T>>,
}

#[async_trait]
impl<T: Clone + Send + Sync + 'static> MessageSource<T> for MemorySource<T> {
    async fn next(&mut self) -> Option<Result<Delivery<T>, DispatchError>> {
        Some(self.queue.pop().await)
    }
}

/// In-process queue fabric: a priority queue per channel with a due-time
/// arena for delayed messages, plus the dead-letter queue.
pub struct MemoryFabric {
    queues: HashMap<Channel, Arc<MemoryQueue<QueueMessage>>>,
    dead_letters: Arc<MemoryQueue<DeadLetterEntry>>,
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFabric {
    pub fn new() -> Self {
        Self {
            queues: Channel::ALL
                .iter()
                .map(|channel| (*channel, MemoryQueue::new()))
                .collect(),
            dead_letters: MemoryQueue::new(),
        }
    }

    fn queue(&self, channel: Channel) -> Result<&Arc<MemoryQueue<QueueMessage>>, DispatchError> {
        self.queues
            .get(&channel)
            .ok_or_else(|| DispatchError::Internal(anyhow!("no queue for channel {}", channel)))
    }

    /// Messages waiting, scheduled or unacknowledged on `channel`.
    pub fn depth(&self, channel: Channel) -> usize {
        self.queues.get(&channel).map(|q| q.depth()).unwrap_or(0)
    }

    pub fn dead_letter_depth(&self) -> usize {
        self.dead_letters.depth()
    }
}

#[async_trait]
impl QueueFabric for MemoryFabric {
    async fn publish(&self, message: &QueueMessage) -> Result<(), DispatchError> {
        self.queue(message.channel())?.push(
            message.clone(),
            broker_priority(message.request.priority),
            Some(message.not_before),
        )
    }

    async fn subscribe(
        &self,
        channel: Channel,
        _consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<QueueMessage>>, DispatchError> {
        Ok(Box::new(MemorySource {
            queue: Arc::clone(self.queue(channel)?),
        }))
    }

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        self.dead_letters.push(entry.clone(), 0, None)
    }

    async fn subscribe_dead_letters(
        &self,
        _consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<DeadLetterEntry>>, DispatchError> {
        Ok(Box::new(MemorySource {
            queue: Arc::clone(&self.dead_letters),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::NotificationRequest;

    fn message(priority: i32) -> QueueMessage {
        let request = NotificationRequest::new(
            Uuid::new_v4().to_string(),
            "user-1",
            Channel::Email,
            "welcome",
        )
        .with_priority(priority);
        QueueMessage::new(Uuid::new_v4(), 0, request)
    }

    #[tokio::test]
    async fn pops_by_priority_then_fifo() {
        let fabric = MemoryFabric::new();
        let low = message(1);
        let high = message(9);
        let low2 = message(1);

        for m in [&low, &high, &low2] {
            fabric.publish(m).await.unwrap();
        }

        let mut source = fabric.subscribe(Channel::Email, "t").await.unwrap();
        let mut order = Vec::new();
        for _ in 0..3 {
            let delivery = source.next().await.unwrap().unwrap();
            order.push(delivery.payload.notification_id);
            delivery.ack().await.unwrap();
        }

        assert_eq!(
            order,
            vec![high.notification_id, low.notification_id, low2.notification_id]
        );
        assert_eq!(fabric.depth(Channel::Email), 0);
    }

    #[tokio::test]
    async fn delayed_messages_surface_when_due() {
        let fabric = MemoryFabric::new();
        let delayed = message(5).delayed_until(Utc::now() + chrono::Duration::milliseconds(50));
        fabric.publish(&delayed).await.unwrap();

        let mut source = fabric.subscribe(Channel::Email, "t").await.unwrap();
        let started = Instant::now();
        let delivery = source.next().await.unwrap().unwrap();

        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(delivery.payload.notification_id, delayed.notification_id);
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let fabric = MemoryFabric::new();
        fabric.publish(&message(5)).await.unwrap();

        let mut source = fabric.subscribe(Channel::Email, "t").await.unwrap();
        let first = source.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        first.nack(true).await.unwrap();

        let second = source.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(first.payload, second.payload);
    }

    #[tokio::test]
    async fn record_updates_are_compare_and_set() {
        let store = MemoryRecordStore::new();
        let mut record = NotificationRecord::new(
            Uuid::new_v4(),
            NotificationRequest::new("r1", "user-1", Channel::Push, "welcome"),
        );
        store.insert(&record).await.unwrap();

        let stale = record.version();
        record.transition(NotificationStatus::Queued).unwrap();
        assert!(store.update(&record, stale).await.unwrap());
        assert!(!store.update(&record, stale).await.unwrap());
    }

    #[tokio::test]
    async fn expired_bindings_are_evicted() {
        let store = MemoryIdempotencyStore::new(Duration::ZERO);
        for i in 0..10 {
            let key = format!("retired-{}", i);
            store.admit(&key, Uuid::new_v4()).await.unwrap();
            store.retire(&key).await.unwrap();
        }
        store.admit("live", Uuid::new_v4()).await.unwrap();

        let bindings = store.bindings.lock().unwrap();
        assert_eq!(bindings.len(), 1);
        assert!(bindings.contains_key("live"));
    }
}
