use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notification_dispatch::{
    admission::DispatchAdmission,
    circuit_breaker::CircuitBreaker,
    clients::memory::{
        MemoryDeadLetterStore, MemoryFabric, MemoryIdempotencyStore, MemoryRecordStore,
    },
    collaborators::{ChannelSender, OutboundMessage, TemplateRenderer, UserDirectory},
    dead_letter::DeadLetterFeed,
    error::DispatchError,
    models::{
        circuit_breaker::CircuitBreakerConfig,
        message::{DeadLetterEntry, QueueMessage},
        record::{NotificationRecord, RecordVersion},
        request::{Channel, NotificationRequest},
        status::NotificationStatus,
        retry::RetryConfig,
        template::RenderedContent,
        user::UserProfile,
    },
    queue::{MessageSource, QueueFabric},
    records::{RecordPage, RecordStore},
    retry::RetryScheduler,
    worker::{ChannelWorker, WorkerContext, WorkerSettings},
};
use uuid::Uuid;

pub const PUSH_TOKEN: &str = "fcm-device-token-0123456789abcdef";

pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 40,
        backoff_multiplier: 2,
        jitter_ratio: 0.0,
    }
}

pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        concurrency: 2,
        send_timeout: Duration::from_millis(200),
        collaborator_timeout: Duration::from_millis(200),
        circuit_open_requeue_delay: Duration::from_millis(50),
        max_in_flight: Duration::from_secs(3_600),
        shutdown_timeout: Duration::from_secs(2),
        infra_retry: fast_retry(3),
    }
}

pub fn email_request(request_id: &str) -> NotificationRequest {
    NotificationRequest::new(request_id, "user-1", Channel::Email, "welcome")
        .with_variable("name", "Ada")
}

pub fn push_request(request_id: &str) -> NotificationRequest {
    NotificationRequest::new(request_id, "user-1", Channel::Push, "welcome")
}

pub fn user(user_id: &str) -> UserProfile {
    UserProfile {
        user_id: user_id.to_string(),
        contact_address: Some(format!("{}@example.com", user_id)),
        push_token: Some(PUSH_TOKEN.to_string()),
        email_enabled: true,
        push_enabled: true,
    }
}

/// In-memory user directory.
#[derive(Default)]
pub struct StaticUsers {
    users: Mutex<HashMap<String, UserProfile>>,
}

impl StaticUsers {
    pub fn with(users: impl IntoIterator<Item = UserProfile>) -> Self {
        Self {
            users: Mutex::new(
                users
                    .into_iter()
                    .map(|u| (u.user_id.clone(), u))
                    .collect(),
            ),
        }
    }

    pub fn upsert(&self, user: UserProfile) {
        self.users
            .lock()
            .unwrap()
            .insert(user.user_id.clone(), user);
    }
}

#[async_trait]
impl UserDirectory for StaticUsers {
    async fn get_user(&self, user_id: &str) -> Result<UserProfile, DispatchError> {
        self.users
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .ok_or_else(|| DispatchError::UserNotFound(user_id.to_string()))
    }
}

/// Renders `{{name}}`-style placeholders for known template codes.
pub struct StaticTemplates {
    known: Vec<String>,
}

impl Default for StaticTemplates {
    fn default() -> Self {
        Self {
            known: vec!["welcome".to_string()],
        }
    }
}

#[async_trait]
impl TemplateRenderer for StaticTemplates {
    async fn render(
        &self,
        template_code: &str,
        _channel: Channel,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedContent, DispatchError> {
        if !self.known.iter().any(|k| k == template_code) {
            return Err(DispatchError::TemplateNotFound(template_code.to_string()));
        }

        let name = variables.get("name").map(String::as_str).unwrap_or("there");
        Ok(RenderedContent {
            subject: Some(format!("Welcome, {}", name)),
            body: format!("Hello {}", name),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Succeed,
    Fail,
    Hang,
}

/// Provider double that plays a script of outcomes, then repeats `fallback`.
pub struct ScriptedSender {
    name: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Step>,
    calls: AtomicU32,
    sent: Mutex<Vec<OutboundMessage>>,
}

impl ScriptedSender {
    pub fn new(fallback: Step) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Step::Succeed)
    }

    pub fn failing() -> Self {
        Self::new(Step::Fail)
    }

    pub fn then(self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script.lock().unwrap().extend(steps);
        self
    }

    pub fn set_fallback(&self, step: Step) {
        *self.fallback.lock().unwrap() = step;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSender for ScriptedSender {
    fn provider_name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DispatchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.fallback.lock().unwrap());

        match step {
            Step::Succeed => {
                self.sent.lock().unwrap().push(message.clone());
                Ok(())
            }
            Step::Fail => Err(DispatchError::Provider("provider returned 503".to_string())),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(())
            }
        }
    }
}

/// In-memory fabric that also keeps every message published through it.
#[derive(Default)]
pub struct RecordingFabric {
    inner: MemoryFabric,
    published: Mutex<Vec<QueueMessage>>,
}

impl RecordingFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published for `channel`, in publish order.
    pub fn published(&self, channel: Channel) -> Vec<QueueMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.channel() == channel)
            .cloned()
            .collect()
    }

    pub fn dead_letter_depth(&self) -> usize {
        self.inner.dead_letter_depth()
    }
}

#[async_trait]
impl QueueFabric for RecordingFabric {
    async fn publish(&self, message: &QueueMessage) -> Result<(), DispatchError> {
        self.inner.publish(message).await?;
        self.published.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: Channel,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<QueueMessage>>, DispatchError> {
        self.inner.subscribe(channel, consumer_tag).await
    }

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        self.inner.publish_dead_letter(entry).await
    }

    async fn subscribe_dead_letters(
        &self,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<DeadLetterEntry>>, DispatchError> {
        self.inner.subscribe_dead_letters(consumer_tag).await
    }
}

/// Fabric whose first `failures` publishes fail.
pub struct FlakyFabric {
    inner: Arc<RecordingFabric>,
    failures: AtomicU32,
}

impl FlakyFabric {
    pub fn new(inner: Arc<RecordingFabric>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl QueueFabric for FlakyFabric {
    async fn publish(&self, message: &QueueMessage) -> Result<(), DispatchError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DispatchError::Internal(anyhow!("broker unavailable")));
        }
        self.inner.publish(message).await
    }

    async fn subscribe(
        &self,
        channel: Channel,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<QueueMessage>>, DispatchError> {
        self.inner.subscribe(channel, consumer_tag).await
    }

    async fn publish_dead_letter(&self, entry: &DeadLetterEntry) -> Result<(), DispatchError> {
        self.inner.publish_dead_letter(entry).await
    }

    async fn subscribe_dead_letters(
        &self,
        consumer_tag: &str,
    ) -> Result<Box<dyn MessageSource<DeadLetterEntry>>, DispatchError> {
        self.inner.subscribe_dead_letters(consumer_tag).await
    }
}

/// Record store whose inserts stall for `delay`; the first `failures` of
/// them then fail.
pub struct StallingRecords {
    inner: Arc<MemoryRecordStore>,
    delay: Duration,
    failures: AtomicU32,
    store_before_failing: bool,
}

impl StallingRecords {
    pub fn new(inner: Arc<MemoryRecordStore>, delay: Duration, failures: u32) -> Self {
        Self {
            inner,
            delay,
            failures: AtomicU32::new(failures),
            store_before_failing: false,
        }
    }

    /// Failing inserts still write the row, like a commit whose reply was lost.
    pub fn storing_before_failure(mut self) -> Self {
        self.store_before_failing = true;
        self
    }
}

#[async_trait]
impl RecordStore for StallingRecords {
    async fn insert(&self, record: &NotificationRecord) -> Result<(), DispatchError> {
        tokio::time::sleep(self.delay).await;

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !failing {
            return self.inner.insert(record).await;
        }
        if self.store_before_failing {
            self.inner.insert(record).await?;
        }
        Err(DispatchError::Internal(anyhow!("db down")))
    }

    async fn get(&self, notification_id: Uuid) -> Result<Option<NotificationRecord>, DispatchError> {
        self.inner.get(notification_id).await
    }

    async fn get_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<NotificationRecord>, DispatchError> {
        self.inner.get_by_request_id(request_id).await
    }

    async fn update(
        &self,
        record: &NotificationRecord,
        expected: RecordVersion,
    ) -> Result<bool, DispatchError> {
        self.inner.update(record, expected).await
    }

    async fn list_by_user(
        &self,
        user_id: &str,
        page: u64,
        limit: u64,
    ) -> Result<RecordPage, DispatchError> {
        self.inner.list_by_user(user_id, page, limit).await
    }

    async fn list_stale(
        &self,
        status: NotificationStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, DispatchError> {
        self.inner.list_stale(status, updated_before, limit).await
    }
}

/// One pipeline over in-memory backends and scripted collaborators.
pub struct Harness {
    pub records: Arc<MemoryRecordStore>,
    pub dead_letters: Arc<MemoryDeadLetterStore>,
    pub idempotency: Arc<MemoryIdempotencyStore>,
    pub fabric: Arc<RecordingFabric>,
    pub users: Arc<StaticUsers>,
    pub sender: Arc<ScriptedSender>,
    pub breaker: Arc<CircuitBreaker>,
}

impl Harness {
    pub fn new(sender: ScriptedSender) -> Self {
        Self::with_breaker(sender, CircuitBreakerConfig::default())
    }

    pub fn with_breaker(sender: ScriptedSender, breaker: CircuitBreakerConfig) -> Self {
        Self {
            records: Arc::new(MemoryRecordStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
            idempotency: Arc::new(MemoryIdempotencyStore::new(Duration::from_secs(60))),
            fabric: Arc::new(RecordingFabric::new()),
            users: Arc::new(StaticUsers::with([user("user-1")])),
            sender: Arc::new(sender),
            breaker: Arc::new(CircuitBreaker::local("email:scripted", breaker)),
        }
    }

    pub fn admission(&self) -> DispatchAdmission {
        DispatchAdmission::new(
            self.idempotency.clone(),
            self.records.clone(),
            self.fabric.clone(),
        )
    }

    pub fn feed(&self) -> DeadLetterFeed {
        DeadLetterFeed::new(self.dead_letters.clone(), self.admission())
    }

    pub fn worker(&self, channel: Channel, retry: RetryConfig, settings: WorkerSettings) -> ChannelWorker {
        ChannelWorker::new(
            channel,
            WorkerContext {
                records: self.records.clone(),
                fabric: self.fabric.clone(),
                idempotency: self.idempotency.clone(),
                users: self.users.clone(),
                templates: Arc::new(StaticTemplates::default()),
                sender: self.sender.clone(),
                breaker: self.breaker.clone(),
                retry: RetryScheduler::new(retry),
                settings,
            },
        )
    }

    pub async fn record(&self, notification_id: Uuid) -> Result<NotificationRecord> {
        self.records
            .get(notification_id)
            .await?
            .ok_or_else(|| anyhow!("record {} missing", notification_id))
    }

    /// Polls until `check` accepts the record or `timeout` passes.
    pub async fn wait_for<F>(
        &self,
        notification_id: Uuid,
        timeout: Duration,
        check: F,
    ) -> Result<NotificationRecord>
    where
        F: Fn(&NotificationRecord) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let record = self.record(notification_id).await?;
            if check(&record) {
                return Ok(record);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "timed out waiting on {}: status {}, attempt {}",
                    notification_id,
                    record.status,
                    record.attempt
                ));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Receives and acknowledges the next message, failing after `timeout`.
pub async fn next_message(
    source: &mut Box<dyn MessageSource<QueueMessage>>,
    timeout: Duration,
) -> Result<QueueMessage> {
    let delivery = tokio::time::timeout(timeout, source.next())
        .await
        .map_err(|_| anyhow!("no message within {:?}", timeout))?
        .ok_or_else(|| anyhow!("subscription closed"))??;

    delivery.ack().await?;
    Ok(delivery.payload)
}
