//! Channel worker: consumes a channel queue and drives each notification
//! through one delivery attempt.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    circuit_breaker::CircuitBreaker,
    collaborators::{ChannelSender, OutboundMessage, TemplateRenderer, UserDirectory},
    error::DispatchError,
    idempotency::IdempotencyStore,
    models::{
        message::{DeadLetterEntry, QueueMessage},
        record::{ErrorInfo, NotificationRecord, RecordVersion},
        request::Channel,
        retry::{RetryAction, RetryConfig},
        status::NotificationStatus,
        user::UserProfile,
        validation::{validate_email_address, validate_push_token},
    },
    queue::{Delivery, MessageSource, QueueFabric},
    records::RecordStore,
    retry::RetryScheduler,
    utils::{retry_until_success, retry_with_backoff},
};

const INFRA_FAILURE_PAUSE: Duration = Duration::from_millis(500);

/// Slack on top of the longest live attempt before a SENDING record is
/// considered abandoned by a crashed worker.
const INTERRUPTED_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub send_timeout: Duration,
    /// Bound on each user lookup and template render.
    pub collaborator_timeout: Duration,
    pub circuit_open_requeue_delay: Duration,
    pub max_in_flight: Duration,
    pub shutdown_timeout: Duration,
    /// Backoff for store and broker writes that must not be dropped.
    pub infra_retry: RetryConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            send_timeout: Duration::from_secs(10),
            collaborator_timeout: Duration::from_secs(5),
            circuit_open_requeue_delay: Duration::from_secs(5),
            max_in_flight: Duration::from_secs(3_600),
            shutdown_timeout: Duration::from_secs(30),
            infra_retry: RetryConfig::default(),
        }
    }
}

impl WorkerSettings {
    /// Longest a live attempt can hold a record in SENDING: user lookup,
    /// render and send, each under its own timeout.
    pub fn attempt_budget(&self) -> Duration {
        self.collaborator_timeout * 2 + self.send_timeout
    }

    pub fn interrupted_after(&self) -> Duration {
        self.attempt_budget() + INTERRUPTED_MARGIN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    Retrying(Duration),
    DeadLettered,
    /// Recipient opted out of the channel.
    Failed,
    /// Breaker rejected the attempt; requeued without consuming an attempt.
    CircuitOpen,
    /// Not due yet, or in flight elsewhere; republished for later.
    Deferred,
    /// Terminal or superseded; nothing to do.
    Skipped,
}

pub struct WorkerContext {
    pub records: Arc<dyn RecordStore>,
    pub fabric: Arc<dyn QueueFabric>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub users: Arc<dyn UserDirectory>,
    pub templates: Arc<dyn TemplateRenderer>,
    pub sender: Arc<dyn ChannelSender>,
    pub breaker: Arc<CircuitBreaker>,
    pub retry: RetryScheduler,
    pub settings: WorkerSettings,
}

#[derive(Clone)]
pub struct ChannelWorker {
    channel: Channel,
    ctx: Arc<WorkerContext>,
}

impl ChannelWorker {
    pub fn new(channel: Channel, ctx: WorkerContext) -> Self {
        Self {
            channel,
            ctx: Arc::new(ctx),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Runs the consumer pool until `shutdown` fires, then lets in-flight
    /// attempts finish for at most `shutdown_timeout`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DispatchError> {
        let mut tasks = JoinSet::new();

        for index in 0..self.ctx.settings.concurrency {
            let consumer_tag = format!("{}-worker-{}", self.channel, index);
            let source = self.ctx.fabric.subscribe(self.channel, &consumer_tag).await?;
            tasks.spawn(self.clone().consume(source, shutdown.clone()));
        }

        info!(
            channel = %self.channel,
            provider = self.ctx.sender.provider_name(),
            concurrency = self.ctx.settings.concurrency,
            "Channel worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    Some(Err(e)) => error!(channel = %self.channel, error = %e, "Consumer task failed"),
                    Some(Ok(())) => {}
                    None => {
                        warn!(channel = %self.channel, "All consumers stopped");
                        return Ok(());
                    }
                },
            }
        }

        info!(channel = %self.channel, "Draining in-flight deliveries");

        let drained = tokio::time::timeout(self.ctx.settings.shutdown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                channel = %self.channel,
                remaining = tasks.len(),
                "Shutdown timeout reached, aborting remaining deliveries"
            );
            tasks.abort_all();
        }

        info!(channel = %self.channel, "Channel worker stopped");
        Ok(())
    }

    async fn consume(
        self,
        mut source: Box<dyn MessageSource<QueueMessage>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = source.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(delivery).await,
                Some(Err(e)) => {
                    warn!(channel = %self.channel, error = %e, "Failed to receive message");
                    sleep(INFRA_FAILURE_PAUSE).await;
                }
                None => break,
            }
        }
    }

    async fn handle(&self, delivery: Delivery<QueueMessage>) {
        let message = &delivery.payload;
        let span = info_span!(
            "deliver",
            notification_id = %message.notification_id,
            channel = %self.channel,
            attempt = message.attempt,
            redelivered = delivery.redelivered,
        );

        async {
            match self.process(message).await {
                Ok(outcome) => {
                    debug!(?outcome, "Message processed");
                    if let Err(e) = delivery.ack().await {
                        warn!(error = %e, "Failed to ack message");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Delivery interrupted by infrastructure failure, requeueing");
                    sleep(INFRA_FAILURE_PAUSE).await;
                    if let Err(e) = delivery.nack(true).await {
                        warn!(error = %e, "Failed to nack message");
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Handles one queue message. Errors are infrastructure failures; the
    /// caller requeues the message.
    pub async fn process(&self, message: &QueueMessage) -> Result<Outcome, DispatchError> {
        let now = Utc::now();

        let mut record = match self.ctx.records.get(message.notification_id).await? {
            Some(record) => record,
            None => self.restore(message).await?,
        };

        if record.status.is_terminal() {
            debug!(status = %record.status, "Record is terminal, skipping");
            return Ok(Outcome::Skipped);
        }

        if record.attempt > message.attempt {
            let in_flight = record.status == NotificationStatus::Sending
                && record.attempt == message.attempt + 1;

            if !in_flight {
                debug!(record_attempt = record.attempt, "Superseded message, skipping");
                return Ok(Outcome::Skipped);
            }

            let interrupted_at =
                record.updated_at + to_chrono(self.ctx.settings.interrupted_after());
            if now < interrupted_at {
                debug!("Attempt in flight elsewhere, deferring");
                self.ctx
                    .fabric
                    .publish(&message.clone().delayed_until(interrupted_at))
                    .await?;
                return Ok(Outcome::Deferred);
            }

            warn!(
                attempt = record.attempt,
                "Previous attempt was interrupted, counting it as failed"
            );
            let error = DispatchError::Provider("attempt interrupted".to_string());
            return self.fail_attempt(&mut record, error).await;
        }

        if !message.is_due(now) {
            debug!(not_before = %message.not_before, "Message not due yet, deferring");
            self.ctx.fabric.publish(message).await?;
            return Ok(Outcome::Deferred);
        }

        let age = (now - message.request.created_at).to_std().unwrap_or_default();
        if age > self.ctx.settings.max_in_flight {
            let error = DispatchError::DeadlineExceeded(self.ctx.settings.max_in_flight);
            let expected = record.version();
            let info = ErrorInfo::from_error(&error, record.attempt);
            return self.dead_letter(&mut record, expected, info).await;
        }

        let result = {
            let record = &mut record;
            self.ctx
                .breaker
                .call(move || async move { self.attempt(record).await })
                .await
        };

        match result {
            Ok(()) => self.delivered(&mut record).await,
            Err(e @ DispatchError::CircuitOpen(_)) => self.requeue_circuit_open(&mut record, e).await,
            Err(DispatchError::StaleDelivery(_)) | Err(DispatchError::InvalidTransition { .. }) => {
                debug!("Record changed by another delivery, skipping");
                Ok(Outcome::Skipped)
            }
            Err(e @ DispatchError::ChannelDisabled { .. }) => self.opted_out(&mut record, e).await,
            Err(e) if e.is_permanent() => {
                let expected = record.version();
                let info = ErrorInfo::from_error(&e, record.attempt);
                record.record_attempt_error(info.clone())?;
                warn!(error = %e, "Permanent failure, dead-lettering");
                self.dead_letter(&mut record, expected, info).await
            }
            Err(e) if e.is_retryable() => self.fail_attempt(&mut record, e).await,
            Err(e) => Err(e),
        }
    }

    /// One guarded attempt: claim it, resolve collaborators, send.
    async fn attempt(&self, record: &mut NotificationRecord) -> Result<(), DispatchError> {
        let expected = record.version();
        let attempt = record.begin_attempt()?;

        if !self.ctx.records.update(record, expected).await? {
            return Err(DispatchError::StaleDelivery(record.notification_id));
        }

        debug!(attempt, "Attempt started");

        let limit = self.ctx.settings.collaborator_timeout;

        let user = tokio::time::timeout(limit, self.ctx.users.get_user(record.user_id()))
            .await
            .map_err(|_| DispatchError::Upstream(format!("user lookup timed out after {:?}", limit)))??;
        if !user.accepts(self.channel) {
            return Err(DispatchError::ChannelDisabled {
                user_id: user.user_id.clone(),
                channel: self.channel.to_string(),
            });
        }

        let recipient = resolve_recipient(&user, self.channel)?;

        let render = self.ctx.templates.render(
            &record.request.template_code,
            self.channel,
            &record.request.variables,
        );
        let content = tokio::time::timeout(limit, render)
            .await
            .map_err(|_| DispatchError::Upstream(format!("template render timed out after {:?}", limit)))??;

        let outbound = OutboundMessage::new(record.notification_id, self.channel, recipient, content)
            .with_data(record.request.metadata.clone());

        let timeout = self.ctx.settings.send_timeout;
        match tokio::time::timeout(timeout, self.ctx.sender.send(&outbound)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        }
    }

    async fn delivered(&self, record: &mut NotificationRecord) -> Result<Outcome, DispatchError> {
        let expected = record.version();
        record.transition(NotificationStatus::Delivered)?;

        if !self.persist(record, expected).await? {
            warn!("Record changed after a successful send");
            return Ok(Outcome::Skipped);
        }

        self.retire(record).await;
        info!(attempt = record.attempt, "Notification delivered");
        Ok(Outcome::Delivered)
    }

    async fn requeue_circuit_open(
        &self,
        record: &mut NotificationRecord,
        error: DispatchError,
    ) -> Result<Outcome, DispatchError> {
        let expected = record.version();
        record.note_error(ErrorInfo::from_error(&error, record.attempt))?;

        if !self.persist(record, expected).await? {
            return Ok(Outcome::Skipped);
        }

        let delay = self.ctx.settings.circuit_open_requeue_delay;
        let requeued = QueueMessage::for_record(record).delayed_until(Utc::now() + to_chrono(delay));
        self.ctx.fabric.publish(&requeued).await?;

        info!(
            attempt = record.attempt,
            delay_ms = delay.as_millis() as u64,
            "Circuit open, requeued without consuming an attempt"
        );
        Ok(Outcome::CircuitOpen)
    }

    async fn opted_out(
        &self,
        record: &mut NotificationRecord,
        error: DispatchError,
    ) -> Result<Outcome, DispatchError> {
        let expected = record.version();
        record.note_error(ErrorInfo::from_error(&error, record.attempt))?;
        record.transition(NotificationStatus::Failed)?;

        if !self.persist(record, expected).await? {
            return Ok(Outcome::Skipped);
        }

        self.retire(record).await;
        info!(error = %error, "Recipient opted out, notification failed");
        Ok(Outcome::Failed)
    }

    /// Records an attributed failure of the current attempt and retries or
    /// gives up.
    async fn fail_attempt(
        &self,
        record: &mut NotificationRecord,
        error: DispatchError,
    ) -> Result<Outcome, DispatchError> {
        let attempt = record.attempt;
        let expected = record.version();
        record.record_attempt_error(ErrorInfo::from_error(&error, attempt))?;

        match self.ctx.retry.next_action(attempt) {
            RetryAction::Retry(delay) => {
                record.transition(NotificationStatus::Queued)?;

                if !self.persist(record, expected).await? {
                    return Ok(Outcome::Skipped);
                }

                let retry = QueueMessage::for_record(record).delayed_until(Utc::now() + to_chrono(delay));
                let fabric = &self.ctx.fabric;
                retry_until_success(&self.ctx.settings.infra_retry, "publish retry", || {
                    fabric.publish(&retry)
                })
                .await;

                warn!(
                    attempt,
                    max_attempts = self.ctx.retry.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, retry scheduled"
                );
                Ok(Outcome::Retrying(delay))
            }
            RetryAction::GiveUp => {
                let exhausted = DispatchError::Exhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                };
                warn!(attempt, error = %error, "Retries exhausted, dead-lettering");
                let info = ErrorInfo::from_error(&exhausted, attempt);
                self.dead_letter(record, expected, info).await
            }
        }
    }

    /// Publishes the dead-letter entry (retrying until the broker takes it),
    /// then marks the record DEAD_LETTERED.
    async fn dead_letter(
        &self,
        record: &mut NotificationRecord,
        expected: RecordVersion,
        error: ErrorInfo,
    ) -> Result<Outcome, DispatchError> {
        if record.status == NotificationStatus::Pending {
            record.transition(NotificationStatus::Queued)?;
        }

        let entry = DeadLetterEntry::from_record(record, error.clone());
        let fabric = &self.ctx.fabric;
        retry_until_success(&self.ctx.settings.infra_retry, "publish dead letter", || {
            fabric.publish_dead_letter(&entry)
        })
        .await;

        record.note_error(error)?;
        record.transition(NotificationStatus::DeadLettered)?;

        if !self.persist(record, expected).await? {
            warn!(entry_id = %entry.id, "Record changed after dead-lettering");
            return Ok(Outcome::Skipped);
        }

        self.retire(record).await;
        warn!(
            entry_id = %entry.id,
            attempts = record.attempt,
            "Notification dead-lettered"
        );
        Ok(Outcome::DeadLettered)
    }

    async fn restore(&self, message: &QueueMessage) -> Result<NotificationRecord, DispatchError> {
        warn!("Record missing, restoring it from the queue message");

        let record = NotificationRecord::restore(
            message.notification_id,
            message.request.clone(),
            message.attempt,
        );

        match self.ctx.records.insert(&record).await {
            Ok(()) => Ok(record),
            Err(e) => self
                .ctx
                .records
                .get(message.notification_id)
                .await?
                .ok_or(e),
        }
    }

    async fn persist(
        &self,
        record: &NotificationRecord,
        expected: RecordVersion,
    ) -> Result<bool, DispatchError> {
        let records = &self.ctx.records;
        retry_with_backoff(&self.ctx.settings.infra_retry, || {
            records.update(record, expected)
        })
        .await
    }

    async fn retire(&self, record: &NotificationRecord) {
        if let Err(e) = self.ctx.idempotency.retire(record.request_id()).await {
            warn!(error = %e, "Failed to start idempotency retention");
        }
    }
}

fn resolve_recipient(user: &UserProfile, channel: Channel) -> Result<String, DispatchError> {
    match channel {
        Channel::Email => {
            let address = user.contact_address.as_deref().ok_or_else(|| {
                DispatchError::InvalidRecipient(format!(
                    "user {} has no contact address",
                    user.user_id
                ))
            })?;
            validate_email_address(address)?;
            Ok(address.to_string())
        }
        Channel::Push => {
            let token = user.push_token.as_deref().ok_or_else(|| {
                DispatchError::InvalidRecipient(format!("user {} has no push token", user.user_id))
            })?;
            validate_push_token(token)?;
            Ok(token.to_string())
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
