//! Wires configured backends, collaborators and providers into the running
//! service: channel workers, the dead-letter archiver, the reconciliation
//! sweep and the HTTP API.

use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use redis::aio::ConnectionManager;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    admission::DispatchAdmission,
    api::{AppState, run_api_server},
    circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry},
    clients::{
        circuit_breaker::RedisCircuitStore,
        console::ConsoleSender,
        database::PostgresStore,
        fcm::FcmSender,
        health::HealthChecker,
        memory::{MemoryDeadLetterStore, MemoryFabric, MemoryIdempotencyStore, MemoryRecordStore},
        rbmq::RabbitMqFabric,
        redis::{RedisIdempotencyStore, connect as connect_redis},
        sendgrid::SendGridSender,
        template::HttpTemplateRenderer,
        user::HttpUserDirectory,
    },
    collaborators::{ChannelSender, TemplateRenderer, UserDirectory},
    config::{
        BreakerBackend, Config, EmailProvider, IdempotencyBackend, PushProvider, QueueBackend,
        StoreBackend,
    },
    dead_letter::{DeadLetterArchiver, DeadLetterFeed, DeadLetterStore},
    idempotency::IdempotencyStore,
    models::request::Channel,
    queue::QueueFabric,
    reconcile::ReconciliationSweep,
    records::RecordStore,
    retry::RetryScheduler,
    worker::{ChannelWorker, WorkerContext},
};

/// Storage and messaging backends selected by configuration.
#[derive(Clone)]
pub struct Backends {
    pub records: Arc<dyn RecordStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub fabric: Arc<dyn QueueFabric>,
    pub redis: Option<ConnectionManager>,
}

impl Backends {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let needs_redis = config.idempotency_backend == IdempotencyBackend::Redis
            || config.circuit_breaker_backend == BreakerBackend::Redis;

        let redis = if needs_redis {
            Some(connect_redis(&config.redis_url).await?)
        } else {
            None
        };

        let (records, dead_letters): (Arc<dyn RecordStore>, Arc<dyn DeadLetterStore>) =
            match config.store_backend {
                StoreBackend::Postgres => {
                    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
                    (store.clone(), store)
                }
                StoreBackend::Memory => {
                    warn!("Using in-memory record store; records are lost on restart");
                    (
                        Arc::new(MemoryRecordStore::new()),
                        Arc::new(MemoryDeadLetterStore::new()),
                    )
                }
            };

        let idempotency: Arc<dyn IdempotencyStore> = match (&config.idempotency_backend, &redis) {
            (IdempotencyBackend::Redis, Some(connection)) => Arc::new(RedisIdempotencyStore::new(
                connection.clone(),
                config.idempotency_retention(),
            )),
            (IdempotencyBackend::Redis, None) => {
                return Err(anyhow!("Redis idempotency store requires a redis connection"));
            }
            (IdempotencyBackend::Memory, _) => {
                Arc::new(MemoryIdempotencyStore::new(config.idempotency_retention()))
            }
        };

        let fabric: Arc<dyn QueueFabric> = match config.queue_backend {
            QueueBackend::Rabbitmq => Arc::new(RabbitMqFabric::connect(config).await?),
            QueueBackend::Memory => {
                warn!("Using in-memory queue fabric; this process must run both API and workers");
                Arc::new(MemoryFabric::new())
            }
        };

        Ok(Self {
            records,
            dead_letters,
            idempotency,
            fabric,
            redis,
        })
    }
}

/// Provider senders keyed by channel.
pub async fn build_senders(config: &Config) -> Result<Vec<(Channel, Arc<dyn ChannelSender>)>, Error> {
    let timeout = Duration::from_millis(config.send_timeout_ms);

    let email: Arc<dyn ChannelSender> = match config.email_provider {
        EmailProvider::Sendgrid => {
            let api_key = config
                .sendgrid_api_key
                .as_deref()
                .ok_or_else(|| anyhow!("SENDGRID_API_KEY is not set"))?;
            Arc::new(SendGridSender::new(
                &config.sendgrid_base_url,
                api_key,
                &config.email_from,
                timeout,
            )?)
        }
        EmailProvider::Console => Arc::new(ConsoleSender),
    };

    let push: Arc<dyn ChannelSender> = match config.push_provider {
        PushProvider::Fcm => {
            let project_id = config
                .fcm_project_id
                .as_deref()
                .ok_or_else(|| anyhow!("FCM_PROJECT_ID is not set"))?;
            Arc::new(FcmSender::new(project_id, timeout).await?)
        }
        PushProvider::Console => Arc::new(ConsoleSender),
    };

    Ok(vec![(Channel::Email, email), (Channel::Push, push)])
}

/// One breaker per (channel, provider), local or shared through Redis.
pub fn build_breakers(
    config: &Config,
    senders: &[(Channel, Arc<dyn ChannelSender>)],
    redis: Option<&ConnectionManager>,
) -> Result<CircuitBreakerRegistry, Error> {
    let mut registry = CircuitBreakerRegistry::new();
    let breaker_config = config.circuit_breaker_config();

    for (channel, sender) in senders {
        let breaker = match (&config.circuit_breaker_backend, redis) {
            (BreakerBackend::Local, _) => {
                let cfg = breaker_config.clone();
                registry.get_or_insert_with(*channel, sender.provider_name(), |name| {
                    CircuitBreaker::local(name, cfg)
                })
            }
            (BreakerBackend::Redis, Some(connection)) => {
                let cfg = breaker_config.clone();
                registry.get_or_insert_with(*channel, sender.provider_name(), |name| {
                    let store = RedisCircuitStore::new(connection.clone(), &name);
                    CircuitBreaker::redis(name, cfg, store)
                })
            }
            (BreakerBackend::Redis, None) => {
                return Err(anyhow!("Shared circuit breakers require a redis connection"));
            }
        };
        info!(breaker = breaker.name(), "Circuit breaker registered");
    }

    Ok(registry)
}

/// Runs every configured component until ctrl-c, then drains them.
pub async fn run(config: Config) -> Result<(), Error> {
    let backends = Backends::connect(&config).await?;
    let senders = build_senders(&config).await?;
    let registry = build_breakers(&config, &senders, backends.redis.as_ref())?;

    let collaborator_timeout = config.collaborator_timeout();
    let users: Arc<dyn UserDirectory> = Arc::new(HttpUserDirectory::new(
        &config.user_service_url,
        collaborator_timeout,
    )?);
    let templates: Arc<dyn TemplateRenderer> = Arc::new(HttpTemplateRenderer::new(
        &config.template_service_url,
        collaborator_timeout,
    )?);

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();

    if config.run_workers {
        for (channel, sender) in &senders {
            let breaker = registry
                .get(*channel, sender.provider_name())
                .ok_or_else(|| anyhow!("No circuit breaker for {} channel", channel))?;

            let worker = ChannelWorker::new(
                *channel,
                WorkerContext {
                    records: backends.records.clone(),
                    fabric: backends.fabric.clone(),
                    idempotency: backends.idempotency.clone(),
                    users: users.clone(),
                    templates: templates.clone(),
                    sender: sender.clone(),
                    breaker,
                    retry: RetryScheduler::new(config.retry_config()),
                    settings: config.worker_settings(),
                },
            );

            let token = shutdown.clone();
            tasks.spawn(async move { worker.run(token).await.map_err(Error::from) });
        }

        let archiver = DeadLetterArchiver::new(
            backends.fabric.clone(),
            backends.dead_letters.clone(),
            config.retry_config(),
        );
        let token = shutdown.clone();
        tasks.spawn(async move { archiver.run(token).await.map_err(Error::from) });
    }

    let admission = DispatchAdmission::new(
        backends.idempotency.clone(),
        backends.records.clone(),
        backends.fabric.clone(),
    )
    .with_confirm_timeout(config.admission_confirm_timeout());

    if config.run_api {
        let sweep = ReconciliationSweep::new(
            backends.records.clone(),
            backends.fabric.clone(),
            config.reconcile_interval(),
            config.reconcile_grace(),
        );
        let token = shutdown.clone();
        tasks.spawn(async move {
            sweep.run(token).await;
            Ok(())
        });

        let state = Arc::new(AppState {
            admission: admission.clone(),
            dead_letters: DeadLetterFeed::new(backends.dead_letters.clone(), admission),
            health_checker: HealthChecker::new(
                backends.records.clone(),
                backends.idempotency.clone(),
                backends.fabric.clone(),
                registry.breakers().cloned().collect(),
            ),
        });
        let port = config.server_port;
        let token = shutdown.clone();
        tasks.spawn(async move { run_api_server(state, port, token).await });
    }

    info!(
        run_api = config.run_api,
        run_workers = config.run_workers,
        "Notification dispatch started"
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let mut failed = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Component failed, shutting down");
                shutdown.cancel();
                failed.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "Component task panicked, shutting down");
                shutdown.cancel();
                failed.get_or_insert(anyhow!("component task panicked: {}", e));
            }
        }
    }

    info!("Notification dispatch stopped");

    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
