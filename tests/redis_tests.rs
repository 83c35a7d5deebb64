//! Redis-backed stores against a real server. Needs Docker:
//! `cargo test -- --ignored redis`

use std::time::Duration;

use anyhow::Result;
use notification_dispatch::{
    circuit_breaker::CircuitBreaker,
    clients::{
        circuit_breaker::RedisCircuitStore,
        redis::{RedisIdempotencyStore, connect},
    },
    error::DispatchError,
    idempotency::{Admission, IdempotencyStore},
    models::circuit_breaker::{CircuitBreakerConfig, CircuitState},
};
use redis::{AsyncCommands, aio::ConnectionManager};
use testcontainers::{
    ContainerAsync, GenericImage,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};
use uuid::Uuid;

struct RedisContext {
    connection: ConnectionManager,
    _container: ContainerAsync<GenericImage>,
}

impl RedisContext {
    async fn start() -> Result<Self> {
        let container = GenericImage::new("redis", "7.2.4")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await?;

        let port = container.get_host_port_ipv4(6379).await?;
        let connection = connect(&format!("redis://127.0.0.1:{}", port)).await?;

        Ok(Self {
            connection,
            _container: container,
        })
    }

    fn breaker(&self, name: &str, threshold: u32, open_ms: u64) -> CircuitBreaker {
        CircuitBreaker::redis(
            name,
            CircuitBreakerConfig {
                failure_threshold: threshold,
                open_duration: Duration::from_millis(open_ms),
            },
            RedisCircuitStore::new(self.connection.clone(), name),
        )
    }
}

async fn fail(breaker: &CircuitBreaker) -> Result<(), DispatchError> {
    breaker
        .call(|| async { Err::<(), _>(DispatchError::Provider("down".to_string())) })
        .await
}

/// Test: Admit binds once, release frees only the matching id, retire expires
#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_idempotency_lifecycle() -> Result<()> {
    let ctx = RedisContext::start().await?;
    let store = RedisIdempotencyStore::new(ctx.connection.clone(), Duration::from_secs(120));

    store.ping().await?;

    let first = Uuid::new_v4();
    assert_eq!(store.admit("redis-key", first).await?, Admission::Fresh);
    assert_eq!(
        store.admit("redis-key", Uuid::new_v4()).await?,
        Admission::Duplicate(first)
    );

    store.release("redis-key", Uuid::new_v4()).await?;
    assert_eq!(
        store.admit("redis-key", Uuid::new_v4()).await?,
        Admission::Duplicate(first),
        "Release with another id must not free the key"
    );

    store.release("redis-key", first).await?;
    let second = Uuid::new_v4();
    assert_eq!(store.admit("redis-key", second).await?, Admission::Fresh);

    let mut conn = ctx.connection.clone();
    let ttl: i64 = conn.ttl("idempotency:redis-key").await?;
    assert_eq!(ttl, -1, "Bound keys do not expire before retirement");

    store.retire("redis-key").await?;
    let ttl: i64 = conn.ttl("idempotency:redis-key").await?;
    assert!(ttl > 0 && ttl <= 120);

    Ok(())
}

/// Test: Breakers sharing a Redis key share one circuit
#[tokio::test]
#[ignore = "requires docker"]
async fn test_redis_circuit_shared_between_instances() -> Result<()> {
    let ctx = RedisContext::start().await?;
    let name = format!("email:{}", Uuid::new_v4());

    let worker_a = ctx.breaker(&name, 2, 100);
    let worker_b = ctx.breaker(&name, 2, 100);

    fail(&worker_a).await.ok();
    fail(&worker_b).await.ok();

    assert_eq!(worker_a.snapshot().await?.state, CircuitState::Open);
    assert!(matches!(
        worker_b.call(|| async { Ok(()) }).await,
        Err(DispatchError::CircuitOpen(_))
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;

    worker_b.call(|| async { Ok(()) }).await?;
    assert_eq!(worker_a.snapshot().await?.state, CircuitState::Closed);

    Ok(())
}
