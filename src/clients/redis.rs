use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::DispatchError,
    idempotency::{Admission, IdempotencyStore},
};

// Binds the key when absent; otherwise returns the id it is bound to.
const ADMIT_SCRIPT: &str = r#"
local existing = redis.call('GET', KEYS[1])
if existing then
    return existing
end
redis.call('SET', KEYS[1], ARGV[1])
return ''
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub async fn connect(redis_url: &str) -> Result<ConnectionManager, Error> {
    info!("Connecting to Redis...");

    let client =
        Client::open(redis_url).map_err(|e| anyhow!("Failed to create redis client: {}", e))?;

    let connection = ConnectionManager::new(client)
        .await
        .map_err(|e| anyhow!("Failed to connect to redis: {}", e))?;

    info!("Redis connection established");
    Ok(connection)
}

pub struct RedisIdempotencyStore {
    connection: ConnectionManager,
    retention: Duration,
    admit: Script,
    release: Script,
}

impl RedisIdempotencyStore {
    pub fn new(connection: ConnectionManager, retention: Duration) -> Self {
        Self {
            connection,
            retention,
            admit: Script::new(ADMIT_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn key(request_id: &str) -> String {
        format!("idempotency:{}", request_id)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn admit(&self, request_id: &str, candidate: Uuid) -> Result<Admission, DispatchError> {
        let mut conn = self.connection.clone();

        let existing: String = self
            .admit
            .key(Self::key(request_id))
            .arg(candidate.to_string())
            .invoke_async(&mut conn)
            .await?;

        if existing.is_empty() {
            return Ok(Admission::Fresh);
        }

        let notification_id = Uuid::parse_str(&existing).map_err(|e| {
            DispatchError::Internal(anyhow!(
                "Corrupt idempotency entry for {}: {}",
                request_id,
                e
            ))
        })?;

        debug!(request_id, %notification_id, "Duplicate request key");
        Ok(Admission::Duplicate(notification_id))
    }

    async fn release(&self, request_id: &str, notification_id: Uuid) -> Result<(), DispatchError> {
        let mut conn = self.connection.clone();

        let _: i64 = self
            .release
            .key(Self::key(request_id))
            .arg(notification_id.to_string())
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn retire(&self, request_id: &str) -> Result<(), DispatchError> {
        let mut conn = self.connection.clone();

        conn.expire::<_, ()>(Self::key(request_id), self.retention.as_secs() as i64)
            .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), DispatchError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
