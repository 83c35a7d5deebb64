use chrono::Utc;
use redis::{Script, aio::ConnectionManager};

use crate::{
    circuit_breaker::{CallOutcome, Permit},
    error::DispatchError,
    models::circuit_breaker::{CircuitBreakerConfig, CircuitState},
};

// Returns 0 = reject, 1 = normal permit, 2 = trial permit.
const ACQUIRE_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state') or 'closed'
local now = tonumber(ARGV[1])
local open_ms = tonumber(ARGV[2])

if state == 'closed' then
    return 1
end

if state == 'open' then
    local opened_at = tonumber(redis.call('HGET', KEYS[1], 'opened_at') or '0')
    if now - opened_at < open_ms then
        return 0
    end
else
    local trial_at = redis.call('HGET', KEYS[1], 'trial_at')
    if trial_at and now - tonumber(trial_at) < open_ms then
        return 0
    end
end

redis.call('HSET', KEYS[1], 'state', 'half_open', 'trial_at', now)
return 2
"#;

// Returns the new state when it changed, '' otherwise.
const RECORD_SCRIPT: &str = r#"
local state = redis.call('HGET', KEYS[1], 'state') or 'closed'
local outcome = ARGV[1]
local trial = ARGV[2] == '1'
local now = ARGV[3]
local threshold = tonumber(ARGV[4])

if trial and state == 'half_open' then
    if outcome == 'success' then
        redis.call('HSET', KEYS[1], 'state', 'closed', 'failures', 0)
        redis.call('HDEL', KEYS[1], 'opened_at', 'trial_at')
        return 'closed'
    elseif outcome == 'failure' then
        redis.call('HSET', KEYS[1], 'state', 'open', 'opened_at', now)
        redis.call('HDEL', KEYS[1], 'trial_at')
        return 'open'
    end
    redis.call('HDEL', KEYS[1], 'trial_at')
    return ''
end

if (not trial) and state == 'closed' then
    if outcome == 'success' then
        redis.call('HSET', KEYS[1], 'failures', 0)
    elseif outcome == 'failure' then
        local failures = redis.call('HINCRBY', KEYS[1], 'failures', 1)
        if failures >= threshold then
            redis.call('HSET', KEYS[1], 'state', 'open', 'opened_at', now)
            return 'open'
        end
    end
end

return ''
"#;

/// Breaker state kept in a Redis hash (`circuit:{channel}:{provider}`) so
/// every worker process sees the same circuit. Each check-and-transition runs
/// as a single Lua script.
#[derive(Clone)]
pub struct RedisCircuitStore {
    connection: ConnectionManager,
    key: String,
    acquire: Script,
    record: Script,
}

impl RedisCircuitStore {
    pub fn new(connection: ConnectionManager, breaker_name: &str) -> Self {
        Self {
            connection,
            key: format!("circuit:{}", breaker_name),
            acquire: Script::new(ACQUIRE_SCRIPT),
            record: Script::new(RECORD_SCRIPT),
        }
    }

    pub async fn try_acquire(
        &self,
        config: &CircuitBreakerConfig,
    ) -> Result<Option<Permit>, DispatchError> {
        let mut conn = self.connection.clone();

        let granted: i64 = self
            .acquire
            .key(&self.key)
            .arg(Utc::now().timestamp_millis())
            .arg(config.open_duration.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        Ok(match granted {
            0 => None,
            2 => Some(Permit { trial: true }),
            _ => Some(Permit { trial: false }),
        })
    }

    pub async fn record(
        &self,
        permit: Permit,
        outcome: CallOutcome,
        config: &CircuitBreakerConfig,
    ) -> Result<Option<CircuitState>, DispatchError> {
        let mut conn = self.connection.clone();

        let changed: String = self
            .record
            .key(&self.key)
            .arg(outcome.as_str())
            .arg(if permit.trial { "1" } else { "0" })
            .arg(Utc::now().timestamp_millis())
            .arg(config.failure_threshold)
            .invoke_async(&mut conn)
            .await?;

        Ok((!changed.is_empty()).then(|| CircuitState::from_string(&changed)))
    }

    pub async fn load(&self) -> Result<(CircuitState, u32), DispatchError> {
        let mut conn = self.connection.clone();

        let (state, failures): (Option<String>, Option<u32>) = redis::cmd("HMGET")
            .arg(&self.key)
            .arg("state")
            .arg("failures")
            .query_async(&mut conn)
            .await?;

        Ok((
            state
                .map(|s| CircuitState::from_string(&s))
                .unwrap_or(CircuitState::Closed),
            failures.unwrap_or(0),
        ))
    }
}
