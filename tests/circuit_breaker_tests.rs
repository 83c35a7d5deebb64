use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use notification_dispatch::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry},
    error::DispatchError,
    models::{
        circuit_breaker::{CircuitBreakerConfig, CircuitState},
        request::Channel,
    },
};

fn breaker(threshold: u32, open_ms: u64) -> CircuitBreaker {
    CircuitBreaker::local(
        "email:test",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            open_duration: Duration::from_millis(open_ms),
        },
    )
}

async fn fail(breaker: &CircuitBreaker) -> Result<(), DispatchError> {
    breaker
        .call(|| async { Err::<(), _>(DispatchError::Provider("down".to_string())) })
        .await
}

async fn succeed(breaker: &CircuitBreaker) -> Result<(), DispatchError> {
    breaker.call(|| async { Ok(()) }).await
}

/// Test: Consecutive provider failures open the circuit and reject calls
#[tokio::test]
async fn test_circuit_opens_after_threshold() -> Result<()> {
    let breaker = breaker(3, 60_000);

    for _ in 0..3 {
        assert!(matches!(fail(&breaker).await, Err(DispatchError::Provider(_))));
    }

    let snapshot = breaker.snapshot().await?;
    assert_eq!(snapshot.state, CircuitState::Open);
    assert_eq!(snapshot.consecutive_failures, 3);

    let invoked = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&invoked);
    let result = breaker
        .call(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert!(matches!(result, Err(DispatchError::CircuitOpen(ref name)) if name == "email:test"));
    assert_eq!(invoked.load(Ordering::SeqCst), 0, "Open circuit must not run the call");

    Ok(())
}

/// Test: A success resets the consecutive failure count
#[tokio::test]
async fn test_success_resets_failures() -> Result<()> {
    let breaker = breaker(3, 60_000);

    fail(&breaker).await.ok();
    fail(&breaker).await.ok();
    succeed(&breaker).await?;
    fail(&breaker).await.ok();
    fail(&breaker).await.ok();

    let snapshot = breaker.snapshot().await?;
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 2);

    Ok(())
}

/// Test: Non-provider errors do not move the breaker
#[tokio::test]
async fn test_collaborator_errors_do_not_count() -> Result<()> {
    let breaker = breaker(2, 60_000);

    for _ in 0..5 {
        let result = breaker
            .call(|| async { Err::<(), _>(DispatchError::UserNotFound("u".to_string())) })
            .await;
        assert!(result.is_err());
    }

    assert_eq!(breaker.snapshot().await?.state, CircuitState::Closed);
    Ok(())
}

/// Test: After the open period one trial call closes the circuit on success
#[tokio::test]
async fn test_trial_success_closes_circuit() -> Result<()> {
    let breaker = breaker(1, 50);

    fail(&breaker).await.ok();
    assert!(matches!(succeed(&breaker).await, Err(DispatchError::CircuitOpen(_))));

    tokio::time::sleep(Duration::from_millis(80)).await;

    succeed(&breaker).await?;
    assert_eq!(breaker.snapshot().await?.state, CircuitState::Closed);

    Ok(())
}

/// Test: A failed trial reopens the circuit for another full period
#[tokio::test]
async fn test_trial_failure_reopens_circuit() -> Result<()> {
    let breaker = breaker(1, 50);

    fail(&breaker).await.ok();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert!(matches!(fail(&breaker).await, Err(DispatchError::Provider(_))));
    assert_eq!(breaker.snapshot().await?.state, CircuitState::Open);
    assert!(matches!(succeed(&breaker).await, Err(DispatchError::CircuitOpen(_))));

    Ok(())
}

/// Test: Only one trial call is admitted while half-open
#[tokio::test]
async fn test_single_trial_while_half_open() -> Result<()> {
    let breaker = Arc::new(breaker(1, 50));

    fail(&breaker).await.ok();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let invoked = Arc::new(AtomicU32::new(0));

    let handles = (0..8).map(|_| {
        let breaker = Arc::clone(&breaker);
        let invoked = Arc::clone(&invoked);
        tokio::spawn(async move {
            breaker
                .call(|| async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                })
                .await
        })
    });

    let results = futures_util::future::join_all(handles).await;
    let rejected = results
        .into_iter()
        .filter(|r| matches!(r, Ok(Err(DispatchError::CircuitOpen(_)))))
        .count();

    assert_eq!(invoked.load(Ordering::SeqCst), 1);
    assert_eq!(rejected, 7);
    assert_eq!(breaker.snapshot().await?.state, CircuitState::Closed);

    Ok(())
}

/// Test: The registry keeps one breaker per channel and provider
#[tokio::test]
async fn test_registry_isolates_channels() -> Result<()> {
    let mut registry = CircuitBreakerRegistry::new();
    let config = CircuitBreakerConfig {
        failure_threshold: 1,
        open_duration: Duration::from_secs(60),
    };

    let email = registry.get_or_insert_with(Channel::Email, "sendgrid", |name| {
        CircuitBreaker::local(name, config.clone())
    });
    let push = registry.get_or_insert_with(Channel::Push, "fcm", |name| {
        CircuitBreaker::local(name, config.clone())
    });
    let email_again = registry.get_or_insert_with(Channel::Email, "sendgrid", |name| {
        CircuitBreaker::local(name, config.clone())
    });

    assert!(Arc::ptr_eq(&email, &email_again));
    assert_eq!(email.name(), "email:sendgrid");
    assert_eq!(registry.breakers().count(), 2);

    fail(&email).await.ok();
    assert_eq!(email.snapshot().await?.state, CircuitState::Open);
    assert_eq!(push.snapshot().await?.state, CircuitState::Closed);
    succeed(&push).await?;

    Ok(())
}
