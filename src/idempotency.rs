//! Request-key deduplication for admission.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The candidate id is now bound to the request key.
    Fresh,
    /// The key was already admitted under this notification id.
    Duplicate(Uuid),
}

/// Atomic request-key registry shared by every admitting instance.
///
/// `admit` binds `request_id` to `candidate` in a single atomic write, so a
/// concurrent duplicate either wins the binding or reads the winner's id.
/// Bindings never expire until [`IdempotencyStore::retire`] is called for a
/// terminal notification; from then on they live for the retention window.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn admit(&self, request_id: &str, candidate: Uuid) -> Result<Admission, DispatchError>;

    /// Drops the binding if it still points at `notification_id`.
    async fn release(&self, request_id: &str, notification_id: Uuid) -> Result<(), DispatchError>;

    /// Starts the retention countdown once the notification is terminal.
    async fn retire(&self, request_id: &str) -> Result<(), DispatchError>;

    async fn ping(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}
