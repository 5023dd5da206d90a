//! Dispatch bus: at-least-once hand-off from detection to crawling.
//!
//! Consumers must tolerate duplicates and any delivery order. A delivery
//! that is neither acked nor nacked is not redelivered by the in-memory
//! bus; reconciliation picks the identity up again.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::DispatchMessage;

pub use memory::MemoryBus;

/// One delivery of a message to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub message: DispatchMessage,
    /// 1 on first delivery
    pub attempt: u32,
}

/// A message the bus gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: DispatchMessage,
    pub attempts: u32,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait DispatchBus: Send + Sync {
    /// Hand a message to the bus. `Ok` means it was accepted for delivery.
    async fn publish(&self, message: DispatchMessage) -> Result<()>;

    /// Join the shared work queue; each delivery reaches one subscriber.
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` once the bus is closed and empty.
    async fn next(&mut self) -> Option<Delivery>;

    /// Processing finished; the message will not be delivered again.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Processing failed; redeliver later or dead-letter after the last attempt.
    async fn nack(&mut self, delivery: Delivery, reason: &str) -> Result<()>;
}
