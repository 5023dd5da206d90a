//! In-process dispatch bus on a bounded tokio channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, warn};
use tokio::sync::{Mutex, Notify, mpsc, watch};

use super::{DeadLetter, Delivery, DispatchBus, Subscription};
use crate::error::{AppError, Result};
use crate::models::{DispatchConfig, DispatchMessage};

struct Inner {
    config: DispatchConfig,
    sender: mpsc::Sender<Delivery>,
    receiver: Mutex<mpsc::Receiver<Delivery>>,
    closed: watch::Sender<bool>,
    next_id: AtomicU64,
    /// Accepted but not yet acked or dead-lettered
    outstanding: AtomicUsize,
    idle: Notify,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl Inner {
    fn settle(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn dead_letter(&self, delivery: Delivery, reason: &str) {
        error!(
            "Dead-lettering {} after {} attempts: {}",
            delivery.message, delivery.attempt, reason
        );
        self.dead_letters.lock().await.push(DeadLetter {
            message: delivery.message,
            attempts: delivery.attempt,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        });
        self.settle();
    }
}

/// Work-queue bus: one shared receiver, so each delivery goes to exactly
/// one subscriber.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new(config: DispatchConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                sender,
                receiver: Mutex::new(receiver),
                closed,
                next_id: AtomicU64::new(1),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                dead_letters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Messages accepted and not yet settled.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every accepted message is acked or dead-lettered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting messages; subscribers finish once the queue is empty.
    pub fn close(&self) {
        self.inner.closed.send_replace(true);
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().await.clone()
    }
}

#[async_trait]
impl DispatchBus for MemoryBus {
    async fn publish(&self, message: DispatchMessage) -> Result<()> {
        let attempts = self.inner.config.publish_attempts.max(1);
        if *self.inner.closed.borrow() {
            return Err(AppError::delivery(&message.identity, 0, "bus is closed"));
        }

        let delivery = Delivery {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            message,
            attempt: 1,
        };
        let timeout = self.inner.config.publish_timeout();

        // Counted before sending so a fast consumer cannot settle it first.
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, self.inner.sender.send(delivery.clone())).await {
                Ok(Ok(())) => {
                    debug!("Published {} (#{})", delivery.message, delivery.id);
                    return Ok(());
                }
                Ok(Err(_)) => break,
                Err(_) => warn!(
                    "Dispatch queue full publishing {} (attempt {}/{})",
                    delivery.message, attempt, attempts
                ),
            }
        }

        self.inner.settle();
        Err(AppError::delivery(
            &delivery.message.identity,
            attempts,
            "dispatch queue did not accept the message",
        ))
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(MemorySubscription {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemorySubscription {
    inner: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        let mut closed = self.inner.closed.subscribe();
        let mut receiver = self.inner.receiver.lock().await;
        if let Ok(delivery) = receiver.try_recv() {
            return Some(delivery);
        }
        if *closed.borrow_and_update() {
            return None;
        }
        tokio::select! {
            delivery = receiver.recv() => delivery,
            _ = closed.wait_for(|c| *c) => receiver.try_recv().ok(),
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        debug!("Acked {} (#{})", delivery.message, delivery.id);
        self.inner.settle();
        Ok(())
    }

    async fn nack(&mut self, delivery: Delivery, reason: &str) -> Result<()> {
        if delivery.attempt >= self.inner.config.max_delivery_attempts.max(1) {
            self.inner.dead_letter(delivery, reason).await;
            return Ok(());
        }

        warn!(
            "Redelivering {} (attempt {} failed: {})",
            delivery.message, delivery.attempt, reason
        );
        let inner = Arc::clone(&self.inner);
        let delay = inner.config.redelivery_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let retry = Delivery {
                attempt: delivery.attempt + 1,
                ..delivery
            };
            if let Err(mpsc::error::SendError(lost)) = inner.sender.send(retry).await {
                inner.dead_letter(lost, "bus shut down before redelivery").await;
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Identity;
    use std::time::Duration;

    fn config() -> DispatchConfig {
        DispatchConfig {
            queue_capacity: 2,
            publish_attempts: 2,
            publish_timeout_ms: 10,
            max_delivery_attempts: 2,
            redelivery_delay_ms: 1,
            ..DispatchConfig::default()
        }
    }

    fn msg(name: &str) -> DispatchMessage {
        DispatchMessage::discovered(Identity::new(crate::models::RegistryKind::Npm, name).unwrap())
    }

    #[tokio::test]
    async fn test_publish_deliver_ack() {
        let bus = MemoryBus::new(config());
        let mut sub = bus.subscribe().await.unwrap();

        bus.publish(msg("a")).await.unwrap();
        assert_eq!(bus.outstanding(), 1);

        let delivery = sub.next().await.unwrap();
        assert_eq!(delivery.message, msg("a"));
        assert_eq!(delivery.attempt, 1);
        sub.ack(&delivery).await.unwrap();

        bus.wait_idle().await;
        assert_eq!(bus.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_surfaces_delivery_error() {
        let bus = MemoryBus::new(config());
        bus.publish(msg("a")).await.unwrap();
        bus.publish(msg("b")).await.unwrap();

        let err = bus.publish(msg("c")).await.unwrap_err();
        assert!(matches!(err, AppError::DispatchDelivery { attempts: 2, .. }));
        assert_eq!(bus.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_nack_redelivers_then_dead_letters() {
        let bus = MemoryBus::new(config());
        let mut sub = bus.subscribe().await.unwrap();
        bus.publish(msg("flaky")).await.unwrap();

        let first = sub.next().await.unwrap();
        sub.nack(first, "boom").await.unwrap();

        let second = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.attempt, 2);
        sub.nack(second, "boom again").await.unwrap();

        bus.wait_idle().await;
        let dead = bus.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert_eq!(dead[0].reason, "boom again");
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_after_drain() {
        let bus = MemoryBus::new(config());
        let mut sub = bus.subscribe().await.unwrap();
        bus.publish(msg("last")).await.unwrap();
        bus.close();

        assert!(bus.publish(msg("late")).await.is_err());
        let delivery = sub.next().await.unwrap();
        sub.ack(&delivery).await.unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_each_delivery_reaches_one_subscriber() {
        let bus = MemoryBus::new(DispatchConfig::default());
        let mut a = bus.subscribe().await.unwrap();
        let mut b = bus.subscribe().await.unwrap();
        bus.publish(msg("x")).await.unwrap();
        bus.publish(msg("y")).await.unwrap();

        let first = a.next().await.unwrap();
        let second = b.next().await.unwrap();
        assert_ne!(first.id, second.id);
        bus.close();
        assert!(a.next().await.is_none());
    }
}
