//! Delivery scheduler moving outbox messages to the broker.
//!
//! Each tick runs in one store transaction:
//!
//! - Take the oldest pending message
//! - Publish it through a [`Transport`]
//! - Commit when the broker confirmed it, roll back otherwise
//!
//! The rollback puts the message back, so a failed delivery is retried by a
//! later tick. Delivery is at-least-once: a confirm lost after the broker
//! stored the message leads to a redelivery with the same message id.
//!
//! [`Scheduler::run`] ticks with a fixed delay between the end of one tick
//! and the start of the next until a [`CancellationToken`] is triggered.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    OutboxError, OutboxMessage,
    outbox::{DeliveryFailure, TakeMessages},
    transport::Transport,
};

/// Timer settings of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Wait before the first tick.
    pub initial_delay: Duration,
    /// Wait between the completion of a tick and the next one.
    pub fixed_delay: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            fixed_delay: Duration::from_millis(1000),
        }
    }
}

/// Result of a successful tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// The store was empty.
    Idle,
    /// The message was confirmed by the broker and removed from the store.
    Delivered(OutboxMessage),
}

/// Outbox delivery scheduler.
///
/// Generic parameters:
/// - `S`: Outbox store
/// - `HK`: Hook implementation for lifecycle events
/// - `T`: Transport service type
pub struct Scheduler<S, HK, T> {
    store: S,
    transport: Transport<T>,
    hook: HK,
    schedule: Schedule,
}

impl<S, T> Scheduler<S, DefaultSchedulerHook, T>
where
    S: TakeMessages,
{
    /// Create a new scheduler with the default hook implementation.
    pub fn new(store: S, transport: Transport<T>, schedule: Schedule) -> Self {
        Self {
            store,
            transport,
            hook: DefaultSchedulerHook,
            schedule,
        }
    }
}

impl<S, HK, T> Scheduler<S, HK, T>
where
    S: TakeMessages,
    HK: SchedulerHook,
    T: Service<OutboxMessage, Response = bool> + Send,
    T::Future: Send,
    T::Error: Into<tower::BoxError>,
{
    /// Replace the scheduler hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: SchedulerHook>(self, hook: HK2) -> Scheduler<S, HK2, T> {
        Scheduler {
            store: self.store,
            transport: self.transport,
            hook,
            schedule: self.schedule,
        }
    }

    /// Deliver at most one message.
    ///
    /// The take and the publish share one transaction. A negative confirm or
    /// a transport error rolls it back, restoring the message, and is
    /// returned as a delivery error. The scheduler never retries inside a
    /// tick.
    #[tracing::instrument(skip(self))]
    pub async fn tick(&mut self) -> Result<Tick, OutboxError> {
        let mut tx = self.store.begin().await.map_err(OutboxError::store)?;

        let message = match self.store.take_one(&mut tx).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.store.commit(tx).await.map_err(OutboxError::store)?;
                return Ok(Tick::Idle);
            }
            Err(err) => {
                Self::rollback(&self.store, &self.hook, tx).await;
                return Err(OutboxError::store(err));
            }
        };

        self.hook.on_message_taken(&message);

        let failure = match self.transport.publish(message.clone()).await {
            Ok(true) => {
                self.store.commit(tx).await.map_err(OutboxError::store)?;
                self.hook.on_message_delivered(&message);
                return Ok(Tick::Delivered(message));
            }
            Ok(false) => DeliveryFailure::NotConfirmed { id: message.id },
            Err(source) => DeliveryFailure::Transport {
                id: message.id,
                source,
            },
        };

        Self::rollback(&self.store, &self.hook, tx).await;
        Err(OutboxError::delivery(failure))
    }

    async fn rollback(store: &S, hook: &HK, tx: S::Transaction) {
        if let Err(err) = store.rollback(tx).await {
            let err: tower::BoxError = err.into();
            hook.on_rollback_error(&*err);
        }
    }

    /// Run the scheduler loop.
    ///
    /// Waits the initial delay, then ticks with the fixed delay until the
    /// token is cancelled. Tick failures are reported to the hook and never
    /// end the loop. Cancellation is only observed between ticks, so a
    /// running tick always commits or rolls back.
    #[tracing::instrument(skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        self.hook.on_startup();

        let mut delay = self.schedule.initial_delay;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    break;
                }
                _ = tokio::time::sleep(delay) => {
                    match self.tick().await {
                        Ok(Tick::Idle) => self.hook.on_idle(),
                        Ok(Tick::Delivered(_)) => {}
                        Err(err) => self.hook.on_tick_error(&err),
                    }
                }
            }
            delay = self.schedule.fixed_delay;
        }
    }
}

/// Hook trait for observing scheduler lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
pub trait SchedulerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_idle(&self);
    fn on_message_taken(&self, message: &OutboxMessage);
    fn on_message_delivered(&self, message: &OutboxMessage);
    fn on_tick_error(&self, error: &OutboxError);
    fn on_rollback_error(&self, error: &(dyn std::error::Error + Send + Sync));
}

/// Default scheduler hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultSchedulerHook;

impl SchedulerHook for DefaultSchedulerHook {
    fn on_startup(&self) {
        tracing::info!("Scheduler is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Scheduler is shutting down");
    }

    fn on_idle(&self) {
        tracing::trace!("No pending messages");
    }

    fn on_message_taken(&self, message: &OutboxMessage) {
        tracing::debug!(id = %message.id, seq = message.seq, "Message taken");
    }

    fn on_message_delivered(&self, message: &OutboxMessage) {
        tracing::trace!(id = %message.id, "Message was sent to RabbitMQ");
    }

    fn on_tick_error(&self, error: &OutboxError) {
        if error.is_retryable() {
            tracing::warn!(%error, "Delivery failed, retrying on next tick");
        } else {
            tracing::error!(%error, "Delivery failed");
        }
    }

    fn on_rollback_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        tracing::error!(%error, "Failed to roll back delivery transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        OutboxErrorKind,
        outbox::{Outbox, inmemory::InMemoryOutbox},
        transport::{InMemory, Outcome},
    };
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    const PAYLOAD: &[u8] = br#"{"id":"C1","name":"Acme"}"#;

    async fn store_with(id: &str, payload: &[u8]) -> InMemoryOutbox {
        let outbox = Outbox::new(InMemoryOutbox::default());
        let mut tx = outbox.begin().await.unwrap();
        outbox.enqueue(id, payload, &mut tx).await.unwrap();
        outbox.commit(tx).await.unwrap();
        outbox.driver().clone()
    }

    fn scheduler(
        store: &InMemoryOutbox,
        sender: &InMemory,
    ) -> Scheduler<
        InMemoryOutbox,
        DefaultSchedulerHook,
        crate::transport::SenderService<InMemory>,
    > {
        Scheduler::new(
            store.clone(),
            Transport::new(sender.clone()),
            Schedule {
                initial_delay: Duration::from_millis(10),
                fixed_delay: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn empty_store_ticks_idle() {
        let store = InMemoryOutbox::default();
        let sender = InMemory::confirming();

        let tick = scheduler(&store, &sender).tick().await.unwrap();

        assert_eq!(tick, Tick::Idle);
        assert_eq!(sender.calls(), 0);
    }

    #[tokio::test]
    async fn confirmed_delivery_removes_message() {
        let store = store_with("C1", PAYLOAD).await;
        let sender = InMemory::confirming();

        let tick = scheduler(&store, &sender).tick().await.unwrap();

        assert!(matches!(tick, Tick::Delivered(ref m) if m.id() == "C1"));
        assert!(store.is_empty());
        assert_eq!(sender.calls(), 1);
        assert_eq!(sender.sent_messages()[0].payload(), PAYLOAD);
    }

    #[tokio::test]
    async fn negative_confirm_restores_message() {
        let store = store_with("C1", PAYLOAD).await;
        let before = store.pending();
        let sender = InMemory::rejecting();

        let err = scheduler(&store, &sender).tick().await.unwrap_err();

        assert!(matches!(
            err.kind(),
            OutboxErrorKind::Delivery(DeliveryFailure::NotConfirmed { id }) if id == "C1"
        ));
        assert!(err.is_retryable());
        assert_eq!(store.pending(), before);
    }

    #[tokio::test]
    async fn transport_error_restores_message() {
        let store = store_with("C1", PAYLOAD).await;
        let sender = InMemory::failing();

        let err = scheduler(&store, &sender).tick().await.unwrap_err();

        assert!(matches!(
            err.kind(),
            OutboxErrorKind::Delivery(DeliveryFailure::Transport { .. })
        ));
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending()[0].payload(), PAYLOAD);
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_by_next_tick() {
        let store = store_with("C1", PAYLOAD).await;
        let sender = InMemory::confirming();
        sender.then(Outcome::Reject);
        let mut scheduler = scheduler(&store, &sender);

        assert!(scheduler.tick().await.is_err());
        let pending = store.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id(), "C1");
        assert_eq!(pending[0].payload(), PAYLOAD);

        assert!(matches!(scheduler.tick().await.unwrap(), Tick::Delivered(_)));
        assert!(store.is_empty());
        assert_eq!(sender.calls(), 2);
    }

    #[tokio::test]
    async fn one_message_per_tick_in_queue_order() {
        let store = store_with("C1", b"first").await;
        {
            let outbox = Outbox::new(store.clone());
            let mut tx = outbox.begin().await.unwrap();
            outbox.enqueue("C2", b"second", &mut tx).await.unwrap();
            outbox.commit(tx).await.unwrap();
        }
        let sender = InMemory::confirming();
        let mut scheduler = scheduler(&store, &sender);

        scheduler.tick().await.unwrap();
        assert_eq!(store.len(), 1);
        scheduler.tick().await.unwrap();

        let ids: Vec<_> = sender
            .sent_messages()
            .iter()
            .map(|m| m.id().to_owned())
            .collect();
        assert_eq!(ids, ["C1", "C2"]);
    }

    #[derive(Clone, Default)]
    struct CountingHook {
        delivered: Arc<AtomicUsize>,
        errors: Arc<AtomicUsize>,
    }

    impl SchedulerHook for CountingHook {
        fn on_startup(&self) {}
        fn on_shutdown(&self) {}
        fn on_idle(&self) {}
        fn on_message_taken(&self, _message: &OutboxMessage) {}
        fn on_message_delivered(&self, _message: &OutboxMessage) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        fn on_tick_error(&self, _error: &OutboxError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
        fn on_rollback_error(&self, _error: &(dyn std::error::Error + Send + Sync)) {}
    }

    #[tokio::test]
    async fn run_delivers_and_stops_on_cancel() {
        let store = store_with("C1", PAYLOAD).await;
        let sender = InMemory::confirming();
        let hook = CountingHook::default();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            scheduler(&store, &sender)
                .with_hook(hook.clone())
                .run(cancel.clone()),
        );

        while !store.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sender.calls(), 1);
        assert_eq!(sender.sent_messages()[0].payload(), PAYLOAD);
        assert_eq!(hook.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_survives_failed_deliveries() {
        let store = store_with("C1", PAYLOAD).await;
        let sender = InMemory::failing();
        let hook = CountingHook::default();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            scheduler(&store, &sender)
                .with_hook(hook.clone())
                .run(cancel.clone()),
        );

        while hook.errors.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.len(), 1);

        sender.set_default(Outcome::Confirm);
        while !store.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(hook.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_initial_delay_skips_ticks() {
        let store = store_with("C1", PAYLOAD).await;
        let sender = InMemory::confirming();
        let cancel = CancellationToken::new();
        cancel.cancel();

        scheduler(&store, &sender).run(cancel).await;

        assert_eq!(sender.calls(), 0);
        assert_eq!(store.len(), 1);
    }
}
