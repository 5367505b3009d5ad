use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mediator_core::{Exchange, MediationError, Message};
use tokio::sync::oneshot;

use super::pending::PendingReply;
use super::table::{
    CorrelationCallback, DeliveryOutcome, PendingEntry, PendingTable, ReplySlot,
};
use crate::component::{Consumer, ExchangeHandler};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

// ---------------------------------------------------------------------------
// ReplyDispatcher
// ---------------------------------------------------------------------------

/// Handler attached to reply destinations. Hands each inbound message to
/// the pending table by correlation id.
struct ReplyDispatcher {
    table: Arc<PendingTable>,
}

#[async_trait]
impl ExchangeHandler for ReplyDispatcher {
    async fn on_exchange(&self, exchange: Exchange) -> Exchange {
        self.table.deliver(exchange.message().clone());
        exchange
    }
}

// ---------------------------------------------------------------------------
// Sweeper
// ---------------------------------------------------------------------------

/// On-demand sweep; replies with the number of expired entries.
pub struct SweepNow(pub oneshot::Sender<usize>);

/// Expires callback requests whose deadline passed. Blocking waiters time
/// themselves out; the sweep covers them too if it gets there first.
struct CorrelationSweeper {
    table: Arc<PendingTable>,
}

impl CorrelationSweeper {
    fn sweep(&self) -> usize {
        let expired = self.table.expire(tokio::time::Instant::now());
        if expired > 0 {
            tracing::debug!(expired, "expired pending requests");
        }
        expired
    }
}

#[async_trait]
impl BackgroundRunnable for CorrelationSweeper {
    type Task = SweepNow;

    fn name(&self) -> &'static str {
        "correlation-sweeper"
    }

    async fn run(&mut self, task: SweepNow) {
        let _ = task.0.send(self.sweep());
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

// ---------------------------------------------------------------------------
// CorrelationManager
// ---------------------------------------------------------------------------

/// Matches asynchronous replies to the requests waiting for them.
///
/// Correlation ids are `<prefix>-<n>`: a random prefix per manager and a
/// monotonic counter, so ids never repeat within one manager and collide
/// across managers only with negligible probability.
pub struct CorrelationManager {
    table: Arc<PendingTable>,
    prefix: String,
    counter: AtomicU64,
    reply_consumers: DashMap<String, Box<dyn Consumer>>,
    reply_setup: tokio::sync::Mutex<()>,
    sweeper: parking_lot::Mutex<Option<BackgroundWorker<CorrelationSweeper>>>,
}

impl CorrelationManager {
    #[must_use]
    pub fn new() -> Self {
        let mut prefix = uuid::Uuid::new_v4().simple().to_string();
        prefix.truncate(12);
        Self {
            table: Arc::new(PendingTable::default()),
            prefix,
            counter: AtomicU64::new(0),
            reply_consumers: DashMap::new(),
            reply_setup: tokio::sync::Mutex::new(()),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn next_correlation_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{n}", self.prefix)
    }

    /// Registers a blocking request. The entry exists before this returns.
    pub fn register(&self, reply_to: &str, timeout: Duration) -> PendingReply {
        let correlation_id = self.next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.table.insert(
            correlation_id.clone(),
            PendingEntry::new(ReplySlot::Waiter(tx), reply_to.to_string(), timeout),
        );
        PendingReply::new(correlation_id, timeout, rx, Arc::clone(&self.table))
    }

    /// Registers an asynchronous request completed through `callback`,
    /// exactly once: with the reply, a timeout (via the sweeper) or a
    /// cancellation. Returns the correlation id.
    pub fn register_callback(
        &self,
        reply_to: &str,
        timeout: Duration,
        callback: CorrelationCallback,
    ) -> String {
        let correlation_id = self.next_correlation_id();
        self.table.insert(
            correlation_id.clone(),
            PendingEntry::new(
                ReplySlot::Callback(parking_lot::Mutex::new(callback)),
                reply_to.to_string(),
                timeout,
            ),
        );
        correlation_id
    }

    /// Hands an inbound reply to its waiting request.
    pub fn deliver(&self, reply: Message) -> DeliveryOutcome {
        self.table.deliver(reply)
    }

    /// Cancels a pending request. False if it already completed.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.fail(
            correlation_id,
            MediationError::Cancelled {
                correlation_id: correlation_id.to_string(),
            },
        )
    }

    /// Completes a pending request with `error`, e.g. when transmitting the
    /// request failed. False if it already completed.
    pub fn fail(&self, correlation_id: &str, error: MediationError) -> bool {
        self.table.fail(correlation_id, error)
    }

    /// Handler to attach to a reply destination's consumer.
    #[must_use]
    pub fn dispatcher(&self) -> Arc<dyn ExchangeHandler> {
        Arc::new(ReplyDispatcher {
            table: Arc::clone(&self.table),
        })
    }

    #[must_use]
    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.table.contains(correlation_id)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn completed_replies(&self) -> u64 {
        self.table.completed()
    }

    #[must_use]
    pub fn orphaned_replies(&self) -> u64 {
        self.table.orphaned()
    }

    #[must_use]
    pub fn timed_out_requests(&self) -> u64 {
        self.table.timed_out()
    }

    // -- exclusive reply consumers --------------------------------------------

    /// Starts the long-lived reply consumer for `reply_to` unless one is
    /// already running. `create` receives the dispatcher to attach.
    ///
    /// # Errors
    ///
    /// Propagates consumer creation or start failures.
    pub async fn ensure_reply_consumer<F>(
        &self,
        reply_to: &str,
        create: F,
    ) -> Result<(), MediationError>
    where
        F: FnOnce(Arc<dyn ExchangeHandler>) -> Result<Box<dyn Consumer>, MediationError> + Send,
    {
        if self.reply_consumers.contains_key(reply_to) {
            return Ok(());
        }
        let _setup = self.reply_setup.lock().await;
        if self.reply_consumers.contains_key(reply_to) {
            return Ok(());
        }

        let mut consumer = create(self.dispatcher())?;
        consumer.start().await?;
        tracing::debug!(reply_to, "exclusive reply consumer started");
        self.reply_consumers.insert(reply_to.to_string(), consumer);
        Ok(())
    }

    #[must_use]
    pub fn has_reply_consumer(&self, reply_to: &str) -> bool {
        self.reply_consumers.contains_key(reply_to)
    }

    // -- lifecycle --------------------------------------------------------------

    /// Starts the periodic sweeper. Must be called within a tokio runtime.
    pub fn start(&self, sweep_interval: Duration) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(BackgroundWorker::start(
                CorrelationSweeper {
                    table: Arc::clone(&self.table),
                },
                sweep_interval,
            ));
        }
    }

    /// Runs a sweep now on the sweeper task.
    ///
    /// # Errors
    ///
    /// Returns an error if the sweeper is not running.
    pub async fn sweep_now(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        {
            let sweeper = self.sweeper.lock();
            let Some(worker) = sweeper.as_ref() else {
                anyhow::bail!("correlation sweeper not running");
            };
            // try_submit keeps the lock scope free of awaits.
            worker.try_submit(SweepNow(tx))?;
        }
        Ok(rx.await?)
    }

    /// Stops the sweeper and reply consumers and fails every pending request
    /// with `Cancelled`.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(mut worker) = sweeper {
            worker.stop().await;
        }

        let keys: Vec<String> = self
            .reply_consumers
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some((_, mut consumer)) = self.reply_consumers.remove(&key) {
                consumer.abort().await;
            }
        }

        let cancelled = self.table.cancel_all();
        if cancelled > 0 {
            tracing::info!(cancelled, "cancelled pending requests on shutdown");
        }
    }
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use mediator_core::header_names as names;

    use super::*;

    fn reply(correlation_id: &str, body: &str) -> Message {
        Message::new(body.to_string()).with_header(names::CORRELATION_ID, correlation_id)
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let manager = CorrelationManager::new();
        let a = manager.next_correlation_id();
        let b = manager.next_correlation_id();
        assert_ne!(a, b);
        assert_eq!(a.split('-').next(), b.split('-').next());
        assert_ne!(
            CorrelationManager::new().next_correlation_id(),
            a,
            "separate managers use separate prefixes"
        );
    }

    #[tokio::test]
    async fn reply_completes_waiter() {
        let manager = CorrelationManager::new();
        let pending = manager.register("replies", Duration::from_secs(5));
        let id = pending.correlation_id().to_string();
        assert!(manager.is_pending(&id));

        assert_eq!(manager.deliver(reply(&id, "pong")), DeliveryOutcome::Delivered);
        let message = pending.wait().await.unwrap();
        assert_eq!(message.body_ref::<String>().unwrap(), "pong");
        assert_eq!(manager.pending_count(), 0);
        assert_eq!(manager.completed_replies(), 1);
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_reply_is_orphaned() {
        let manager = CorrelationManager::new();
        let pending = manager.register("replies", Duration::from_millis(20));
        let id = pending.correlation_id().to_string();

        let err = pending.wait().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!manager.is_pending(&id));
        assert_eq!(manager.timed_out_requests(), 1);

        assert_eq!(manager.deliver(reply(&id, "late")), DeliveryOutcome::Orphaned);
        assert_eq!(manager.orphaned_replies(), 1);
    }

    #[tokio::test]
    async fn dropping_handle_removes_entry() {
        let manager = CorrelationManager::new();
        let pending = manager.register("replies", Duration::from_secs(5));
        let id = pending.correlation_id().to_string();
        drop(pending);
        assert!(!manager.is_pending(&id));
        assert_eq!(manager.deliver(reply(&id, "x")), DeliveryOutcome::Orphaned);
    }

    #[tokio::test]
    async fn cancellation_token_cancels_wait() {
        let manager = CorrelationManager::new();
        let pending = manager.register("replies", Duration::from_secs(5));
        let id = pending.correlation_id().to_string();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();

        let err = pending.wait_or_cancel(&token).await.unwrap_err();
        assert!(matches!(err, MediationError::Cancelled { .. }));
        assert!(!manager.is_pending(&id));
    }

    #[tokio::test]
    async fn reply_without_id_is_orphaned() {
        let manager = CorrelationManager::new();
        assert_eq!(
            manager.deliver(Message::new("anonymous")),
            DeliveryOutcome::Orphaned
        );
        assert_eq!(manager.orphaned_replies(), 1);
    }

    #[tokio::test]
    async fn callback_fires_once_on_reply() {
        let manager = CorrelationManager::new();
        let (tx, rx) = oneshot::channel();
        let id = manager.register_callback(
            "replies",
            Duration::from_secs(5),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );

        manager.deliver(reply(&id, "async"));
        let message = rx.await.unwrap().unwrap();
        assert_eq!(message.body_ref::<String>().unwrap(), "async");
        assert_eq!(manager.deliver(reply(&id, "again")), DeliveryOutcome::Orphaned);
    }

    #[tokio::test]
    async fn sweeper_expires_callbacks() {
        let manager = CorrelationManager::new();
        manager.start(Duration::from_secs(60));

        let (tx, rx) = oneshot::channel();
        manager.register_callback(
            "replies",
            Duration::from_millis(1),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.sweep_now().await.unwrap(), 1);
        assert!(rx.await.unwrap().unwrap_err().is_timeout());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_pending() {
        let manager = CorrelationManager::new();
        let pending = manager.register("replies", Duration::from_secs(5));
        manager.shutdown().await;

        assert!(matches!(
            pending.wait().await,
            Err(MediationError::Cancelled { .. })
        ));
    }
}
