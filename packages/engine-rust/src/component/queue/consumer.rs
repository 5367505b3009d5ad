use std::sync::Arc;

use async_trait::async_trait;
use mediator_core::header_names as names;
use mediator_core::{Exchange, ExchangePattern, MediationError, Message, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broker::{QueueBroker, QueueChannel};
use crate::component::{Consumer, ExchangeHandler};

/// State shared by the receive tasks of one consumer.
struct Receiver {
    uri: String,
    channel: Arc<QueueChannel>,
    broker: Arc<QueueBroker>,
    handler: Arc<dyn ExchangeHandler>,
    pattern: Option<ExchangePattern>,
}

impl Receiver {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.channel.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            };
            // Intake stops between messages; the current one runs to completion.
            self.dispatch(message).await;
        }
        tracing::trace!(uri = %self.uri, "queue receive loop finished");
    }

    async fn dispatch(&self, message: Message) {
        let reply_to = message
            .headers()
            .get_str(names::REPLY_TO)
            .map(str::to_string);
        let correlation_id = message.header(names::CORRELATION_ID).cloned();

        let pattern = self.pattern.unwrap_or(if reply_to.is_some() {
            ExchangePattern::InOut
        } else {
            ExchangePattern::InOnly
        });

        let mut exchange = Exchange::new(pattern, message);
        exchange.set_from_endpoint(self.uri.clone());
        let completed = self.handler.on_exchange(exchange).await;

        let Some(reply_to) = reply_to else {
            return;
        };
        if pattern != ExchangePattern::InOut {
            return;
        }

        let reply = reply_message(&completed, correlation_id);
        // The requester may have timed out or been cancelled and deleted
        // its reply queue; the reply is dropped rather than recreating it.
        if let Err(e) = self.broker.send_to_existing(&reply_to, reply).await {
            metrics::counter!("mediator_undeliverable_replies_total").increment(1);
            tracing::warn!(uri = %self.uri, reply_to = %reply_to, error = %e, "reply dropped");
        }
    }
}

/// Builds the reply for a completed exchange: its effective message, or an
/// empty message carrying the fault header if the exchange failed.
fn reply_message(completed: &Exchange, correlation_id: Option<Value>) -> Message {
    let mut reply = match completed.exception() {
        Some(err) => Message::default().with_header(names::FAULT, err.to_string()),
        None => completed.message().clone(),
    };
    reply.remove_header(names::REPLY_TO);
    match correlation_id {
        Some(id) => reply.set_header(names::CORRELATION_ID, id),
        None => {
            reply.remove_header(names::CORRELATION_ID);
        }
    }
    reply
}

// ---------------------------------------------------------------------------
// QueueConsumer
// ---------------------------------------------------------------------------

/// Competing consumer over one queue with `concurrency` receive tasks.
pub struct QueueConsumer {
    receiver: Arc<Receiver>,
    concurrency: usize,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl QueueConsumer {
    pub(crate) fn new(
        uri: String,
        channel: Arc<QueueChannel>,
        broker: Arc<QueueBroker>,
        handler: Arc<dyn ExchangeHandler>,
        concurrency: usize,
        pattern: Option<ExchangePattern>,
    ) -> Self {
        Self {
            receiver: Arc::new(Receiver {
                uri,
                channel,
                broker,
                handler,
                pattern,
            }),
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Number of receive tasks still running.
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }
}

#[async_trait]
impl Consumer for QueueConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.receiver.uri
    }

    async fn start(&mut self) -> Result<(), MediationError> {
        if !self.tasks.is_empty() {
            return Ok(());
        }
        self.cancel = CancellationToken::new();
        for _ in 0..self.concurrency {
            let receiver = Arc::clone(&self.receiver);
            self.tasks
                .push(tokio::spawn(receiver.run(self.cancel.clone())));
        }
        tracing::debug!(
            uri = %self.receiver.uri,
            queue = self.receiver.channel.name(),
            concurrency = self.concurrency,
            "queue consumer started"
        );
        Ok(())
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
    }

    async fn abort(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
            // Cancellation is the expected outcome here.
            let _ = task.await;
        }
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
