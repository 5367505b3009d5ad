use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mediator_core::header_names as names;
use mediator_core::{Exchange, ExchangePattern, MediationError, Message};

use super::broker::QueueBroker;
use super::config::ReplyToType;
use super::consumer::QueueConsumer;
use super::QueueSettings;
use crate::component::{Consumer, Producer, ReplyCallback};
use crate::correlation::{CorrelationManager, PendingReply, ReplyOutcome};

/// Deletes a per-request reply queue when dropped.
struct TemporaryQueue {
    broker: Arc<QueueBroker>,
    name: String,
}

impl Drop for TemporaryQueue {
    fn drop(&mut self) {
        self.broker.delete(&self.name);
    }
}

/// Producer for `queue:` endpoints.
///
/// InOnly enqueues the effective message. InOut registers a pending request
/// with the correlation engine, then enqueues the message carrying the
/// correlation id and reply-to headers.
pub struct QueueProducer {
    settings: Arc<QueueSettings>,
    broker: Arc<QueueBroker>,
    correlation: Arc<CorrelationManager>,
}

impl QueueProducer {
    pub(crate) fn new(
        settings: Arc<QueueSettings>,
        broker: Arc<QueueBroker>,
        correlation: Arc<CorrelationManager>,
    ) -> Self {
        Self {
            settings,
            broker,
            correlation,
        }
    }

    /// Key under which the exclusive reply consumer is registered.
    /// Reply consumers are keyed per scheme: two queue-style components
    /// share one correlation manager but not one broker.
    fn reply_key(&self, reply_to: &str) -> String {
        format!("{}:{reply_to}", self.settings.scheme)
    }

    async fn ensure_reply_consumer(&self, reply_to: &str) -> Result<(), MediationError> {
        let key = self.reply_key(reply_to);
        let broker = Arc::clone(&self.broker);
        let name = reply_to.to_string();
        let uri = key.clone();
        self.correlation
            .ensure_reply_consumer(&key, move |dispatcher| {
                let consumer = QueueConsumer::new(
                    uri,
                    broker.queue(&name),
                    Arc::clone(&broker),
                    dispatcher,
                    1,
                    Some(ExchangePattern::InOnly),
                );
                Ok(Box::new(consumer) as Box<dyn Consumer>)
            })
            .await
    }

    async fn transmit(
        &self,
        request: Message,
        correlation_id: &str,
        reply_to: &str,
    ) -> Result<(), MediationError> {
        let message = request
            .with_header(names::CORRELATION_ID, correlation_id)
            .with_header(names::REPLY_TO, reply_to);
        self.broker.send(&self.settings.name, message).await
    }

    async fn request_exclusive(
        &self,
        request: Message,
        reply_to: &str,
        timeout: Duration,
    ) -> ReplyOutcome {
        self.ensure_reply_consumer(reply_to).await?;
        let pending = self.correlation.register(reply_to, timeout);
        self.transmit(request, pending.correlation_id(), reply_to)
            .await?;
        pending.wait().await
    }

    async fn request_temporary(&self, request: Message, timeout: Duration) -> ReplyOutcome {
        let queue = self.broker.create_temporary();
        // Dropped last, so the consumer is gone before the queue is deleted,
        // including when the caller drops this future.
        let temporary = TemporaryQueue {
            broker: Arc::clone(&self.broker),
            name: queue.name().to_string(),
        };
        let pending = self.correlation.register(&temporary.name, timeout);
        let mut consumer = QueueConsumer::new(
            format!("queue:{}", temporary.name),
            queue,
            Arc::clone(&self.broker),
            self.correlation.dispatcher(),
            1,
            Some(ExchangePattern::InOnly),
        );

        let outcome = self
            .round_trip(&mut consumer, request, pending, &temporary.name)
            .await;

        consumer.abort().await;
        outcome
    }

    async fn round_trip(
        &self,
        consumer: &mut QueueConsumer,
        request: Message,
        pending: PendingReply,
        reply_to: &str,
    ) -> ReplyOutcome {
        consumer.start().await?;
        self.transmit(request, pending.correlation_id(), reply_to)
            .await?;
        pending.wait().await
    }

    fn exclusive_reply_to(&self) -> Option<&str> {
        match self.settings.reply_to_type {
            ReplyToType::Exclusive => self.settings.reply_to.as_deref(),
            ReplyToType::Temporary => None,
        }
    }
}

/// Applies a reply outcome to the requesting exchange.
fn apply_reply(exchange: &mut Exchange, outcome: ReplyOutcome, uri: &str) {
    match outcome {
        Ok(mut reply) => {
            if let Some(fault) = reply.headers().get_str(names::FAULT) {
                let error = MediationError::ProcessorFailure {
                    processor: uri.to_string(),
                    message: fault.to_string(),
                };
                exchange.set_exception(error);
                return;
            }
            reply.remove_header(names::REPLY_TO);
            exchange.set_out_message(reply);
        }
        Err(error) => exchange.set_exception(error),
    }
}

#[async_trait]
impl Producer for QueueProducer {
    fn endpoint_uri(&self) -> &str {
        &self.settings.uri
    }

    async fn process(&self, mut exchange: Exchange) -> Exchange {
        if exchange.pattern() == ExchangePattern::InOut {
            return self
                .process_and_await_reply(exchange, self.settings.request_timeout)
                .await;
        }

        let message = exchange.message().clone();
        if let Err(error) = self.broker.send(&self.settings.name, message).await {
            exchange.set_exception(error);
        }
        exchange
    }

    async fn process_and_await_reply(&self, mut exchange: Exchange, timeout: Duration) -> Exchange {
        let request = exchange.message().clone();
        let outcome = match self.exclusive_reply_to() {
            Some(reply_to) => self.request_exclusive(request, reply_to, timeout).await,
            None => self.request_temporary(request, timeout).await,
        };
        apply_reply(&mut exchange, outcome, &self.settings.uri);
        exchange
    }

    fn send_with_callback(
        self: Arc<Self>,
        exchange: Exchange,
        timeout: Duration,
        callback: ReplyCallback,
    ) {
        tokio::spawn(async move {
            let Some(reply_to) = self.exclusive_reply_to().map(str::to_string) else {
                // Temporary replies need a request-scoped consumer anyway.
                let completed = self.process_and_await_reply(exchange, timeout).await;
                callback(completed);
                return;
            };

            let mut exchange = exchange;
            if let Err(error) = self.ensure_reply_consumer(&reply_to).await {
                exchange.set_exception(error);
                callback(exchange);
                return;
            }

            // No task waits from here on: the callback runs when the reply
            // arrives, or when the sweeper expires the request.
            let request = exchange.message().clone();
            let uri = self.settings.uri.clone();
            let correlation_id = self.correlation.register_callback(
                &reply_to,
                timeout,
                Box::new(move |outcome| {
                    apply_reply(&mut exchange, outcome, &uri);
                    callback(exchange);
                }),
            );

            if let Err(error) = self.transmit(request, &correlation_id, &reply_to).await {
                self.correlation.fail(&correlation_id, error);
            }
        });
    }
}
