//! `queue:name`: in-process point-to-point broker with reply-to semantics.
//!
//! Options:
//! - `concurrentConsumers`: receive tasks per consumer (>= 1). More than one
//!   opts the route into concurrent delivery.
//! - `replyTo`: fixed reply queue for InOut requests.
//! - `replyToType`: `exclusive` or `temporary`.
//! - `requestTimeout`: InOut timeout in milliseconds.
//! - `exchangePattern`: forces the pattern of exchanges the consumer creates.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod producer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mediator_core::{ExchangePattern, MediationError};

use super::{
    Component, Consumer, Endpoint, EndpointCapabilities, EndpointOptions, EndpointUri,
    ExchangeHandler, Producer,
};
use crate::context::MediationContext;
use crate::correlation::CorrelationManager;

pub use broker::{QueueBroker, QueueChannel};
pub use config::{QueueComponentConfig, ReplyToType};
pub use consumer::QueueConsumer;
pub use producer::QueueProducer;

// ---------------------------------------------------------------------------
// QueueComponent
// ---------------------------------------------------------------------------

pub struct QueueComponent {
    broker: Arc<QueueBroker>,
    config: QueueComponentConfig,
}

impl QueueComponent {
    #[must_use]
    pub fn new(config: QueueComponentConfig) -> Self {
        Self {
            broker: Arc::new(QueueBroker::new(config.capacity)),
            config,
        }
    }

    /// The broker shared by every endpoint of this component.
    #[must_use]
    pub fn broker(&self) -> &Arc<QueueBroker> {
        &self.broker
    }

    #[must_use]
    pub fn config(&self) -> &QueueComponentConfig {
        &self.config
    }

    fn settings(
        &self,
        uri: &EndpointUri,
        context: &MediationContext,
    ) -> Result<QueueSettings, MediationError> {
        let mut options = EndpointOptions::new(uri);

        let concurrent_consumers = match options.take_parsed::<usize>("concurrentConsumers")? {
            Some(0) => return Err(options.invalid("concurrentConsumers", 0)),
            Some(n) => n,
            None => self.config.concurrent_consumers.max(1),
        };

        let reply_to = match options.take_string("replyTo") {
            Some(name) if name.is_empty() => return Err(options.invalid("replyTo", "")),
            other => other,
        };

        let explicit_type = options.take_with("replyToType", ReplyToType::parse)?;
        if explicit_type == Some(ReplyToType::Exclusive) && reply_to.is_none() {
            return Err(options.invalid("replyToType", ReplyToType::Exclusive));
        }
        let reply_to_type = match (explicit_type, &reply_to) {
            (Some(kind), _) => kind,
            (None, Some(_)) => self.config.reply_to_type.unwrap_or(ReplyToType::Exclusive),
            (None, None) => ReplyToType::Temporary,
        };

        let request_timeout = options
            .take_parsed::<u64>("requestTimeout")?
            .or(self.config.request_timeout_ms)
            .map_or_else(|| context.config().default_request_timeout(), Duration::from_millis);

        let pattern = options.take_with("exchangePattern", ExchangePattern::parse)?;
        options.finish()?;

        Ok(QueueSettings {
            uri: uri.normalized(),
            scheme: uri.scheme().to_string(),
            name: uri.path().to_string(),
            concurrent_consumers,
            reply_to,
            reply_to_type,
            request_timeout,
            pattern,
        })
    }
}

impl Default for QueueComponent {
    fn default() -> Self {
        Self::new(QueueComponentConfig::default())
    }
}

#[async_trait]
impl Component for QueueComponent {
    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        context: &MediationContext,
    ) -> Result<Arc<dyn Endpoint>, MediationError> {
        let settings = self.settings(uri, context)?;
        tracing::debug!(
            uri = %settings.uri,
            reply_to_type = %settings.reply_to_type,
            "queue endpoint created"
        );
        Ok(Arc::new(QueueEndpoint {
            settings: Arc::new(settings),
            broker: Arc::clone(&self.broker),
            correlation: Arc::clone(context.correlation()),
        }))
    }
}

// ---------------------------------------------------------------------------
// QueueEndpoint
// ---------------------------------------------------------------------------

/// Validated options of one `queue:` endpoint.
#[derive(Debug, Clone)]
pub(crate) struct QueueSettings {
    pub(crate) uri: String,
    pub(crate) scheme: String,
    pub(crate) name: String,
    pub(crate) concurrent_consumers: usize,
    pub(crate) reply_to: Option<String>,
    pub(crate) reply_to_type: ReplyToType,
    pub(crate) request_timeout: Duration,
    pub(crate) pattern: Option<ExchangePattern>,
}

struct QueueEndpoint {
    settings: Arc<QueueSettings>,
    broker: Arc<QueueBroker>,
    correlation: Arc<CorrelationManager>,
}

impl Endpoint for QueueEndpoint {
    fn uri(&self) -> &str {
        &self.settings.uri
    }

    fn capabilities(&self) -> EndpointCapabilities {
        EndpointCapabilities {
            concurrent_delivery: self.settings.concurrent_consumers > 1,
            in_out: true,
        }
    }

    fn create_consumer(
        &self,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Box<dyn Consumer>, MediationError> {
        Ok(Box::new(QueueConsumer::new(
            self.settings.uri.clone(),
            self.broker.queue(&self.settings.name),
            Arc::clone(&self.broker),
            handler,
            self.settings.concurrent_consumers,
            self.settings.pattern,
        )))
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, MediationError> {
        Ok(Arc::new(QueueProducer::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.broker),
            Arc::clone(&self.correlation),
        )))
    }
}

#[cfg(test)]
mod tests {
    use mediator_core::header_names as names;
    use mediator_core::{Exchange, Message};

    use super::*;
    use crate::config::ContextConfig;

    /// Replies with "Hello <body>".
    struct Greeter;

    #[async_trait]
    impl ExchangeHandler for Greeter {
        async fn on_exchange(&self, mut exchange: Exchange) -> Exchange {
            let name = exchange
                .in_message()
                .body_ref::<String>()
                .cloned()
                .unwrap_or_default();
            exchange.set_out_message(Message::new(format!("Hello {name}")));
            exchange
        }
    }

    fn settings_for(uri: &str) -> Result<QueueSettings, MediationError> {
        let component = QueueComponent::default();
        let context = MediationContext::new(ContextConfig::default());
        component.settings(&EndpointUri::parse(uri)?, &context)
    }

    #[test]
    fn reply_to_defaults_to_exclusive() {
        let settings = settings_for("queue:foo?replyTo=bar").unwrap();
        assert_eq!(settings.reply_to.as_deref(), Some("bar"));
        assert_eq!(settings.reply_to_type, ReplyToType::Exclusive);
        assert_eq!(settings.request_timeout, Duration::from_secs(20));
    }

    #[test]
    fn without_reply_to_defaults_to_temporary() {
        let settings = settings_for("queue:foo").unwrap();
        assert_eq!(settings.reply_to_type, ReplyToType::Temporary);
        assert_eq!(settings.concurrent_consumers, 1);
    }

    #[test]
    fn option_values_are_validated() {
        assert!(matches!(
            settings_for("queue:foo?concurrentConsumers=0"),
            Err(MediationError::InvalidOption { .. })
        ));
        assert!(matches!(
            settings_for("queue:foo?replyToType=exclusive"),
            Err(MediationError::InvalidOption { .. })
        ));
        assert!(matches!(
            settings_for("queue:foo?replyToType=sideways&replyTo=bar"),
            Err(MediationError::InvalidOption { .. })
        ));
        assert!(matches!(
            settings_for("queue:foo?exchangePattern=OutIn"),
            Err(MediationError::InvalidOption { .. })
        ));
        assert!(matches!(
            settings_for("queue:foo?durable=true"),
            Err(MediationError::UnsupportedOption { .. })
        ));
    }

    #[test]
    fn concurrent_consumers_enable_concurrent_delivery() {
        let component = QueueComponent::default();
        let context = MediationContext::new(ContextConfig::default());
        let endpoint = component
            .create_endpoint(
                &EndpointUri::parse("queue:work?concurrentConsumers=4").unwrap(),
                &context,
            )
            .unwrap();
        assert!(endpoint.capabilities().concurrent_delivery);
    }

    async fn request_through(uri: &str, body: &str) -> Exchange {
        let component = QueueComponent::default();
        let context = MediationContext::new(ContextConfig::default());
        let endpoint = component
            .create_endpoint(&EndpointUri::parse(uri).unwrap(), &context)
            .unwrap();
        let mut consumer = endpoint.create_consumer(Arc::new(Greeter)).unwrap();
        consumer.start().await.unwrap();

        let reply = endpoint
            .create_producer()
            .unwrap()
            .process(Exchange::in_out(body))
            .await;

        consumer.abort().await;
        context.correlation().shutdown().await;
        reply
    }

    #[tokio::test]
    async fn exclusive_request_gets_reply() {
        let reply = request_through("queue:foo?replyTo=bar", "A").await;
        assert!(reply.exception().is_none(), "{:?}", reply.exception());
        assert_eq!(reply.message().body_ref::<String>().unwrap(), "Hello A");
        assert!(!reply.message().headers().contains(names::REPLY_TO));
    }

    #[tokio::test]
    async fn temporary_queue_is_deleted_after_request() {
        let component = QueueComponent::default();
        let context = MediationContext::new(ContextConfig::default());
        let endpoint = component
            .create_endpoint(&EndpointUri::parse("queue:foo").unwrap(), &context)
            .unwrap();
        let mut consumer = endpoint.create_consumer(Arc::new(Greeter)).unwrap();
        consumer.start().await.unwrap();

        let reply = endpoint
            .create_producer()
            .unwrap()
            .process(Exchange::in_out("B"))
            .await;
        assert_eq!(reply.message().body_ref::<String>().unwrap(), "Hello B");
        assert_eq!(component.broker().queue_names(), vec!["foo".to_string()]);

        consumer.abort().await;
    }

    #[tokio::test]
    async fn in_only_enqueues_without_reply_headers() {
        let component = QueueComponent::default();
        let context = MediationContext::new(ContextConfig::default());
        let endpoint = component
            .create_endpoint(&EndpointUri::parse("queue:sink").unwrap(), &context)
            .unwrap();
        let result = endpoint
            .create_producer()
            .unwrap()
            .process(Exchange::in_only("x"))
            .await;
        assert!(result.exception().is_none());

        let queued = component.broker().queue("sink").recv().await.unwrap();
        assert!(!queued.headers().contains(names::REPLY_TO));
        assert!(!queued.headers().contains(names::CORRELATION_ID));
    }

    #[tokio::test]
    async fn request_times_out_without_consumer() {
        let component = QueueComponent::default();
        let context = MediationContext::new(ContextConfig::default());
        let endpoint = component
            .create_endpoint(
                &EndpointUri::parse("queue:void?replyTo=void.reply&requestTimeout=30").unwrap(),
                &context,
            )
            .unwrap();
        let reply = endpoint
            .create_producer()
            .unwrap()
            .process(Exchange::in_out("x"))
            .await;
        assert!(reply.exception().is_some_and(MediationError::is_timeout));
        assert_eq!(context.correlation().pending_count(), 0);
        context.correlation().shutdown().await;
    }

    #[tokio::test]
    async fn fault_reply_fails_request() {
        struct Failing;

        #[async_trait]
        impl ExchangeHandler for Failing {
            async fn on_exchange(&self, mut exchange: Exchange) -> Exchange {
                exchange.set_exception(MediationError::processor("validate", "rejected"));
                exchange
            }
        }

        let component = QueueComponent::default();
        let context = MediationContext::new(ContextConfig::default());
        let endpoint = component
            .create_endpoint(&EndpointUri::parse("queue:strict?replyTo=strict.reply").unwrap(), &context)
            .unwrap();
        let mut consumer = endpoint.create_consumer(Arc::new(Failing)).unwrap();
        consumer.start().await.unwrap();

        let reply = endpoint
            .create_producer()
            .unwrap()
            .process(Exchange::in_out("x"))
            .await;
        match reply.exception() {
            Some(MediationError::ProcessorFailure { message, .. }) => {
                assert!(message.contains("rejected"), "{message}");
            }
            other => panic!("expected processor failure, got {other:?}"),
        }

        consumer.abort().await;
        context.correlation().shutdown().await;
    }
}
