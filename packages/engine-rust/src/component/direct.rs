//! `direct:name`: synchronous in-process hand-off to at most one consumer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mediator_core::{Exchange, ExchangePattern, MediationError};

use super::{
    Component, Consumer, Endpoint, EndpointCapabilities, EndpointOptions, EndpointUri,
    ExchangeHandler, Producer,
};
use crate::context::MediationContext;

/// Active consumers by direct name.
#[derive(Default)]
struct DirectRegistry {
    consumers: DashMap<String, Arc<dyn ExchangeHandler>>,
}

impl DirectRegistry {
    fn handler(&self, name: &str) -> Option<Arc<dyn ExchangeHandler>> {
        self.consumers.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

// ---------------------------------------------------------------------------
// DirectComponent
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct DirectComponent {
    registry: Arc<DirectRegistry>,
}

impl DirectComponent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a consumer is currently attached to `direct:name`.
    #[must_use]
    pub fn has_consumer(&self, name: &str) -> bool {
        self.registry.consumers.contains_key(name)
    }
}

#[async_trait]
impl Component for DirectComponent {
    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        context: &MediationContext,
    ) -> Result<Arc<dyn Endpoint>, MediationError> {
        let mut options = EndpointOptions::new(uri);
        let timeout = options
            .take_parsed::<u64>("timeout")?
            .map_or_else(|| context.config().default_request_timeout(), Duration::from_millis);
        options.finish()?;

        Ok(Arc::new(DirectEndpoint {
            uri: uri.normalized(),
            name: uri.path().to_string(),
            timeout,
            registry: Arc::clone(&self.registry),
        }))
    }
}

// ---------------------------------------------------------------------------
// DirectEndpoint
// ---------------------------------------------------------------------------

struct DirectEndpoint {
    uri: String,
    name: String,
    timeout: Duration,
    registry: Arc<DirectRegistry>,
}

impl Endpoint for DirectEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn capabilities(&self) -> EndpointCapabilities {
        // Each caller runs the chain on its own task.
        EndpointCapabilities {
            concurrent_delivery: true,
            in_out: true,
        }
    }

    fn create_consumer(
        &self,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Box<dyn Consumer>, MediationError> {
        Ok(Box::new(DirectConsumer {
            uri: self.uri.clone(),
            name: self.name.clone(),
            handler,
            registry: Arc::clone(&self.registry),
            attached: false,
        }))
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, MediationError> {
        Ok(Arc::new(DirectProducer {
            uri: self.uri.clone(),
            name: self.name.clone(),
            timeout: self.timeout,
            registry: Arc::clone(&self.registry),
        }))
    }
}

// ---------------------------------------------------------------------------
// DirectConsumer
// ---------------------------------------------------------------------------

struct DirectConsumer {
    uri: String,
    name: String,
    handler: Arc<dyn ExchangeHandler>,
    registry: Arc<DirectRegistry>,
    attached: bool,
}

impl DirectConsumer {
    fn detach(&mut self) {
        if self.attached {
            self.registry
                .consumers
                .remove_if(&self.name, |_, handler| Arc::ptr_eq(handler, &self.handler));
            self.attached = false;
        }
    }
}

#[async_trait]
impl Consumer for DirectConsumer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn start(&mut self) -> Result<(), MediationError> {
        if self.attached {
            return Ok(());
        }
        match self.registry.consumers.entry(self.name.clone()) {
            Entry::Occupied(_) => Err(MediationError::IllegalState {
                state: format!("direct:{} already has a consumer", self.name),
                action: "start a second consumer".to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&self.handler));
                self.attached = true;
                Ok(())
            }
        }
    }

    async fn stop(&mut self) {
        self.detach();
    }

    async fn abort(&mut self) {
        self.detach();
    }
}

impl Drop for DirectConsumer {
    fn drop(&mut self) {
        self.detach();
    }
}

// ---------------------------------------------------------------------------
// DirectProducer
// ---------------------------------------------------------------------------

struct DirectProducer {
    uri: String,
    name: String,
    timeout: Duration,
    registry: Arc<DirectRegistry>,
}

#[async_trait]
impl Producer for DirectProducer {
    fn endpoint_uri(&self) -> &str {
        &self.uri
    }

    async fn process(&self, exchange: Exchange) -> Exchange {
        match exchange.pattern() {
            ExchangePattern::InOut => self.process_and_await_reply(exchange, self.timeout).await,
            ExchangePattern::InOnly => {
                let Some(handler) = self.registry.handler(&self.name) else {
                    return no_consumer(exchange, &self.uri);
                };
                handler.on_exchange(exchange).await
            }
        }
    }

    async fn process_and_await_reply(&self, exchange: Exchange, timeout: Duration) -> Exchange {
        let Some(handler) = self.registry.handler(&self.name) else {
            return no_consumer(exchange, &self.uri);
        };

        // The consumer chain runs on its own task so it completes even if
        // this caller gives up waiting.
        let mut fallback = exchange.snapshot();
        let chain = tokio::spawn(async move { handler.on_exchange(exchange).await });

        match tokio::time::timeout(timeout, chain).await {
            Ok(Ok(completed)) => completed,
            Ok(Err(join_error)) => {
                fallback.set_exception(MediationError::Transport {
                    uri: self.uri.clone(),
                    message: join_error.to_string(),
                });
                fallback
            }
            Err(_elapsed) => {
                tracing::warn!(uri = %self.uri, exchange_id = %fallback.id(), "direct request timed out");
                fallback.set_exception(MediationError::CorrelationTimeout {
                    correlation_id: fallback.id().to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
                fallback
            }
        }
    }
}

fn no_consumer(mut exchange: Exchange, uri: &str) -> Exchange {
    exchange.set_exception(MediationError::NoConsumer {
        uri: uri.to_string(),
    });
    exchange
}
