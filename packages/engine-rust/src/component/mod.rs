//! Component / endpoint / consumer / producer contract.
//!
//! Transports plug into the engine by implementing these traits; the engine
//! never branches on which transport it is talking to.
//!
//! - [`uri`]: endpoint URI parsing and option validation
//! - [`direct`]: synchronous in-process hand-off (`direct:name`)
//! - [`queue`]: in-process point-to-point broker (`queue:name`)

pub mod direct;
pub mod queue;
pub mod uri;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mediator_core::{Exchange, MediationError};

use crate::context::MediationContext;

pub use direct::DirectComponent;
pub use queue::QueueComponent;
pub use uri::{EndpointOptions, EndpointUri};

/// Completion callback for asynchronous InOut sends.
pub type ReplyCallback = Box<dyn FnOnce(Exchange) + Send + 'static>;

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// What an endpoint supports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointCapabilities {
    /// The consumer may invoke its handler concurrently with itself. When
    /// false, the route serializes deliveries.
    pub concurrent_delivery: bool,
    /// Producers support InOut (request-reply).
    pub in_out: bool,
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Factory for the endpoints of one transport family.
#[async_trait]
pub trait Component: Send + Sync + 'static {
    /// Creates an endpoint. All options must be validated here.
    ///
    /// # Errors
    ///
    /// `UnsupportedUri`, `UnsupportedOption` or `InvalidOption`.
    fn create_endpoint(
        &self,
        uri: &EndpointUri,
        context: &MediationContext,
    ) -> Result<Arc<dyn Endpoint>, MediationError>;

    /// Called when the context starts, before any route.
    async fn start(&self, _context: &MediationContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the context stops, after every route.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

/// One addressable destination. Shared by every consumer and producer
/// created from it.
pub trait Endpoint: Send + Sync + 'static {
    /// Normalized URI; the endpoint's identity.
    fn uri(&self) -> &str;

    fn capabilities(&self) -> EndpointCapabilities;

    /// Creates a consumer that pushes inbound exchanges into `handler`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be consumed from.
    fn create_consumer(
        &self,
        handler: Arc<dyn ExchangeHandler>,
    ) -> Result<Box<dyn Consumer>, MediationError>;

    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be produced to.
    fn create_producer(&self) -> Result<Arc<dyn Producer>, MediationError>;
}

// ---------------------------------------------------------------------------
// Consumer / handler
// ---------------------------------------------------------------------------

/// Entry point the transport calls for every inbound exchange.
///
/// Returns once the whole chain ran, so the transport knows when it may
/// acknowledge the underlying message.
#[async_trait]
pub trait ExchangeHandler: Send + Sync + 'static {
    async fn on_exchange(&self, exchange: Exchange) -> Exchange;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn endpoint_uri(&self) -> &str;

    /// Begins receiving.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer cannot attach to its destination.
    async fn start(&mut self) -> Result<(), MediationError>;

    /// Stops taking new work. Exchanges already handed to the handler finish.
    async fn stop(&mut self);

    /// Stops and cancels whatever is still running.
    async fn abort(&mut self);
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Producer: Send + Sync + 'static {
    fn endpoint_uri(&self) -> &str;

    /// Sends the exchange according to its pattern. InOut exchanges wait for
    /// the reply using the endpoint's configured timeout.
    async fn process(&self, exchange: Exchange) -> Exchange;

    /// Sends the exchange and waits up to `timeout` for the reply, which is
    /// set as the out message. Failures are recorded on the exchange.
    async fn process_and_await_reply(&self, exchange: Exchange, timeout: Duration) -> Exchange;

    /// Asynchronous InOut: returns immediately, `callback` receives the
    /// completed exchange.
    fn send_with_callback(
        self: Arc<Self>,
        exchange: Exchange,
        timeout: Duration,
        callback: ReplyCallback,
    ) {
        tokio::spawn(async move {
            let completed = self.process_and_await_reply(exchange, timeout).await;
            callback(completed);
        });
    }
}
