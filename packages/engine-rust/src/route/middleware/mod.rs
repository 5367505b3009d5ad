//! Tower middleware wrapped around every route.
//!
//! - [`load_shed`]: context-wide in-flight limit; excess exchanges fail with `Overloaded`
//! - [`in_flight`]: per-route in-flight counting for graceful shutdown
//! - [`metrics`]: tracing span and counters per exchange
//! - [`stack`]: composes the layers around a route's processor

pub mod in_flight;
pub mod load_shed;
pub mod metrics;
pub mod stack;

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use mediator_core::{Exchange, Processor};
use tower::Service;

pub use in_flight::InFlightLayer;
pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use stack::{build_route_service, RouteService};

/// Future returned by every route service.
pub type ExchangeFuture = Pin<Box<dyn Future<Output = Result<Exchange, Infallible>> + Send>>;

/// Innermost service: runs the route's processor. Never fails; errors
/// travel on the exchange.
#[derive(Clone)]
pub struct ProcessorService {
    processor: Arc<dyn Processor>,
}

impl ProcessorService {
    #[must_use]
    pub fn new(processor: Arc<dyn Processor>) -> Self {
        Self { processor }
    }
}

impl Service<Exchange> for ProcessorService {
    type Response = Exchange;
    type Error = Infallible;
    type Future = ExchangeFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        let processor = Arc::clone(&self.processor);
        Box::pin(async move { Ok(processor.process(exchange).await) })
    }
}
