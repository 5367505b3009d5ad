//! Load shedding for exchanges entering a route.
//!
//! The semaphore is shared by every route of a context, so the limit is on
//! the total number of exchanges in flight.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use mediator_core::{Exchange, MediationError};
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use super::ExchangeFuture;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Rejects exchanges immediately, rather than queueing them, when no permit
/// is left.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(semaphore: Arc<Semaphore>) -> Self {
        Self { semaphore }
    }

    /// Layer with its own semaphore of `max_in_flight` permits.
    #[must_use]
    pub fn with_limit(max_in_flight: u32) -> Self {
        Self::new(Arc::new(Semaphore::new(max_in_flight as usize)))
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> Service<Exchange> for LoadShedService<S>
where
    S: Service<Exchange, Response = Exchange, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = Infallible;
    type Future = ExchangeFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut exchange: Exchange) -> Self::Future {
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            tracing::warn!(exchange_id = %exchange.id(), "exchange rejected: overloaded");
            exchange.set_exception(MediationError::Overloaded);
            return Box::pin(async move { Ok(exchange) });
        };

        let fut = self.inner.call(exchange);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}
