//! Counts exchanges inside a route so shutdown can wait for them.

use std::convert::Infallible;
use std::task::{Context, Poll};

use mediator_core::Exchange;
use tower::{Layer, Service};

use super::ExchangeFuture;
use crate::lifecycle::InFlightTracker;

#[derive(Debug, Clone)]
pub struct InFlightLayer {
    tracker: InFlightTracker,
}

impl InFlightLayer {
    #[must_use]
    pub fn new(tracker: InFlightTracker) -> Self {
        Self { tracker }
    }
}

impl<S> Layer<S> for InFlightLayer {
    type Service = InFlightService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InFlightService {
            inner,
            tracker: self.tracker.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlightService<S> {
    inner: S,
    tracker: InFlightTracker,
}

impl<S> Service<Exchange> for InFlightService<S>
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

    fn call(&mut self, exchange: Exchange) -> Self::Future {
        // Counted from here, not from when the future is first polled.
        let guard = self.tracker.guard();
        let fut = self.inner.call(exchange);
        Box::pin(async move {
            let _guard = guard;
            fut.await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::*;

    #[derive(Clone)]
    struct Gate(Arc<Notify>);

    impl Service<Exchange> for Gate {
        type Response = Exchange;
        type Error = Infallible;
        type Future = ExchangeFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, exchange: Exchange) -> Self::Future {
            let gate = Arc::clone(&self.0);
            Box::pin(async move {
                gate.notified().await;
                Ok(exchange)
            })
        }
    }

    #[tokio::test]
    async fn counts_until_exchange_completes() {
        let tracker = InFlightTracker::new();
        let gate = Arc::new(Notify::new());
        let mut svc = InFlightLayer::new(tracker.clone()).layer(Gate(Arc::clone(&gate)));

        let pending = tokio::spawn(svc.call(Exchange::in_only("x")));
        assert_eq!(tracker.count(), 1);

        gate.notify_one();
        pending.await.unwrap().unwrap();
        assert_eq!(tracker.count(), 0);
    }
}
