//! Per-exchange tracing span and counters.

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use mediator_core::Exchange;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::ExchangeFuture;

pub const EXCHANGES_TOTAL: &str = "mediator_exchanges_total";

#[derive(Debug, Clone)]
pub struct MetricsLayer {
    route_id: Arc<str>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(route_id: &str) -> Self {
        Self {
            route_id: Arc::from(route_id),
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            route_id: Arc::clone(&self.route_id),
        }
    }
}

/// Records duration and outcome of each exchange on a span, and counts it
/// under `mediator_exchanges_total{route, outcome}`.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    route_id: Arc<str>,
}

impl<S> Service<Exchange> for MetricsService<S>
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
        let route_id = Arc::clone(&self.route_id);
        let span = info_span!(
            "exchange",
            route = %route_id,
            exchange_id = %exchange.id(),
            pattern = %exchange.pattern(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(exchange);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                let outcome = match &result {
                    Ok(exchange) if exchange.is_failed() => "failed",
                    Ok(_) => "completed",
                    Err(never) => match *never {},
                };

                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "exchange complete");

                metrics::counter!(
                    EXCHANGES_TOTAL,
                    "route" => route_id.to_string(),
                    "outcome" => outcome
                )
                .increment(1);

                result
            }
            .instrument(span),
        )
    }
}
