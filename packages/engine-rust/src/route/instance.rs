//! A started route: its consumer, middleware stack and state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use mediator_core::{Exchange, ExchangePattern, MediationError};
use tower::ServiceExt;

use super::definition::RouteDefinition;
use super::middleware::{build_route_service, RouteService};
use super::pipeline::RouteProcessor;
use crate::component::{Consumer, ExchangeHandler};
use crate::context::MediationContext;
use crate::lifecycle::InFlightTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for RouteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RouteHandler
// ---------------------------------------------------------------------------

/// Bridges the consumer to the route's service stack.
struct RouteHandler {
    route_id: Arc<str>,
    service: RouteService,
    /// Serializes deliveries for endpoints without concurrent delivery.
    gate: Option<tokio::sync::Mutex<()>>,
}

#[async_trait]
impl ExchangeHandler for RouteHandler {
    async fn on_exchange(&self, mut exchange: Exchange) -> Exchange {
        exchange.set_from_route(self.route_id.as_ref());

        let _turn = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let completed = self
            .service
            .clone()
            .oneshot(exchange)
            .await
            .unwrap_or_else(|never| match never {});

        if completed.pattern() == ExchangePattern::InOnly {
            if let Some(error) = completed.exception() {
                tracing::warn!(
                    route = %self.route_id,
                    exchange_id = %completed.id(),
                    error = %error,
                    "exchange failed"
                );
            }
        }
        completed
    }
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

pub struct Route {
    id: String,
    definition: RouteDefinition,
    state: ArcSwap<RouteState>,
    consumer: tokio::sync::Mutex<Option<Box<dyn Consumer>>>,
    in_flight: InFlightTracker,
}

impl Route {
    pub(crate) fn new(id: String, definition: RouteDefinition) -> Self {
        Self {
            id,
            definition,
            state: ArcSwap::from_pointee(RouteState::Stopped),
            consumer: tokio::sync::Mutex::new(None),
            in_flight: InFlightTracker::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn definition(&self) -> &RouteDefinition {
        &self.definition
    }

    #[must_use]
    pub fn state(&self) -> RouteState {
        **self.state.load()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count()
    }

    /// Resolves the route's endpoints, builds its processors and starts its
    /// consumer. No-op if already started.
    pub(crate) async fn start(&self, context: &MediationContext) -> Result<(), MediationError> {
        let mut consumer_slot = self.consumer.lock().await;
        if consumer_slot.is_some() && self.state() == RouteState::Started {
            return Ok(());
        }
        if let Some(mut stale) = consumer_slot.take() {
            stale.abort().await;
        }
        self.state.store(Arc::new(RouteState::Starting));

        match self.open_consumer(context).await {
            Ok(consumer) => {
                *consumer_slot = Some(consumer);
                self.state.store(Arc::new(RouteState::Started));
                tracing::info!(route = %self.id, from = %self.definition.from, "route started");
                Ok(())
            }
            Err(error) => {
                self.state.store(Arc::new(RouteState::Stopped));
                tracing::warn!(route = %self.id, error = %error, "route failed to start");
                Err(error)
            }
        }
    }

    async fn open_consumer(
        &self,
        context: &MediationContext,
    ) -> Result<Box<dyn Consumer>, MediationError> {
        let endpoint = context.endpoint(&self.definition.from)?;
        let processor = RouteProcessor::build(
            &self.id,
            &self.definition.steps,
            self.definition.error_handler.as_ref(),
            context,
        )?;
        let service = build_route_service(
            &self.id,
            Arc::new(processor),
            context.load_shed(),
            self.in_flight.clone(),
        );
        let handler = Arc::new(RouteHandler {
            route_id: Arc::from(self.id.as_str()),
            service,
            gate: (!endpoint.capabilities().concurrent_delivery)
                .then(|| tokio::sync::Mutex::new(())),
        });

        let mut consumer = endpoint.create_consumer(handler)?;
        consumer.start().await?;
        Ok(consumer)
    }

    /// Stops taking new exchanges; those already inside keep running.
    pub(crate) async fn stop_intake(&self) {
        let mut consumer = self.consumer.lock().await;
        if let Some(consumer) = consumer.as_mut() {
            self.state.store(Arc::new(RouteState::Stopping));
            consumer.stop().await;
        }
    }

    /// Cancels whatever is still running and releases the consumer.
    pub(crate) async fn abort(&self) {
        let consumer = self.consumer.lock().await.take();
        if let Some(mut consumer) = consumer {
            consumer.abort().await;
            tracing::info!(route = %self.id, "route stopped");
        }
        self.state.store(Arc::new(RouteState::Stopped));
    }

    /// Graceful stop: stop intake, wait up to `grace` for in-flight
    /// exchanges, then abort.
    pub(crate) async fn stop(&self, grace: Duration) {
        self.stop_intake().await;
        if !self.in_flight.wait_for_drain(grace).await {
            tracing::warn!(
                route = %self.id,
                in_flight = self.in_flight.count(),
                "grace period expired, aborting in-flight exchanges"
            );
        }
        self.abort().await;
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("from", &self.definition.from)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
