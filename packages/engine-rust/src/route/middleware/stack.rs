//! Composition of the route middleware.

use std::sync::Arc;

use mediator_core::Processor;
use tokio::sync::Semaphore;
use tower::ServiceBuilder;

use super::in_flight::{InFlightLayer, InFlightService};
use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use super::ProcessorService;
use crate::lifecycle::InFlightTracker;

/// The full service an inbound exchange runs through.
pub type RouteService = LoadShedService<InFlightService<MetricsService<ProcessorService>>>;

/// Wraps a route's processor.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer`: reject before any work when overloaded
/// 2. `InFlightLayer`: count the exchange for draining
/// 3. `MetricsLayer`: span and counters around the processor
#[must_use]
pub fn build_route_service(
    route_id: &str,
    processor: Arc<dyn Processor>,
    load_shed: Arc<Semaphore>,
    in_flight: InFlightTracker,
) -> RouteService {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(load_shed))
        .layer(InFlightLayer::new(in_flight))
        .layer(MetricsLayer::new(route_id))
        .service(ProcessorService::new(processor))
}
