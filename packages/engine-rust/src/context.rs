//! The mediation context: owns components, endpoints, routes, the converter
//! registry and the correlation engine, and drives their lifecycle.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mediator_core::{MediationError, TypeConverterRegistry};
use parking_lot::RwLock;
use tokio::sync::Semaphore;

use crate::component::queue::QueueComponentConfig;
use crate::component::{Component, DirectComponent, Endpoint, EndpointUri, QueueComponent};
use crate::config::ContextConfig;
use crate::correlation::CorrelationManager;
use crate::lifecycle::{wait_until, ContextState};
use crate::route::{Route, RouteDefinition, RouteState};
use crate::template::ProducerTemplate;

/// A component plus a type-erased handle for typed lookup.
struct RegisteredComponent {
    component: Arc<dyn Component>,
    any: Arc<dyn Any + Send + Sync>,
}

// ---------------------------------------------------------------------------
// MediationContext
// ---------------------------------------------------------------------------

/// Process-local registry and lifecycle owner.
///
/// Contexts are independent: several can live in one process. A new context
/// has the `direct` and `queue` components registered.
///
/// Lifecycle: Uninitialized -> Starting -> Started -> Stopping -> Stopped,
/// and `start()` again from Stopped. Components start in registration order
/// and stop in reverse; routes likewise.
pub struct MediationContext {
    config: ContextConfig,
    state: ArcSwap<ContextState>,
    components: DashMap<String, RegisteredComponent>,
    component_order: RwLock<Vec<String>>,
    endpoints: DashMap<String, Arc<dyn Endpoint>>,
    converters: Arc<TypeConverterRegistry>,
    routes: DashMap<String, Arc<Route>>,
    route_order: RwLock<Vec<String>>,
    correlation: Arc<CorrelationManager>,
    load_shed: Arc<Semaphore>,
    /// Serializes start, stop and route table changes.
    lifecycle: tokio::sync::Mutex<()>,
    route_counter: AtomicU64,
}

impl MediationContext {
    /// Creates a context in the `Uninitialized` state. Does not spawn
    /// anything, so it may be called outside a runtime.
    #[must_use]
    pub fn new(config: ContextConfig) -> Self {
        let queue = QueueComponent::new(QueueComponentConfig {
            capacity: config.queue_capacity,
            ..QueueComponentConfig::default()
        });
        let context = Self {
            load_shed: Arc::new(Semaphore::new(config.max_inflight_exchanges as usize)),
            config,
            state: ArcSwap::from_pointee(ContextState::Uninitialized),
            components: DashMap::new(),
            component_order: RwLock::new(Vec::new()),
            endpoints: DashMap::new(),
            converters: Arc::new(TypeConverterRegistry::with_defaults()),
            routes: DashMap::new(),
            route_order: RwLock::new(Vec::new()),
            correlation: Arc::new(CorrelationManager::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            route_counter: AtomicU64::new(0),
        };
        context.insert_component("direct", Arc::new(DirectComponent::new()));
        context.insert_component("queue", Arc::new(queue));
        context
    }

    #[must_use]
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn state(&self) -> ContextState {
        **self.state.load()
    }

    #[must_use]
    pub fn type_converter(&self) -> &Arc<TypeConverterRegistry> {
        &self.converters
    }

    #[must_use]
    pub fn correlation(&self) -> &Arc<CorrelationManager> {
        &self.correlation
    }

    pub(crate) fn load_shed(&self) -> Arc<Semaphore> {
        Arc::clone(&self.load_shed)
    }

    /// Exchanges currently inside any route.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.routes.iter().map(|r| r.value().in_flight_count()).sum()
    }

    /// A template bound to this context.
    #[must_use]
    pub fn create_producer_template(self: &Arc<Self>) -> ProducerTemplate {
        ProducerTemplate::new(Arc::clone(self))
    }

    // -- components -------------------------------------------------------------

    fn insert_component<C: Component>(&self, scheme: &str, component: Arc<C>) -> bool {
        match self.components.entry(scheme.to_ascii_lowercase()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.component_order.write().push(slot.key().clone());
                slot.insert(RegisteredComponent {
                    component: Arc::clone(&component) as Arc<dyn Component>,
                    any: component,
                });
                true
            }
        }
    }

    /// Registers a component under `scheme`. If the context is already
    /// started, the component is started right away.
    ///
    /// # Errors
    ///
    /// `IllegalState` if the scheme is taken or the component fails to start.
    pub async fn add_component<C: Component>(
        &self,
        scheme: &str,
        component: C,
    ) -> Result<Arc<C>, MediationError> {
        let _lifecycle = self.lifecycle.lock().await;
        let component = Arc::new(component);
        if !self.insert_component(scheme, Arc::clone(&component)) {
            return Err(MediationError::IllegalState {
                state: format!("scheme {scheme} already registered"),
                action: "add component".to_string(),
            });
        }

        if self.state() == ContextState::Started {
            if let Err(e) = component.start(self).await {
                self.remove_component(scheme);
                return Err(component_error(ContextState::Started, "start", scheme, &e));
            }
        }
        tracing::debug!(context = %self.name(), scheme, "component added");
        Ok(component)
    }

    fn remove_component(&self, scheme: &str) {
        let scheme = scheme.to_ascii_lowercase();
        self.components.remove(&scheme);
        self.component_order.write().retain(|s| s != &scheme);
    }

    #[must_use]
    pub fn component(&self, scheme: &str) -> Option<Arc<dyn Component>> {
        self.components
            .get(&scheme.to_ascii_lowercase())
            .map(|entry| Arc::clone(&entry.value().component))
    }

    /// The component registered under `scheme`, if it is a `C`.
    #[must_use]
    pub fn component_as<C: Component>(&self, scheme: &str) -> Option<Arc<C>> {
        self.components
            .get(&scheme.to_ascii_lowercase())
            .and_then(|entry| Arc::clone(&entry.value().any).downcast::<C>().ok())
    }

    // -- endpoints --------------------------------------------------------------

    /// Resolves an endpoint, creating and caching it on first use.
    ///
    /// Two calls with URIs that normalize to the same string return the same
    /// instance.
    ///
    /// # Errors
    ///
    /// `UnsupportedUri`, `UnknownComponent` or any option error raised by
    /// the component.
    pub fn endpoint(&self, uri: &str) -> Result<Arc<dyn Endpoint>, MediationError> {
        self.resolve_endpoint(&EndpointUri::parse(uri)?)
    }

    /// Like [`endpoint`](Self::endpoint), with options supplied in code.
    /// They override options of the same name in the query string.
    ///
    /// # Errors
    ///
    /// As [`endpoint`](Self::endpoint).
    pub fn endpoint_with_options<K, V>(
        &self,
        uri: &str,
        options: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Arc<dyn Endpoint>, MediationError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.resolve_endpoint(&EndpointUri::parse(uri)?.with_options(options))
    }

    fn resolve_endpoint(&self, uri: &EndpointUri) -> Result<Arc<dyn Endpoint>, MediationError> {
        let key = uri.normalized();
        if let Some(existing) = self.endpoints.get(&key) {
            return Ok(Arc::clone(existing.value()));
        }

        let component =
            self.component(uri.scheme())
                .ok_or_else(|| MediationError::UnknownComponent {
                    scheme: uri.scheme().to_string(),
                })?;
        // Created outside the map lock; if another caller raced us, the
        // first inserted instance wins.
        let created = component.create_endpoint(uri, self)?;
        let endpoint = Arc::clone(self.endpoints.entry(key).or_insert(created).value());
        Ok(endpoint)
    }

    #[must_use]
    pub fn has_endpoint(&self, uri: &str) -> bool {
        EndpointUri::parse(uri).is_ok_and(|uri| self.endpoints.contains_key(&uri.normalized()))
    }

    /// Normalized URIs of every cached endpoint, sorted.
    #[must_use]
    pub fn endpoint_uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        uris.sort();
        uris
    }

    /// Drops an endpoint from the cache. Routes and producers already using
    /// it keep their instance.
    pub fn remove_endpoint(&self, uri: &str) -> bool {
        EndpointUri::parse(uri).is_ok_and(|uri| self.endpoints.remove(&uri.normalized()).is_some())
    }

    // -- routes -----------------------------------------------------------------

    fn next_route_id(&self) -> String {
        loop {
            let n = self.route_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let id = format!("route-{n}");
            if !self.routes.contains_key(&id) {
                return id;
            }
        }
    }

    /// Adds a route. If the context is started and the route auto-starts,
    /// it is started before this returns. Returns the route id.
    ///
    /// # Errors
    ///
    /// `DuplicateRoute`, or the route's start error (the route is then not
    /// added).
    pub async fn add_route(&self, definition: RouteDefinition) -> Result<String, MediationError> {
        let _lifecycle = self.lifecycle.lock().await;
        let id = definition
            .id()
            .map_or_else(|| self.next_route_id(), str::to_string);

        let route = Arc::new(Route::new(id.clone(), definition));
        match self.routes.entry(id.clone()) {
            Entry::Occupied(_) => return Err(MediationError::DuplicateRoute { route_id: id }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&route));
            }
        }
        self.route_order.write().push(id.clone());

        if self.state() == ContextState::Started && route.definition().auto_start {
            if let Err(e) = route.start(self).await {
                self.forget_route(&id);
                return Err(e);
            }
        }
        tracing::debug!(context = %self.name(), route = %id, "route added");
        Ok(id)
    }

    /// Stops (gracefully) and removes a route.
    ///
    /// # Errors
    ///
    /// `RouteNotFound`.
    pub async fn remove_route(&self, route_id: &str) -> Result<(), MediationError> {
        let _lifecycle = self.lifecycle.lock().await;
        let route = self.route_or_not_found(route_id)?;
        route.stop(self.config.shutdown_grace_period()).await;
        self.forget_route(route_id);
        Ok(())
    }

    fn forget_route(&self, route_id: &str) {
        self.routes.remove(route_id);
        self.route_order.write().retain(|id| id != route_id);
    }

    /// # Errors
    ///
    /// `RouteNotFound`, `IllegalState` if the context is not started, or the
    /// route's start error.
    pub async fn start_route(&self, route_id: &str) -> Result<(), MediationError> {
        let _lifecycle = self.lifecycle.lock().await;
        let route = self.route_or_not_found(route_id)?;
        let state = self.state();
        if state != ContextState::Started {
            return Err(MediationError::illegal_state(state, format!("start route {route_id}")));
        }
        route.start(self).await
    }

    /// Gracefully stops a route; it stays registered.
    ///
    /// # Errors
    ///
    /// `RouteNotFound`.
    pub async fn stop_route(&self, route_id: &str) -> Result<(), MediationError> {
        let _lifecycle = self.lifecycle.lock().await;
        let route = self.route_or_not_found(route_id)?;
        route.stop(self.config.shutdown_grace_period()).await;
        Ok(())
    }

    #[must_use]
    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes.get(route_id).map(|r| Arc::clone(r.value()))
    }

    fn route_or_not_found(&self, route_id: &str) -> Result<Arc<Route>, MediationError> {
        self.route(route_id)
            .ok_or_else(|| MediationError::RouteNotFound {
                route_id: route_id.to_string(),
            })
    }

    #[must_use]
    pub fn route_state(&self, route_id: &str) -> Option<RouteState> {
        self.route(route_id).map(|r| r.state())
    }

    /// Route ids in registration order.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        self.route_order.read().clone()
    }

    fn ordered_routes(&self) -> Vec<Arc<Route>> {
        self.route_ids()
            .iter()
            .filter_map(|id| self.route(id))
            .collect()
    }

    // -- lifecycle ----------------------------------------------------------------

    /// Starts components, the correlation sweeper, then every auto-start
    /// route. On failure everything started so far is stopped again.
    ///
    /// # Errors
    ///
    /// The first component or route start failure.
    pub async fn start(&self) -> Result<(), MediationError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            ContextState::Started => return Ok(()),
            ContextState::Uninitialized | ContextState::Stopped => {}
            state @ (ContextState::Starting | ContextState::Stopping) => {
                return Err(MediationError::illegal_state(state, "start"));
            }
        }
        self.state.store(Arc::new(ContextState::Starting));
        tracing::info!(context = %self.name(), "starting mediation context");

        let mut started_components = Vec::new();
        let schemes = self.component_order.read().clone();
        for scheme in schemes {
            let Some(component) = self.component(&scheme) else {
                continue;
            };
            if let Err(e) = component.start(self).await {
                let error = component_error(ContextState::Starting, "start", &scheme, &e);
                self.roll_back(&[], &started_components).await;
                return Err(error);
            }
            started_components.push(component);
        }

        self.correlation
            .start(self.config.correlation_sweep_interval());

        let mut started_routes = Vec::new();
        for route in self.ordered_routes() {
            if !route.definition().auto_start {
                continue;
            }
            if let Err(e) = route.start(self).await {
                self.roll_back(&started_routes, &started_components).await;
                return Err(e);
            }
            started_routes.push(route);
        }

        self.state.store(Arc::new(ContextState::Started));
        tracing::info!(
            context = %self.name(),
            routes = started_routes.len(),
            "mediation context started"
        );
        Ok(())
    }

    async fn roll_back(&self, routes: &[Arc<Route>], components: &[Arc<dyn Component>]) {
        for route in routes.iter().rev() {
            route.abort().await;
        }
        self.correlation.shutdown().await;
        for component in components.iter().rev() {
            if let Err(e) = component.stop().await {
                tracing::warn!(error = %e, "component failed to stop during rollback");
            }
        }
        self.state.store(Arc::new(ContextState::Stopped));
    }

    /// Stops the context: route intake first (reverse order), then waits up
    /// to the grace period for in-flight exchanges, aborts what is left,
    /// shuts down the correlation engine and finally stops components.
    ///
    /// No-op unless the context is started.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != ContextState::Started {
            return;
        }
        self.state.store(Arc::new(ContextState::Stopping));
        tracing::info!(context = %self.name(), "stopping mediation context");

        let mut routes = self.ordered_routes();
        routes.reverse();
        for route in &routes {
            route.stop_intake().await;
        }

        let grace = self.config.shutdown_grace_period();
        if !wait_until(grace, || self.in_flight_count() == 0).await {
            tracing::warn!(
                context = %self.name(),
                in_flight = self.in_flight_count(),
                "grace period expired, aborting in-flight exchanges"
            );
        }
        for route in &routes {
            route.abort().await;
        }

        self.correlation.shutdown().await;

        let schemes = self.component_order.read().clone();
        for scheme in schemes.iter().rev() {
            if let Some(component) = self.component(scheme) {
                if let Err(e) = component.stop().await {
                    tracing::warn!(scheme = %scheme, error = %e, "component failed to stop");
                }
            }
        }

        self.state.store(Arc::new(ContextState::Stopped));
        tracing::info!(context = %self.name(), "mediation context stopped");
    }
}

fn component_error(
    state: ContextState,
    action: &str,
    scheme: &str,
    error: &anyhow::Error,
) -> MediationError {
    MediationError::illegal_state(state, format!("{action} component {scheme} ({error:#})"))
}

impl std::fmt::Debug for MediationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediationContext")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .field("routes", &self.route_ids())
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
