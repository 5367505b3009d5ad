//! Shared helpers for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mediator_engine::{
    try_init_logging, ContextConfig, LogFormat, LoggingConfig, MediationContext, RouteDefinition,
};

pub fn init_logging() {
    try_init_logging(&LoggingConfig {
        filter: "warn".to_string(),
        format: LogFormat::Compact,
    });
}

/// Test config: short timeouts so failures surface quickly.
pub fn test_config() -> ContextConfig {
    ContextConfig {
        default_request_timeout_ms: 2_000,
        shutdown_grace_period_ms: 1_000,
        correlation_sweep_interval_ms: 20,
        ..ContextConfig::named("test")
    }
}

/// A started context with `routes` added in order.
pub async fn started_context(
    config: ContextConfig,
    routes: Vec<RouteDefinition>,
) -> Arc<MediationContext> {
    init_logging();
    let context = Arc::new(MediationContext::new(config));
    for route in routes {
        context.add_route(route).await.expect("route should be added");
    }
    context.start().await.expect("context should start");
    context
}

/// Polls `condition` every 5ms until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
