//! Mediator Engine: components, routes, request-reply correlation and the
//! context that ties them together.
//!
//! ```text
//! producer template ──▶ endpoint ──▶ consumer ──▶ route service stack ──▶ steps
//!                                                 (load shed, in-flight, metrics)
//! ```

pub mod component;
pub mod config;
pub mod context;
pub mod correlation;
pub mod lifecycle;
pub mod logging;
pub mod route;
pub mod template;
pub mod worker;

pub use component::{
    Component, Consumer, DirectComponent, Endpoint, EndpointCapabilities, EndpointUri,
    ExchangeHandler, Producer, QueueComponent,
};
pub use config::{ContextConfig, LogFormat, LoggingConfig};
pub use context::MediationContext;
pub use correlation::CorrelationManager;
pub use lifecycle::{ContextState, InFlightTracker};
pub use logging::{init_logging, try_init_logging};
pub use route::{from, ErrorHandlerDefinition, RouteDefinition, RouteState, StepBuilder};
pub use template::ProducerTemplate;

pub use mediator_core::{
    Exchange, ExchangePattern, MediationError, Message, Payload, Processor, Value,
};
