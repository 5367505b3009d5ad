//! Routes: definitions, execution and the middleware around them.
//!
//! - [`definition`]: builder DSL (`from(uri).transform(..).to(..)`)
//! - [`expression`]: expressions and predicates used by steps
//! - [`processor`]: processors behind each step
//! - [`pipeline`]: step sequencing, short-circuiting and error handlers
//! - [`middleware`]: tower layers wrapped around every route
//! - [`instance`]: a started route and its consumer

pub mod definition;
pub mod expression;
pub mod instance;
pub mod middleware;
pub mod pipeline;
pub mod processor;

pub use definition::{
    from, ChoiceDefinition, ConversionPolicy, ErrorHandlerDefinition, RouteDefinition,
    StepBuilder, StepDefinition, Steps,
};
pub use expression::{Expression, Predicate};
pub use instance::{Route, RouteState};
pub use pipeline::{Pipeline, RouteProcessor};
