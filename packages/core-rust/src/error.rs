//! Error taxonomy shared by every layer of the mediation core.
//!
//! Errors are `Clone` because a failure is captured on the `Exchange` and may
//! be observed by several parties (error handler, caller, reply transport).

/// Failure of a type conversion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("no type converter from {from} to {to}")]
    NoConverter { from: &'static str, to: &'static str },
    #[error("conversion from {from} to {to} failed: {reason}")]
    Failed {
        from: &'static str,
        to: &'static str,
        reason: String,
    },
}

impl ConversionError {
    /// Builds a `Failed` error for a converter from `S` to `T`.
    pub fn failed<S, T>(reason: impl Into<String>) -> Self {
        Self::Failed {
            from: std::any::type_name::<S>(),
            to: std::any::type_name::<T>(),
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the mediation core.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum MediationError {
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("unsupported endpoint uri {uri}: {reason}")]
    UnsupportedUri { uri: String, reason: String },
    #[error("no component registered for scheme: {scheme}")]
    UnknownComponent { scheme: String },
    #[error("unsupported option {option} on endpoint {uri}")]
    UnsupportedOption { uri: String, option: String },
    #[error("invalid value {value:?} for option {option} on endpoint {uri}")]
    InvalidOption {
        uri: String,
        option: String,
        value: String,
    },
    #[error("processor {processor} failed: {message}")]
    ProcessorFailure { processor: String, message: String },
    #[error("no reply for correlation id {correlation_id} within {timeout_ms}ms")]
    CorrelationTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },
    #[error("request {correlation_id} was cancelled")]
    Cancelled { correlation_id: String },
    #[error("no consumer available on endpoint {uri}")]
    NoConsumer { uri: String },
    #[error("route not found: {route_id}")]
    RouteNotFound { route_id: String },
    #[error("duplicate route id: {route_id}")]
    DuplicateRoute { route_id: String },
    #[error("cannot {action} while {state}")]
    IllegalState { state: String, action: String },
    #[error("too many in-flight exchanges")]
    Overloaded,
    #[error("transport error on {uri}: {message}")]
    Transport { uri: String, message: String },
}

impl MediationError {
    /// Wraps any displayable failure raised by a named processor.
    pub fn processor(processor: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ProcessorFailure {
            processor: processor.into(),
            message: err.to_string(),
        }
    }

    pub fn illegal_state(state: impl std::fmt::Display, action: impl Into<String>) -> Self {
        Self::IllegalState {
            state: state.to_string(),
            action: action.into(),
        }
    }

    /// True for correlation timeouts, which callers often want to tell apart.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::CorrelationTimeout { .. })
    }
}
