//! Route definitions: the builder DSL and the step tree it produces.
//!
//! A definition is plain data. Endpoints and producers are resolved when the
//! route is started, so the same definition can be started more than once.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use mediator_core::{Exchange, ExchangePattern, MediationError, Processor, TypeKey};

use super::expression::{Expression, Predicate};
use super::processor::FnProcessor;

/// What a conversion step does when the body cannot be converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversionPolicy {
    /// Fail the exchange with the conversion error.
    #[default]
    Fail,
    /// Leave the body unchanged and continue.
    Skip,
}

/// One node of a route's step tree.
#[derive(Clone)]
pub enum StepDefinition {
    SetBody(Expression),
    SetHeader {
        name: String,
        value: Expression,
    },
    RemoveHeader(String),
    SetProperty {
        name: String,
        value: Expression,
    },
    ConvertBody {
        target: TypeKey,
        policy: ConversionPolicy,
    },
    To {
        uri: String,
        pattern: Option<ExchangePattern>,
    },
    Filter {
        predicate: Predicate,
        steps: Vec<StepDefinition>,
    },
    Choice(ChoiceDefinition),
    Delay(Duration),
    Throttle {
        max: usize,
        period: Duration,
    },
    Log(Expression),
    Process(Arc<dyn Processor>),
    Stop,
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetBody(expr) => write!(f, "set_body({expr:?})"),
            Self::SetHeader { name, value } => write!(f, "set_header({name:?}, {value:?})"),
            Self::RemoveHeader(name) => write!(f, "remove_header({name:?})"),
            Self::SetProperty { name, value } => write!(f, "set_property({name:?}, {value:?})"),
            Self::ConvertBody { target, policy } => {
                write!(f, "convert_body_to({}, {policy:?})", target.name())
            }
            Self::To { uri, pattern: None } => write!(f, "to({uri})"),
            Self::To {
                uri,
                pattern: Some(pattern),
            } => write!(f, "to({uri}, {pattern})"),
            Self::Filter { predicate, steps } => write!(f, "filter({predicate:?}, {steps:?})"),
            Self::Choice(choice) => write!(f, "{choice:?}"),
            Self::Delay(duration) => write!(f, "delay({duration:?})"),
            Self::Throttle { max, period } => write!(f, "throttle({max}, {period:?})"),
            Self::Log(expr) => write!(f, "log({expr:?})"),
            Self::Process(processor) => write!(f, "process({})", processor.name()),
            Self::Stop => f.write_str("stop()"),
        }
    }
}

// ---------------------------------------------------------------------------
// StepBuilder
// ---------------------------------------------------------------------------

/// Step DSL shared by route definitions and nested step lists.
pub trait StepBuilder: Sized {
    fn push_step(&mut self, step: StepDefinition);

    #[must_use]
    fn step(mut self, step: StepDefinition) -> Self {
        self.push_step(step);
        self
    }

    /// Replaces the body with the value of `expression`.
    #[must_use]
    fn transform(self, expression: impl Into<Expression>) -> Self {
        self.step(StepDefinition::SetBody(expression.into()))
    }

    #[must_use]
    fn set_body(self, expression: impl Into<Expression>) -> Self {
        self.transform(expression)
    }

    #[must_use]
    fn set_header(self, name: impl Into<String>, value: impl Into<Expression>) -> Self {
        self.step(StepDefinition::SetHeader {
            name: name.into(),
            value: value.into(),
        })
    }

    #[must_use]
    fn remove_header(self, name: impl Into<String>) -> Self {
        self.step(StepDefinition::RemoveHeader(name.into()))
    }

    #[must_use]
    fn set_property(self, name: impl Into<String>, value: impl Into<Expression>) -> Self {
        self.step(StepDefinition::SetProperty {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Converts the body to `T`, failing the exchange if that is impossible.
    #[must_use]
    fn convert_body_to<T: Any>(self) -> Self {
        self.convert_body_to_with::<T>(ConversionPolicy::Fail)
    }

    #[must_use]
    fn convert_body_to_with<T: Any>(self, policy: ConversionPolicy) -> Self {
        self.step(StepDefinition::ConvertBody {
            target: TypeKey::of::<T>(),
            policy,
        })
    }

    /// Sends the exchange to `uri` using the exchange's own pattern.
    #[must_use]
    fn to(self, uri: impl Into<String>) -> Self {
        self.step(StepDefinition::To {
            uri: uri.into(),
            pattern: None,
        })
    }

    /// Sends the exchange to `uri` as `pattern`; the exchange keeps its own
    /// pattern afterwards.
    #[must_use]
    fn to_with_pattern(self, uri: impl Into<String>, pattern: ExchangePattern) -> Self {
        self.step(StepDefinition::To {
            uri: uri.into(),
            pattern: Some(pattern),
        })
    }

    /// Runs `steps` only for exchanges matching `predicate`.
    #[must_use]
    fn filter(self, predicate: Predicate, steps: impl FnOnce(Steps) -> Steps) -> Self {
        self.step(StepDefinition::Filter {
            predicate,
            steps: steps(Steps::new()).into_vec(),
        })
    }

    #[must_use]
    fn choice(self, build: impl FnOnce(ChoiceDefinition) -> ChoiceDefinition) -> Self {
        self.step(StepDefinition::Choice(build(ChoiceDefinition::default())))
    }

    #[must_use]
    fn delay(self, duration: Duration) -> Self {
        self.step(StepDefinition::Delay(duration))
    }

    /// Lets at most `max` exchanges through per sliding `period`; the rest
    /// wait for a slot.
    #[must_use]
    fn throttle(self, max: usize, period: Duration) -> Self {
        self.step(StepDefinition::Throttle { max, period })
    }

    #[must_use]
    fn log(self, message: impl Into<Expression>) -> Self {
        self.step(StepDefinition::Log(message.into()))
    }

    #[must_use]
    fn process(self, processor: Arc<dyn Processor>) -> Self {
        self.step(StepDefinition::Process(processor))
    }

    /// Runs a synchronous closure. An `Err` fails the exchange.
    #[must_use]
    fn process_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), MediationError> + Send + Sync + 'static,
    {
        self.process(Arc::new(FnProcessor::new(name, f)))
    }

    /// Ends routing for the exchange without failing it.
    #[must_use]
    fn stop(self) -> Self {
        self.step(StepDefinition::Stop)
    }
}

/// Nested step list, used by `filter`, `choice` branches and error handlers.
#[derive(Debug, Clone, Default)]
pub struct Steps(Vec<StepDefinition>);

impl Steps {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<StepDefinition> {
        self.0
    }
}

impl StepBuilder for Steps {
    fn push_step(&mut self, step: StepDefinition) {
        self.0.push(step);
    }
}

// ---------------------------------------------------------------------------
// Choice
// ---------------------------------------------------------------------------

/// Content-based router: the first matching `when` runs, else `otherwise`.
#[derive(Clone, Default)]
pub struct ChoiceDefinition {
    pub(crate) whens: Vec<(Predicate, Vec<StepDefinition>)>,
    pub(crate) otherwise: Option<Vec<StepDefinition>>,
}

impl ChoiceDefinition {
    #[must_use]
    pub fn when(mut self, predicate: Predicate, steps: impl FnOnce(Steps) -> Steps) -> Self {
        self.whens.push((predicate, steps(Steps::new()).into_vec()));
        self
    }

    #[must_use]
    pub fn otherwise(mut self, steps: impl FnOnce(Steps) -> Steps) -> Self {
        self.otherwise = Some(steps(Steps::new()).into_vec());
        self
    }
}

impl std::fmt::Debug for ChoiceDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for (predicate, steps) in &self.whens {
            list.entry(&format_args!("when({predicate:?}, {steps:?})"));
        }
        if let Some(steps) = &self.otherwise {
            list.entry(&format_args!("otherwise({steps:?})"));
        }
        list.finish()
    }
}

// ---------------------------------------------------------------------------
// Error handler
// ---------------------------------------------------------------------------

/// Steps run for an exchange that failed in its route.
///
/// The failure is available to the steps as the `MediatorExceptionCaught`
/// property. When `handled`, the exchange completes successfully afterwards;
/// otherwise the original failure is restored.
#[derive(Debug, Clone)]
pub struct ErrorHandlerDefinition {
    pub(crate) steps: Vec<StepDefinition>,
    pub(crate) handled: bool,
}

impl ErrorHandlerDefinition {
    #[must_use]
    pub fn new(steps: impl FnOnce(Steps) -> Steps) -> Self {
        Self {
            steps: steps(Steps::new()).into_vec(),
            handled: true,
        }
    }

    /// Forwards failed exchanges to `uri` as InOnly and marks them handled.
    #[must_use]
    pub fn dead_letter(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self::new(|steps| steps.to_with_pattern(uri, ExchangePattern::InOnly))
    }

    #[must_use]
    pub fn handled(mut self, handled: bool) -> Self {
        self.handled = handled;
        self
    }

    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.handled
    }
}

// ---------------------------------------------------------------------------
// RouteDefinition
// ---------------------------------------------------------------------------

/// A consumer endpoint and the steps its exchanges run through.
#[derive(Debug, Clone)]
pub struct RouteDefinition {
    pub(crate) id: Option<String>,
    pub(crate) from: String,
    pub(crate) steps: Vec<StepDefinition>,
    pub(crate) error_handler: Option<ErrorHandlerDefinition>,
    pub(crate) auto_start: bool,
}

impl RouteDefinition {
    #[must_use]
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            id: None,
            from: from.into(),
            steps: Vec::new(),
            error_handler: None,
            auto_start: true,
        }
    }

    #[must_use]
    pub fn route_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn error_handler(mut self, handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Whether the route starts with the context. Defaults to true.
    #[must_use]
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    #[must_use]
    pub fn from_uri(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }
}

impl StepBuilder for RouteDefinition {
    fn push_step(&mut self, step: StepDefinition) {
        self.steps.push(step);
    }
}

/// Starts a route definition consuming from `uri`.
#[must_use]
pub fn from(uri: impl Into<String>) -> RouteDefinition {
    RouteDefinition::new(uri)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::expression::{body, has_header};

    #[test]
    fn builder_collects_steps_in_order() {
        let route = from("direct:foo")
            .route_id("greeter")
            .transform(body().prepend("Hello "))
            .set_header("greeted", "yes")
            .to("queue:out");

        assert_eq!(route.id(), Some("greeter"));
        assert_eq!(route.from_uri(), "direct:foo");
        assert_eq!(
            format!("{:?}", route.steps()),
            r#"[set_body(prepend("Hello ", body())), set_header("greeted", "yes"), to(queue:out)]"#
        );
    }

    #[test]
    fn nested_steps_are_kept_per_branch() {
        let route = from("direct:in")
            .filter(has_header("vip"), |s| s.to("direct:vip"))
            .choice(|c| {
                c.when(has_header("a"), |s| s.to("direct:a"))
                    .otherwise(|s| s.stop())
            });

        match &route.steps()[1] {
            StepDefinition::Choice(choice) => {
                assert_eq!(choice.whens.len(), 1);
                assert_eq!(choice.otherwise.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("expected choice, got {other:?}"),
        }
    }

    #[test]
    fn dead_letter_is_handled_in_only_send() {
        let handler = ErrorHandlerDefinition::dead_letter("queue:dlq");
        assert!(handler.is_handled());
        assert!(matches!(
            handler.steps.as_slice(),
            [StepDefinition::To { pattern: Some(ExchangePattern::InOnly), .. }]
        ));
        assert!(!handler.handled(false).is_handled());
    }
}
