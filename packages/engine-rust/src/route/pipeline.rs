//! Step execution: turns step definitions into processors and runs them.

use std::sync::Arc;

use async_trait::async_trait;
use mediator_core::{Exchange, MediationError, Payload, Processor, EXCEPTION_CAUGHT};

use super::definition::{ErrorHandlerDefinition, StepDefinition};
use super::processor::{
    Choice, ConvertBody, Delay, Filter, Log, RemoveHeader, SendTo, SetBody, SetHeader,
    SetProperty, Stop, Throttle,
};
use crate::context::MediationContext;

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Ordered processors run one after another.
///
/// Stops at the first step that fails the exchange or stops routing. Before
/// each step the previous step's reply becomes the input.
#[derive(Clone)]
pub struct Pipeline {
    steps: Arc<[Arc<dyn Processor>]>,
}

impl Pipeline {
    #[must_use]
    pub fn new(steps: Vec<Arc<dyn Processor>>) -> Self {
        Self {
            steps: steps.into(),
        }
    }

    /// Resolves `steps` against the context: endpoints and producers are
    /// created now, so a bad URI fails here rather than on first use.
    ///
    /// # Errors
    ///
    /// Any endpoint resolution or producer creation error.
    pub fn build(
        steps: &[StepDefinition],
        context: &MediationContext,
        route_id: &str,
    ) -> Result<Self, MediationError> {
        let processors = steps
            .iter()
            .map(|step| build_step(step, context, route_id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(processors))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run(&self, mut exchange: Exchange) -> Exchange {
        for step in self.steps.iter() {
            if exchange.is_failed() || exchange.is_route_stopped() {
                break;
            }
            exchange.promote_out_to_in();
            exchange = step.process(exchange).await;
        }
        exchange
    }
}

#[async_trait]
impl Processor for Pipeline {
    async fn process(&self, exchange: Exchange) -> Exchange {
        self.run(exchange).await
    }

    fn name(&self) -> &str {
        "pipeline"
    }
}

fn build_step(
    step: &StepDefinition,
    context: &MediationContext,
    route_id: &str,
) -> Result<Arc<dyn Processor>, MediationError> {
    let converters = Arc::clone(context.type_converter());
    let processor: Arc<dyn Processor> = match step {
        StepDefinition::SetBody(expression) => {
            Arc::new(SetBody::new(expression.clone(), converters))
        }
        StepDefinition::SetHeader { name, value } => {
            Arc::new(SetHeader::new(name.clone(), value.clone(), converters))
        }
        StepDefinition::RemoveHeader(name) => Arc::new(RemoveHeader::new(name.clone())),
        StepDefinition::SetProperty { name, value } => {
            Arc::new(SetProperty::new(name.clone(), value.clone(), converters))
        }
        StepDefinition::ConvertBody { target, policy } => {
            Arc::new(ConvertBody::new(*target, *policy, converters))
        }
        StepDefinition::To { uri, pattern } => {
            let producer = context.endpoint(uri)?.create_producer()?;
            Arc::new(SendTo::new(producer, *pattern))
        }
        StepDefinition::Filter { predicate, steps } => Arc::new(Filter::new(
            predicate.clone(),
            Pipeline::build(steps, context, route_id)?,
            converters,
        )),
        StepDefinition::Choice(choice) => {
            let whens = choice
                .whens
                .iter()
                .map(|(predicate, steps)| {
                    Ok((predicate.clone(), Pipeline::build(steps, context, route_id)?))
                })
                .collect::<Result<Vec<_>, MediationError>>()?;
            let otherwise = choice
                .otherwise
                .as_deref()
                .map(|steps| Pipeline::build(steps, context, route_id))
                .transpose()?;
            Arc::new(Choice::new(whens, otherwise, converters))
        }
        StepDefinition::Delay(duration) => Arc::new(Delay::new(*duration)),
        StepDefinition::Throttle { max, period } => Arc::new(Throttle::new(*max, *period)),
        StepDefinition::Log(message) => Arc::new(Log::new(route_id, message.clone(), converters)),
        StepDefinition::Process(processor) => Arc::clone(processor),
        StepDefinition::Stop => Arc::new(Stop),
    };
    Ok(processor)
}

// ---------------------------------------------------------------------------
// RouteProcessor
// ---------------------------------------------------------------------------

struct ErrorHandler {
    steps: Pipeline,
    handled: bool,
}

/// A route's main pipeline plus its optional error handler.
pub struct RouteProcessor {
    route_id: String,
    steps: Pipeline,
    error_handler: Option<ErrorHandler>,
}

impl RouteProcessor {
    /// # Errors
    ///
    /// Any error from building the main steps or the error handler's steps.
    pub fn build(
        route_id: &str,
        steps: &[StepDefinition],
        error_handler: Option<&ErrorHandlerDefinition>,
        context: &MediationContext,
    ) -> Result<Self, MediationError> {
        let error_handler = error_handler
            .map(|handler| {
                Ok::<_, MediationError>(ErrorHandler {
                    steps: Pipeline::build(&handler.steps, context, route_id)?,
                    handled: handler.handled,
                })
            })
            .transpose()?;
        Ok(Self {
            route_id: route_id.to_string(),
            steps: Pipeline::build(steps, context, route_id)?,
            error_handler,
        })
    }
}

#[async_trait]
impl Processor for RouteProcessor {
    async fn process(&self, exchange: Exchange) -> Exchange {
        let mut exchange = self.steps.run(exchange).await;

        if let Some(handler) = &self.error_handler {
            if let Some(error) = exchange.take_exception() {
                tracing::debug!(
                    route = %self.route_id,
                    exchange_id = %exchange.id(),
                    error = %error,
                    "running error handler"
                );
                exchange.set_property(EXCEPTION_CAUGHT, Payload::displayable(error.clone()));
                exchange.reset_route_stop();
                exchange = handler.steps.run(exchange).await;
                if !handler.handled && !exchange.is_failed() {
                    exchange.set_exception(error);
                }
            }
        }

        exchange.reset_route_stop();
        exchange
    }

    fn name(&self) -> &str {
        &self.route_id
    }
}
