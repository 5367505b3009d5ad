//! Built-in processors backing the route DSL steps.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mediator_core::{
    Exchange, ExchangePattern, MediationError, Processor, TypeConverterRegistry, TypeKey, Value,
};
use parking_lot::Mutex;
use tokio::time::Instant;

use super::definition::ConversionPolicy;
use super::expression::{Expression, Predicate};
use super::pipeline::Pipeline;
use crate::component::Producer;

// ---------------------------------------------------------------------------
// Message manipulation
// ---------------------------------------------------------------------------

pub struct SetBody {
    expression: Expression,
    converters: Arc<TypeConverterRegistry>,
}

impl SetBody {
    pub fn new(expression: Expression, converters: Arc<TypeConverterRegistry>) -> Self {
        Self {
            expression,
            converters,
        }
    }
}

#[async_trait]
impl Processor for SetBody {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        match self.expression.evaluate(&exchange, &self.converters) {
            Ok(body) => exchange.message_mut().set_body(body),
            Err(e) => exchange.set_exception(e),
        }
        exchange
    }

    fn name(&self) -> &str {
        "set_body"
    }
}

pub struct SetHeader {
    header: String,
    expression: Expression,
    converters: Arc<TypeConverterRegistry>,
}

impl SetHeader {
    pub fn new(
        header: impl Into<String>,
        expression: Expression,
        converters: Arc<TypeConverterRegistry>,
    ) -> Self {
        Self {
            header: header.into(),
            expression,
            converters,
        }
    }
}

#[async_trait]
impl Processor for SetHeader {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        match self
            .expression
            .evaluate_as::<Value>(&exchange, &self.converters)
        {
            Ok(value) => exchange.message_mut().set_header(self.header.clone(), value),
            Err(e) => exchange.set_exception(e),
        }
        exchange
    }

    fn name(&self) -> &str {
        "set_header"
    }
}

pub struct RemoveHeader {
    header: String,
}

impl RemoveHeader {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }
}

#[async_trait]
impl Processor for RemoveHeader {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        exchange.message_mut().remove_header(&self.header);
        exchange
    }

    fn name(&self) -> &str {
        "remove_header"
    }
}

pub struct SetProperty {
    property: String,
    expression: Expression,
    converters: Arc<TypeConverterRegistry>,
}

impl SetProperty {
    pub fn new(
        property: impl Into<String>,
        expression: Expression,
        converters: Arc<TypeConverterRegistry>,
    ) -> Self {
        Self {
            property: property.into(),
            expression,
            converters,
        }
    }
}

#[async_trait]
impl Processor for SetProperty {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        match self.expression.evaluate(&exchange, &self.converters) {
            Ok(value) => exchange.set_property(self.property.clone(), value),
            Err(e) => exchange.set_exception(e),
        }
        exchange
    }

    fn name(&self) -> &str {
        "set_property"
    }
}

/// Converts the body to a target type through the registry.
pub struct ConvertBody {
    target: TypeKey,
    policy: ConversionPolicy,
    converters: Arc<TypeConverterRegistry>,
}

impl ConvertBody {
    pub fn new(
        target: TypeKey,
        policy: ConversionPolicy,
        converters: Arc<TypeConverterRegistry>,
    ) -> Self {
        Self {
            target,
            policy,
            converters,
        }
    }
}

#[async_trait]
impl Processor for ConvertBody {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        let converted = self
            .converters
            .convert(exchange.message().body(), self.target);
        match (converted, self.policy) {
            (Ok(body), _) => exchange.message_mut().set_body(body),
            (Err(e), ConversionPolicy::Fail) => exchange.set_exception(e.into()),
            (Err(e), ConversionPolicy::Skip) => {
                tracing::debug!(exchange_id = %exchange.id(), error = %e, "body conversion skipped");
            }
        }
        exchange
    }

    fn name(&self) -> &str {
        "convert_body"
    }
}

// ---------------------------------------------------------------------------
// Send
// ---------------------------------------------------------------------------

/// Sends the exchange through a producer resolved when the route started.
pub struct SendTo {
    producer: Arc<dyn Producer>,
    pattern: Option<ExchangePattern>,
}

impl SendTo {
    pub fn new(producer: Arc<dyn Producer>, pattern: Option<ExchangePattern>) -> Self {
        Self { producer, pattern }
    }
}

#[async_trait]
impl Processor for SendTo {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        let Some(pattern) = self.pattern else {
            return self.producer.process(exchange).await;
        };
        let original = exchange.pattern();
        exchange.set_pattern(pattern);
        let mut exchange = self.producer.process(exchange).await;
        exchange.set_pattern(original);
        exchange
    }

    fn name(&self) -> &str {
        self.producer.endpoint_uri()
    }
}

// ---------------------------------------------------------------------------
// Branching
// ---------------------------------------------------------------------------

pub struct Filter {
    predicate: Predicate,
    steps: Pipeline,
    converters: Arc<TypeConverterRegistry>,
}

impl Filter {
    pub fn new(
        predicate: Predicate,
        steps: Pipeline,
        converters: Arc<TypeConverterRegistry>,
    ) -> Self {
        Self {
            predicate,
            steps,
            converters,
        }
    }
}

#[async_trait]
impl Processor for Filter {
    async fn process(&self, exchange: Exchange) -> Exchange {
        if self.predicate.matches(&exchange, &self.converters) {
            self.steps.run(exchange).await
        } else {
            exchange
        }
    }

    fn name(&self) -> &str {
        "filter"
    }
}

pub struct Choice {
    whens: Vec<(Predicate, Pipeline)>,
    otherwise: Option<Pipeline>,
    converters: Arc<TypeConverterRegistry>,
}

impl Choice {
    pub fn new(
        whens: Vec<(Predicate, Pipeline)>,
        otherwise: Option<Pipeline>,
        converters: Arc<TypeConverterRegistry>,
    ) -> Self {
        Self {
            whens,
            otherwise,
            converters,
        }
    }
}

#[async_trait]
impl Processor for Choice {
    async fn process(&self, exchange: Exchange) -> Exchange {
        let branch = self
            .whens
            .iter()
            .find(|(predicate, _)| predicate.matches(&exchange, &self.converters))
            .map(|(_, steps)| steps)
            .or(self.otherwise.as_ref());
        match branch {
            Some(steps) => steps.run(exchange).await,
            None => exchange,
        }
    }

    fn name(&self) -> &str {
        "choice"
    }
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

pub struct Delay {
    duration: Duration,
}

impl Delay {
    #[must_use]
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl Processor for Delay {
    async fn process(&self, exchange: Exchange) -> Exchange {
        tokio::time::sleep(self.duration).await;
        exchange
    }

    fn name(&self) -> &str {
        "delay"
    }
}

/// Sliding-window rate limit shared by every exchange passing the step.
pub struct Throttle {
    max: usize,
    period: Duration,
    window: Mutex<VecDeque<Instant>>,
}

impl Throttle {
    #[must_use]
    pub fn new(max: usize, period: Duration) -> Self {
        let max = max.max(1);
        Self {
            max,
            period,
            window: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// Takes a slot, or returns how long to wait for the oldest to expire.
    fn try_acquire(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.period)
        {
            window.pop_front();
        }
        if window.len() < self.max {
            window.push_back(now);
            return None;
        }
        window
            .front()
            .map(|oldest| self.period.saturating_sub(now.duration_since(*oldest)))
    }
}

#[async_trait]
impl Processor for Throttle {
    async fn process(&self, exchange: Exchange) -> Exchange {
        while let Some(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
        exchange
    }

    fn name(&self) -> &str {
        "throttle"
    }
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

pub struct Log {
    route_id: String,
    message: Expression,
    converters: Arc<TypeConverterRegistry>,
}

impl Log {
    pub fn new(
        route_id: impl Into<String>,
        message: Expression,
        converters: Arc<TypeConverterRegistry>,
    ) -> Self {
        Self {
            route_id: route_id.into(),
            message,
            converters,
        }
    }
}

#[async_trait]
impl Processor for Log {
    async fn process(&self, exchange: Exchange) -> Exchange {
        let text = match self.message.evaluate(&exchange, &self.converters) {
            Ok(value) => self
                .converters
                .try_convert_to::<String>(&value)
                .unwrap_or_else(|| format!("<{}>", value.type_name())),
            Err(e) => format!("<{e}>"),
        };
        tracing::info!(route = %self.route_id, exchange_id = %exchange.id(), "{text}");
        exchange
    }

    fn name(&self) -> &str {
        "log"
    }
}

type ExchangeFn = dyn Fn(&mut Exchange) -> Result<(), MediationError> + Send + Sync;

/// Adapts a synchronous closure.
pub struct FnProcessor {
    name: String,
    f: Box<ExchangeFn>,
}

impl FnProcessor {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange) -> Result<(), MediationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

#[async_trait]
impl Processor for FnProcessor {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        if let Err(e) = (self.f)(&mut exchange) {
            exchange.set_exception(e);
        }
        exchange
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct Stop;

#[async_trait]
impl Processor for Stop {
    async fn process(&self, mut exchange: Exchange) -> Exchange {
        exchange.stop_routing();
        exchange
    }

    fn name(&self) -> &str {
        "stop"
    }
}

#[cfg(test)]
mod tests {
    use mediator_core::{ConversionError, Message};

    use super::*;
    use crate::route::expression::{body, header, header_equals};

    fn converters() -> Arc<TypeConverterRegistry> {
        Arc::new(TypeConverterRegistry::with_defaults())
    }

    fn text(exchange: &Exchange) -> String {
        exchange
            .message()
            .body_ref::<String>()
            .cloned()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn set_header_converts_to_value() {
        let step = SetHeader::new("greeting", body().prepend("Hi "), converters());
        let exchange = step.process(Exchange::in_only("Bob")).await;
        assert_eq!(
            exchange.message().headers().get_str("greeting"),
            Some("Hi Bob")
        );
    }

    #[tokio::test]
    async fn convert_body_honors_policy() {
        let failing = ConvertBody::new(TypeKey::of::<i64>(), ConversionPolicy::Fail, converters());
        let result = failing.process(Exchange::in_only("abc")).await;
        assert!(matches!(
            result.exception(),
            Some(MediationError::Conversion(ConversionError::Failed { .. }))
        ));

        let skipping = ConvertBody::new(TypeKey::of::<i64>(), ConversionPolicy::Skip, converters());
        let result = skipping.process(Exchange::in_only("abc")).await;
        assert!(result.exception().is_none());
        assert_eq!(text(&result), "abc");

        let result = failing.process(Exchange::in_only("41")).await;
        assert_eq!(result.message().body_ref::<i64>(), Some(&41));
    }

    #[tokio::test]
    async fn choice_takes_first_matching_branch() {
        let converters = converters();
        let branch = |label: &str| {
            Pipeline::new(vec![Arc::new(SetBody::new(
                Expression::from(label),
                Arc::clone(&converters),
            )) as Arc<dyn Processor>])
        };
        let choice = Choice::new(
            vec![
                (header_equals("kind", "a"), branch("first")),
                (header_equals("kind", "a"), branch("second")),
            ],
            Some(branch("fallback")),
            Arc::clone(&converters),
        );

        let matched = Exchange::new(
            ExchangePattern::InOnly,
            Message::new("x").with_header("kind", "a"),
        );
        assert_eq!(text(&choice.process(matched).await), "first");
        assert_eq!(text(&choice.process(Exchange::in_only("x")).await), "fallback");
    }

    #[tokio::test]
    async fn log_step_leaves_exchange_untouched() {
        let step = Log::new("r1", header("missing").append("!"), converters());
        let exchange = step.process(Exchange::in_only("same")).await;
        assert_eq!(text(&exchange), "same");
        assert!(exchange.exception().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spreads_exchanges_over_period() {
        let throttle = Throttle::new(2, Duration::from_millis(100));
        let start = Instant::now();
        for _ in 0..5 {
            throttle.process(Exchange::in_only("x")).await;
        }
        // Slots open at 0, 0, 100, 100, 200 ms.
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn fn_processor_error_fails_exchange() {
        let step = FnProcessor::new("reject", |_| Err(MediationError::processor("reject", "nope")));
        let result = step.process(Exchange::in_only("x")).await;
        assert!(result.is_failed());
        assert_eq!(step.name(), "reject");
    }

    #[tokio::test]
    async fn send_to_restores_pattern() {
        struct Echo;

        #[async_trait]
        impl Producer for Echo {
            fn endpoint_uri(&self) -> &str {
                "test:echo"
            }

            async fn process(&self, mut exchange: Exchange) -> Exchange {
                let seen = exchange.pattern().to_string();
                exchange.set_property("seen", seen);
                exchange
            }

            async fn process_and_await_reply(
                &self,
                exchange: Exchange,
                _timeout: Duration,
            ) -> Exchange {
                exchange
            }
        }

        let step = SendTo::new(Arc::new(Echo), Some(ExchangePattern::InOnly));
        let result = step.process(Exchange::in_out("x")).await;
        assert_eq!(result.pattern(), ExchangePattern::InOut);
        assert_eq!(
            result.property("seen").and_then(|p| p.downcast_ref::<String>()),
            Some(&"InOnly".to_string())
        );
        assert_eq!(step.name(), "test:echo");
    }
}
