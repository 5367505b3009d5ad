//! Expressions and predicates evaluated against an exchange.
//!
//! Both carry a label used in logs and `Debug` output, e.g.
//! `body().prepend("Hello ")` renders as `prepend("Hello ", body())`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use mediator_core::{Exchange, MediationError, Payload, TypeConverterRegistry, TypeKey, Value};

type EvalFn =
    dyn Fn(&Exchange, &TypeConverterRegistry) -> Result<Payload, MediationError> + Send + Sync;
type TestFn = dyn Fn(&Exchange, &TypeConverterRegistry) -> bool + Send + Sync;

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// Computes a payload from an exchange.
#[derive(Clone)]
pub struct Expression {
    label: Arc<str>,
    eval: Arc<EvalFn>,
}

impl Expression {
    pub fn from_fn<F>(label: impl Into<String>, eval: F) -> Self
    where
        F: Fn(&Exchange, &TypeConverterRegistry) -> Result<Payload, MediationError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            label: Arc::from(label.into()),
            eval: Arc::new(eval),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// # Errors
    ///
    /// Whatever the expression or a conversion inside it fails with.
    pub fn evaluate(
        &self,
        exchange: &Exchange,
        converters: &TypeConverterRegistry,
    ) -> Result<Payload, MediationError> {
        (self.eval)(exchange, converters)
    }

    /// Evaluates and converts the result to `T`.
    ///
    /// # Errors
    ///
    /// As [`evaluate`](Self::evaluate), plus `Conversion` if the result
    /// cannot be converted.
    pub fn evaluate_as<T: Any + Clone>(
        &self,
        exchange: &Exchange,
        converters: &TypeConverterRegistry,
    ) -> Result<T, MediationError> {
        let value = self.evaluate(exchange, converters)?;
        Ok(converters.convert_to::<T>(&value)?)
    }

    /// Text of `prefix` followed by this expression's value as text.
    #[must_use]
    pub fn prepend(self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let label = format!("prepend({prefix:?}, {})", self.label);
        Self::from_fn(label, move |exchange, converters| {
            let text: String = self.evaluate_as(exchange, converters)?;
            Ok(Payload::from(format!("{prefix}{text}")))
        })
    }

    /// This expression's value as text followed by `suffix`.
    #[must_use]
    pub fn append(self, suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        let label = format!("append({}, {suffix:?})", self.label);
        Self::from_fn(label, move |exchange, converters| {
            let text: String = self.evaluate_as(exchange, converters)?;
            Ok(Payload::from(format!("{text}{suffix}")))
        })
    }

    /// Converts the value to `T` through the registry.
    #[must_use]
    pub fn convert_to<T: Any>(self) -> Self {
        let target = TypeKey::of::<T>();
        let label = format!("convert({}, {})", self.label, target.name());
        Self::from_fn(label, move |exchange, converters| {
            let value = self.evaluate(exchange, converters)?;
            Ok(converters.convert(&value, target)?)
        })
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl From<&str> for Expression {
    fn from(value: &str) -> Self {
        constant(value)
    }
}

impl From<String> for Expression {
    fn from(value: String) -> Self {
        constant(value)
    }
}

/// The body of the effective message.
#[must_use]
pub fn body() -> Expression {
    Expression::from_fn("body()", |exchange, _| Ok(exchange.message().body().clone()))
}

/// A header of the effective message, or the empty payload if absent.
#[must_use]
pub fn header(name: impl Into<String>) -> Expression {
    let name = name.into();
    Expression::from_fn(format!("header({name:?})"), move |exchange, _| {
        Ok(exchange
            .message()
            .header(&name)
            .cloned()
            .map_or_else(Payload::empty, Payload::from))
    })
}

/// An exchange property, or the empty payload if absent.
#[must_use]
pub fn property(name: impl Into<String>) -> Expression {
    let name = name.into();
    Expression::from_fn(format!("property({name:?})"), move |exchange, _| {
        Ok(exchange.property(&name).cloned().unwrap_or_else(Payload::empty))
    })
}

#[must_use]
pub fn constant(value: impl Into<Payload>) -> Expression {
    let value = value.into();
    let label = value
        .render_text()
        .map_or_else(|| format!("constant({})", value.type_name()), |t| format!("{t:?}"));
    Expression::from_fn(label, move |_, _| Ok(value.clone()))
}

#[must_use]
pub fn exchange_id() -> Expression {
    Expression::from_fn("exchange_id()", |exchange, _| {
        Ok(Payload::from(exchange.id().to_string()))
    })
}

// ---------------------------------------------------------------------------
// Predicate
// ---------------------------------------------------------------------------

/// Boolean test over an exchange. Evaluation never fails: a value that
/// cannot be compared makes the predicate false.
#[derive(Clone)]
pub struct Predicate {
    label: Arc<str>,
    test: Arc<TestFn>,
}

impl Predicate {
    pub fn from_fn<F>(label: impl Into<String>, test: F) -> Self
    where
        F: Fn(&Exchange, &TypeConverterRegistry) -> bool + Send + Sync + 'static,
    {
        Self {
            label: Arc::from(label.into()),
            test: Arc::new(test),
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn matches(&self, exchange: &Exchange, converters: &TypeConverterRegistry) -> bool {
        (self.test)(exchange, converters)
    }

    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        let label = format!("and({}, {})", self.label, other.label);
        Self::from_fn(label, move |exchange, converters| {
            self.matches(exchange, converters) && other.matches(exchange, converters)
        })
    }

    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        let label = format!("or({}, {})", self.label, other.label);
        Self::from_fn(label, move |exchange, converters| {
            self.matches(exchange, converters) || other.matches(exchange, converters)
        })
    }
}

impl std::ops::Not for Predicate {
    type Output = Self;

    fn not(self) -> Self {
        let label = format!("not({})", self.label);
        Self::from_fn(label, move |exchange, converters| {
            !self.matches(exchange, converters)
        })
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

#[must_use]
pub fn header_equals(name: impl Into<String>, expected: impl Into<Value>) -> Predicate {
    let name = name.into();
    let expected = expected.into();
    Predicate::from_fn(format!("header({name:?}) == {expected}"), move |exchange, _| {
        exchange.message().header(&name) == Some(&expected)
    })
}

#[must_use]
pub fn has_header(name: impl Into<String>) -> Predicate {
    let name = name.into();
    Predicate::from_fn(format!("has_header({name:?})"), move |exchange, _| {
        exchange.message().headers().contains(&name)
    })
}

/// Compares the body, rendered as text, with `expected`.
#[must_use]
pub fn body_equals(expected: impl Into<String>) -> Predicate {
    let expected = expected.into();
    Predicate::from_fn(format!("body() == {expected:?}"), move |exchange, converters| {
        converters
            .try_convert_to::<String>(exchange.message().body())
            .is_some_and(|body| body == expected)
    })
}
