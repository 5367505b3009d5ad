//! The exchange: one unit of in-flight routing work.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::error::MediationError;
use crate::message::Message;
use crate::payload::Payload;

/// Property under which a route error handler finds the caught exception.
pub const EXCEPTION_CAUGHT: &str = "MediatorExceptionCaught";

/// Unique exchange identifier (UUID v4 text).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeId(String);

impl ExchangeId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangePattern {
    /// Fire-and-forget.
    #[default]
    InOnly,
    /// A reply is expected; the caller suspends until it arrives or times out.
    InOut,
}

impl ExchangePattern {
    /// Parses `InOnly` / `InOut`, case-insensitively.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "inonly" => Some(Self::InOnly),
            "inout" => Some(Self::InOut),
            _ => None,
        }
    }
}

impl fmt::Display for ExchangePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InOnly => f.write_str("InOnly"),
            Self::InOut => f.write_str("InOut"),
        }
    }
}

/// Unit of routing work wrapping an inbound message and an optional reply.
///
/// Exchanges are deliberately not `Clone`: each has a unique id and flows
/// through one route chain per hop. Use [`Exchange::copy`] to fork one.
#[derive(Debug)]
pub struct Exchange {
    id: ExchangeId,
    pattern: ExchangePattern,
    in_message: Message,
    out_message: Option<Message>,
    properties: HashMap<String, Payload>,
    exception: Option<MediationError>,
    from_endpoint: Option<String>,
    from_route: Option<String>,
    route_stop: bool,
    created_at: Instant,
}

impl Exchange {
    #[must_use]
    pub fn new(pattern: ExchangePattern, message: Message) -> Self {
        Self {
            id: ExchangeId::generate(),
            pattern,
            in_message: message,
            out_message: None,
            properties: HashMap::new(),
            exception: None,
            from_endpoint: None,
            from_route: None,
            route_stop: false,
            created_at: Instant::now(),
        }
    }

    pub fn in_only(body: impl Into<Payload>) -> Self {
        Self::new(ExchangePattern::InOnly, Message::new(body))
    }

    pub fn in_out(body: impl Into<Payload>) -> Self {
        Self::new(ExchangePattern::InOut, Message::new(body))
    }

    #[must_use]
    pub fn id(&self) -> &ExchangeId {
        &self.id
    }

    #[must_use]
    pub fn pattern(&self) -> ExchangePattern {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: ExchangePattern) {
        self.pattern = pattern;
    }

    #[must_use]
    pub fn in_message(&self) -> &Message {
        &self.in_message
    }

    pub fn in_message_mut(&mut self) -> &mut Message {
        &mut self.in_message
    }

    #[must_use]
    pub fn out_message(&self) -> Option<&Message> {
        self.out_message.as_ref()
    }

    pub fn set_out_message(&mut self, message: Message) {
        self.out_message = Some(message);
    }

    pub fn take_out_message(&mut self) -> Option<Message> {
        self.out_message.take()
    }

    /// The effective message: the reply if one was set, otherwise the input.
    #[must_use]
    pub fn message(&self) -> &Message {
        self.out_message.as_ref().unwrap_or(&self.in_message)
    }

    pub fn message_mut(&mut self) -> &mut Message {
        match self.out_message {
            Some(ref mut out) => out,
            None => &mut self.in_message,
        }
    }

    /// Moves the reply (if any) into the input slot, so the next step sees
    /// the previous step's result as its input.
    pub fn promote_out_to_in(&mut self) {
        if let Some(out) = self.out_message.take() {
            self.in_message = out;
        }
    }

    /// Consumes the exchange, yielding the effective message.
    #[must_use]
    pub fn into_message(self) -> Message {
        self.out_message.unwrap_or(self.in_message)
    }

    #[must_use]
    pub fn property(&self, key: &str) -> Option<&Payload> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Payload>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Payload> {
        self.properties.remove(key)
    }

    #[must_use]
    pub fn properties(&self) -> &HashMap<String, Payload> {
        &self.properties
    }

    #[must_use]
    pub fn exception(&self) -> Option<&MediationError> {
        self.exception.as_ref()
    }

    pub fn set_exception(&mut self, err: MediationError) {
        self.exception = Some(err);
    }

    pub fn take_exception(&mut self) -> Option<MediationError> {
        self.exception.take()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.exception.is_some()
    }

    /// Marks the exchange so that no further steps run, without failing it.
    pub fn stop_routing(&mut self) {
        self.route_stop = true;
    }

    #[must_use]
    pub fn is_route_stopped(&self) -> bool {
        self.route_stop
    }

    /// Clears the stop flag; called when the exchange leaves its route.
    pub fn reset_route_stop(&mut self) {
        self.route_stop = false;
    }

    #[must_use]
    pub fn from_endpoint(&self) -> Option<&str> {
        self.from_endpoint.as_deref()
    }

    pub fn set_from_endpoint(&mut self, uri: impl Into<String>) {
        self.from_endpoint = Some(uri.into());
    }

    #[must_use]
    pub fn from_route(&self) -> Option<&str> {
        self.from_route.as_deref()
    }

    pub fn set_from_route(&mut self, route_id: impl Into<String>) {
        self.from_route = Some(route_id.into());
    }

    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Forks the exchange: fresh id, same pattern, copied messages and
    /// properties. The exception state is not carried over.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            id: ExchangeId::generate(),
            pattern: self.pattern,
            in_message: self.in_message.clone(),
            out_message: self.out_message.clone(),
            properties: self.properties.clone(),
            exception: None,
            from_endpoint: self.from_endpoint.clone(),
            from_route: self.from_route.clone(),
            route_stop: false,
            created_at: Instant::now(),
        }
    }

    /// Copy that keeps the id and creation time.
    ///
    /// Transports hold one while the original is moved into another task, so
    /// a timeout can still be reported against the same exchange.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            id: self.id.clone(),
            created_at: self.created_at,
            ..self.copy()
        }
    }

    /// Converts a finished exchange into the caller-facing outcome.
    ///
    /// # Errors
    ///
    /// Returns the captured exception if the exchange failed.
    pub fn into_result(mut self) -> Result<Self, MediationError> {
        match self.exception.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}
