//! Caller-facing helper for sending to and requesting from endpoints.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use mediator_core::{Exchange, ExchangePattern, MediationError, Message, Payload, Value};
use tokio_util::sync::CancellationToken;

use crate::component::{EndpointUri, Producer};
use crate::context::MediationContext;

/// Sends exchanges to endpoints by URI.
///
/// Producers are created on first use and reused for later calls to any
/// URI with the same normalized form.
pub struct ProducerTemplate {
    context: Arc<MediationContext>,
    producers: DashMap<String, Arc<dyn Producer>>,
}

impl ProducerTemplate {
    #[must_use]
    pub fn new(context: Arc<MediationContext>) -> Self {
        Self {
            context,
            producers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<MediationContext> {
        &self.context
    }

    fn producer(&self, uri: &str) -> Result<Arc<dyn Producer>, MediationError> {
        let key = EndpointUri::parse(uri)?.normalized();
        if let Some(producer) = self.producers.get(&key) {
            return Ok(Arc::clone(producer.value()));
        }
        let producer = self.context.endpoint(uri)?.create_producer()?;
        Ok(Arc::clone(self.producers.entry(key).or_insert(producer).value()))
    }

    // -- one-way --------------------------------------------------------------

    /// Sends `exchange` as is and returns it once the endpoint is done with
    /// it. Resolution failures are recorded on the exchange.
    pub async fn send(&self, uri: &str, mut exchange: Exchange) -> Exchange {
        match self.producer(uri) {
            Ok(producer) => producer.process(exchange).await,
            Err(error) => {
                exchange.set_exception(error);
                exchange
            }
        }
    }

    /// Fire-and-forget send of `body`.
    ///
    /// # Errors
    ///
    /// Resolution errors, or the failure captured on the exchange.
    pub async fn send_body(
        &self,
        uri: &str,
        body: impl Into<Payload>,
    ) -> Result<(), MediationError> {
        self.send(uri, Exchange::in_only(body)).await.into_result()?;
        Ok(())
    }

    /// # Errors
    ///
    /// As [`send_body`](Self::send_body).
    pub async fn send_body_and_header(
        &self,
        uri: &str,
        body: impl Into<Payload>,
        header: &str,
        value: impl Into<Value>,
    ) -> Result<(), MediationError> {
        let message = Message::new(body).with_header(header, value);
        let exchange = Exchange::new(ExchangePattern::InOnly, message);
        self.send(uri, exchange).await.into_result()?;
        Ok(())
    }

    // -- request-reply ----------------------------------------------------------

    /// Sends `exchange` as InOut and waits for the reply using the
    /// endpoint's timeout.
    pub async fn request(&self, uri: &str, mut exchange: Exchange) -> Exchange {
        exchange.set_pattern(ExchangePattern::InOut);
        self.send(uri, exchange).await
    }

    /// Requests with an explicit timeout, overriding the endpoint's.
    pub async fn request_with_timeout(
        &self,
        uri: &str,
        mut exchange: Exchange,
        timeout: Duration,
    ) -> Exchange {
        exchange.set_pattern(ExchangePattern::InOut);
        match self.producer(uri) {
            Ok(producer) => producer.process_and_await_reply(exchange, timeout).await,
            Err(error) => {
                exchange.set_exception(error);
                exchange
            }
        }
    }

    /// Requests with `body` and returns the reply body.
    ///
    /// # Errors
    ///
    /// Resolution errors, timeouts, or the failure captured on the exchange.
    pub async fn request_body(
        &self,
        uri: &str,
        body: impl Into<Payload>,
    ) -> Result<Payload, MediationError> {
        let reply = self.request(uri, Exchange::in_out(body)).await.into_result()?;
        Ok(reply.message().body().clone())
    }

    /// # Errors
    ///
    /// As [`request_body`](Self::request_body).
    pub async fn request_body_and_header(
        &self,
        uri: &str,
        body: impl Into<Payload>,
        header: &str,
        value: impl Into<Value>,
    ) -> Result<Payload, MediationError> {
        let message = Message::new(body).with_header(header, value);
        let exchange = Exchange::new(ExchangePattern::InOut, message);
        let reply = self.request(uri, exchange).await.into_result()?;
        Ok(reply.message().body().clone())
    }

    /// Requests and converts the reply body to `T`.
    ///
    /// # Errors
    ///
    /// As [`request_body`](Self::request_body), plus `Conversion`.
    pub async fn request_body_as<T: Any + Clone>(
        &self,
        uri: &str,
        body: impl Into<Payload>,
    ) -> Result<T, MediationError> {
        let reply = self.request_body(uri, body).await?;
        Ok(self.context.type_converter().convert_to::<T>(&reply)?)
    }

    /// Requests until a reply arrives, the endpoint times out or `cancel`
    /// fires. Cancelling removes the pending correlation entry; a reply
    /// that arrives afterwards is counted as orphaned.
    ///
    /// # Errors
    ///
    /// `Cancelled` (carrying the exchange id), or as
    /// [`request_body`](Self::request_body).
    pub async fn request_with_cancel(
        &self,
        uri: &str,
        body: impl Into<Payload>,
        cancel: &CancellationToken,
    ) -> Result<Payload, MediationError> {
        let exchange = Exchange::in_out(body);
        let exchange_id = exchange.id().to_string();
        let producer = self.producer(uri)?;

        tokio::select! {
            reply = producer.process(exchange) => {
                Ok(reply.into_result()?.message().body().clone())
            }
            () = cancel.cancelled() => {
                tracing::debug!(uri, exchange_id = %exchange_id, "request cancelled");
                Err(MediationError::Cancelled {
                    correlation_id: exchange_id,
                })
            }
        }
    }

    /// Asynchronous request: returns once the request is handed off.
    /// `callback` receives the completed exchange, including on timeout.
    ///
    /// # Errors
    ///
    /// Resolution errors only; everything later goes to the callback.
    pub fn request_with_callback<F>(
        &self,
        uri: &str,
        body: impl Into<Payload>,
        callback: F,
    ) -> Result<(), MediationError>
    where
        F: FnOnce(Exchange) + Send + 'static,
    {
        let producer = self.producer(uri)?;
        let timeout = self.context.config().default_request_timeout();
        producer.send_with_callback(Exchange::in_out(body), timeout, Box::new(callback));
        Ok(())
    }
}

impl std::fmt::Debug for ProducerTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerTemplate")
            .field("context", &self.context.name())
            .field("producers", &self.producers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::route::expression::{body, header};
    use crate::route::{from, StepBuilder};

    async fn started(routes: Vec<crate::route::RouteDefinition>) -> Arc<MediationContext> {
        let context = Arc::new(MediationContext::new(ContextConfig::default()));
        for route in routes {
            context.add_route(route).await.unwrap();
        }
        context.start().await.unwrap();
        context
    }

    #[tokio::test]
    async fn request_body_returns_reply() {
        let context =
            started(vec![from("direct:greet").transform(body().prepend("Hello "))]).await;
        let template = context.create_producer_template();

        let reply = template.request_body("direct:greet", "Bob").await.unwrap();
        assert_eq!(reply.downcast_ref::<String>().unwrap(), "Hello Bob");
        context.stop().await;
    }

    #[tokio::test]
    async fn request_body_and_header_passes_header() {
        let context = started(vec![from("direct:echo").transform(header("who"))]).await;
        let template = context.create_producer_template();

        let reply: String = template
            .request_body_as("direct:echo", "ignored")
            .await
            .unwrap();
        assert_eq!(reply, "");

        let reply = template
            .request_body_and_header("direct:echo", "ignored", "who", "Ann")
            .await
            .unwrap();
        assert_eq!(reply.downcast_ref::<Value>(), Some(&Value::from("Ann")));
        let text: String = context.type_converter().convert_to(&reply).unwrap();
        assert_eq!(text, "Ann");
        context.stop().await;
    }

    #[tokio::test]
    async fn request_body_as_converts() {
        let context = started(vec![from("direct:n").transform("42")]).await;
        let template = context.create_producer_template();

        let n: i64 = template.request_body_as("direct:n", "x").await.unwrap();
        assert_eq!(n, 42);
        context.stop().await;
    }

    #[tokio::test]
    async fn unknown_scheme_fails_without_panicking() {
        let context = started(Vec::new()).await;
        let template = context.create_producer_template();

        let result = template.send_body("nosuch:x", "body").await;
        assert!(matches!(result, Err(MediationError::UnknownComponent { .. })));

        let exchange = template.request("nosuch:x", Exchange::in_only("x")).await;
        assert_eq!(exchange.pattern(), ExchangePattern::InOut);
        assert!(exchange.is_failed());
        context.stop().await;
    }

    #[tokio::test]
    async fn send_body_surfaces_route_failure() {
        let context = started(vec![from("direct:fail")
            .process_fn("reject", |_| Err(MediationError::processor("reject", "no")))])
        .await;
        let template = context.create_producer_template();

        let result = template.send_body_and_header("direct:fail", "x", "k", "v").await;
        assert!(matches!(
            result,
            Err(MediationError::ProcessorFailure { processor, .. }) if processor == "reject"
        ));
        context.stop().await;
    }
}
