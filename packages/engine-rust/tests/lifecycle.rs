//! Context start/stop behaviour with traffic in flight.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediator_engine::route::expression::body;
use mediator_engine::{from, ContextState, Exchange, MediationError, RouteDefinition, StepBuilder};

use support::{eventually, started_context, test_config};

fn slow_route(delay: Duration, marker: &Arc<AtomicUsize>) -> RouteDefinition {
    let marker = Arc::clone(marker);
    from("queue:slow")
        .route_id("slow")
        .delay(delay)
        .process_fn("mark", move |_| {
            marker.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
}

#[tokio::test]
async fn stop_waits_for_in_flight_exchanges() {
    let marker = Arc::new(AtomicUsize::new(0));
    let context = started_context(
        test_config(),
        vec![slow_route(Duration::from_millis(200), &marker)],
    )
    .await;
    let template = context.create_producer_template();

    template.send_body("queue:slow", "job").await.unwrap();
    let watched = Arc::clone(&context);
    assert!(eventually(Duration::from_secs(1), || watched.in_flight_count() == 1).await);

    context.stop().await;
    assert_eq!(context.state(), ContextState::Stopped);
    assert_eq!(marker.load(Ordering::SeqCst), 1);
    assert_eq!(context.in_flight_count(), 0);
}

#[tokio::test]
async fn stop_aborts_after_grace_period() {
    let marker = Arc::new(AtomicUsize::new(0));
    let mut config = test_config();
    config.shutdown_grace_period_ms = 50;
    let context = started_context(config, vec![slow_route(Duration::from_secs(30), &marker)]).await;
    let template = context.create_producer_template();

    template.send_body("queue:slow", "job").await.unwrap();
    let watched = Arc::clone(&context);
    assert!(eventually(Duration::from_secs(1), || watched.in_flight_count() == 1).await);

    let started = Instant::now();
    context.stop().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(marker.load(Ordering::SeqCst), 0);
    assert_eq!(context.in_flight_count(), 0);
}

#[tokio::test]
async fn stop_cancels_pending_requests() {
    let context = started_context(test_config(), Vec::new()).await;
    let template = Arc::new(context.create_producer_template());

    let waiting = {
        let template = Arc::clone(&template);
        tokio::spawn(async move {
            template
                .request_with_timeout(
                    "queue:void?replyTo=void.replies",
                    Exchange::in_out("x"),
                    Duration::from_secs(30),
                )
                .await
        })
    };
    let correlation = Arc::clone(context.correlation());
    assert!(eventually(Duration::from_secs(1), || correlation.pending_count() == 1).await);

    context.stop().await;
    let exchange = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        exchange.exception(),
        Some(MediationError::Cancelled { .. })
    ));
    assert_eq!(correlation.pending_count(), 0);
}

#[tokio::test]
async fn context_restarts_with_same_routes() {
    let context = started_context(
        test_config(),
        vec![from("queue:greet").transform(body().prepend("Hello "))],
    )
    .await;
    let template = context.create_producer_template();

    let first: String = template
        .request_body_as("queue:greet?replyTo=greet.replies", "A")
        .await
        .unwrap();
    context.stop().await;
    // Stopping twice is harmless.
    context.stop().await;

    context.start().await.unwrap();
    let second: String = template
        .request_body_as("queue:greet?replyTo=greet.replies", "B")
        .await
        .unwrap();
    assert_eq!(first, "Hello A");
    assert_eq!(second, "Hello B");
    context.stop().await;
}

#[tokio::test]
async fn contexts_are_independent() {
    let english = started_context(
        test_config(),
        vec![from("direct:greet").transform(body().prepend("Hello "))],
    )
    .await;
    let french = started_context(
        test_config(),
        vec![from("direct:greet").transform(body().prepend("Bonjour "))],
    )
    .await;

    let a: String = english
        .create_producer_template()
        .request_body_as("direct:greet", "Ann")
        .await
        .unwrap();
    let b: String = french
        .create_producer_template()
        .request_body_as("direct:greet", "Ann")
        .await
        .unwrap();
    assert_eq!(a, "Hello Ann");
    assert_eq!(b, "Bonjour Ann");

    english.stop().await;
    french.stop().await;
}
