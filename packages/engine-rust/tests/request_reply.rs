//! Request-reply over `direct` and `queue` transports.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use mediator_core::header_names as names;
use mediator_engine::component::queue::QueueComponent;
use mediator_engine::route::expression::body;
use mediator_engine::{from, Exchange, MediationError, Message, Processor, StepBuilder};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use support::{eventually, started_context, test_config};

const LETTERS: [&str; 5] = ["A", "B", "C", "D", "E"];

async fn assert_each_caller_gets_its_own_reply(
    template: &mediator_engine::ProducerTemplate,
    uri: &str,
) {
    let requests = LETTERS
        .iter()
        .map(|letter| template.request_body_as::<String>(uri, *letter));
    let replies = join_all(requests).await;

    for (letter, reply) in LETTERS.iter().zip(replies) {
        assert_eq!(reply.unwrap(), format!("Hello {letter}"));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_reply_queue() {
    let context = started_context(test_config(), Vec::new()).await;
    context
        .add_component("jms", QueueComponent::default())
        .await
        .unwrap();
    context
        .add_route(from("jms:foo").transform(body().prepend("Hello ")))
        .await
        .unwrap();
    let template = context.create_producer_template();

    assert_each_caller_gets_its_own_reply(&template, "jms:foo?replyTo=bar").await;

    assert_eq!(context.correlation().pending_count(), 0);
    assert_eq!(context.correlation().completed_replies(), 5);
    assert!(context.correlation().has_reply_consumer("jms:bar"));
    context.stop().await;
}

/// Holds each exchange for longer the earlier its letter, then records it.
#[derive(Default)]
struct ReverseDelay {
    finished: Mutex<Vec<String>>,
}

#[async_trait]
impl Processor for ReverseDelay {
    async fn process(&self, exchange: Exchange) -> Exchange {
        let letter = exchange
            .message()
            .body_ref::<String>()
            .cloned()
            .unwrap_or_default();
        let rank = LETTERS.iter().position(|l| *l == letter).unwrap_or(0);
        let steps = u64::try_from(LETTERS.len() - rank).unwrap_or(1);
        tokio::time::sleep(Duration::from_millis(50 * steps)).await;
        self.finished.lock().push(letter);
        exchange
    }

    fn name(&self) -> &str {
        "reverse-delay"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_matched_when_completing_out_of_order() {
    let context = started_context(test_config(), Vec::new()).await;
    context
        .add_component("jms", QueueComponent::default())
        .await
        .unwrap();
    let delay = Arc::new(ReverseDelay::default());
    context
        .add_route(
            from("jms:foo?concurrentConsumers=5")
                .process(Arc::clone(&delay) as Arc<dyn Processor>)
                .transform(body().prepend("Hello ")),
        )
        .await
        .unwrap();
    let template = context.create_producer_template();

    assert_each_caller_gets_its_own_reply(&template, "jms:foo?replyTo=bar").await;

    assert_eq!(delay.finished.lock().clone(), vec!["E", "D", "C", "B", "A"]);
    assert_eq!(context.correlation().pending_count(), 0);
    assert_eq!(context.correlation().orphaned_replies(), 0);
    context.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_over_direct() {
    let context = started_context(
        test_config(),
        vec![from("direct:foo").transform(body().prepend("Hello "))],
    )
    .await;
    let template = context.create_producer_template();

    assert_each_caller_gets_its_own_reply(&template, "direct:foo").await;
    context.stop().await;
}

#[tokio::test]
async fn queue_request_reply_single() {
    let context = started_context(
        test_config(),
        vec![from("queue:foo").transform(body().prepend("Hello "))],
    )
    .await;
    let template = context.create_producer_template();

    let reply: String = template
        .request_body_as("queue:foo?replyTo=bar", "A")
        .await
        .unwrap();
    assert_eq!(reply, "Hello A");
    context.stop().await;
}

#[tokio::test]
async fn timeout_removes_entry_and_late_reply_is_orphaned() {
    let context = started_context(test_config(), Vec::new()).await;
    let template = context.create_producer_template();
    let broker = context
        .component_as::<QueueComponent>("queue")
        .unwrap()
        .broker()
        .clone();

    let started = Instant::now();
    let result = template
        .request_with_timeout(
            "queue:silent?replyTo=late",
            Exchange::in_out("anyone?"),
            Duration::from_millis(100),
        )
        .await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        result.exception(),
        Some(MediationError::CorrelationTimeout { timeout_ms: 100, .. })
    ));
    assert_eq!(context.correlation().pending_count(), 0);

    // Nobody consumed the request; answer it now, after the caller gave up.
    let request = broker.queue("silent").recv().await.unwrap();
    let correlation_id = request
        .headers()
        .get_str(names::CORRELATION_ID)
        .unwrap()
        .to_string();
    assert_eq!(request.headers().get_str(names::REPLY_TO), Some("late"));
    broker
        .send(
            "late",
            Message::new("too late").with_header(names::CORRELATION_ID, correlation_id),
        )
        .await
        .unwrap();

    let correlation = context.correlation().clone();
    assert!(eventually(Duration::from_secs(1), || correlation.orphaned_replies() == 1).await);
    assert_eq!(correlation.completed_replies(), 0);
    context.stop().await;
}

#[tokio::test]
async fn exclusive_reply_queue_round_trips_quickly() {
    let context = started_context(
        test_config(),
        vec![from("queue:svc").transform(body().prepend("Hello "))],
    )
    .await;
    let template = context.create_producer_template();

    let started = Instant::now();
    for letter in LETTERS {
        let reply: String = template
            .request_body_as("queue:svc?replyTo=svc.replies", letter)
            .await
            .unwrap();
        assert_eq!(reply, format!("Hello {letter}"));
    }
    assert!(started.elapsed() < Duration::from_millis(4_200));
    context.stop().await;
}

#[tokio::test]
async fn temporary_reply_queues_are_deleted() {
    let context = started_context(
        test_config(),
        vec![from("queue:svc").transform(body().prepend("Hello "))],
    )
    .await;
    let template = context.create_producer_template();
    let broker = context
        .component_as::<QueueComponent>("queue")
        .unwrap()
        .broker()
        .clone();

    for letter in LETTERS {
        let reply: String = template.request_body_as("queue:svc", letter).await.unwrap();
        assert_eq!(reply, format!("Hello {letter}"));
    }
    assert_eq!(broker.queue_names(), vec!["svc".to_string()]);
    context.stop().await;
}

#[tokio::test]
async fn cancellation_leaves_no_pending_entry() {
    let context = started_context(test_config(), Vec::new()).await;
    let template = context.create_producer_template();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = template
        .request_with_cancel("queue:void?replyTo=void.replies", "x", &cancel)
        .await;
    assert!(matches!(result, Err(MediationError::Cancelled { .. })));
    assert_eq!(context.correlation().pending_count(), 0);
    context.stop().await;
}

#[tokio::test]
async fn late_reply_to_deleted_temporary_queue_is_discarded() {
    let context = started_context(
        test_config(),
        vec![from("queue:slow")
            .delay(Duration::from_millis(200))
            .transform(body().prepend("Hello "))],
    )
    .await;
    let template = context.create_producer_template();
    let broker = context
        .component_as::<QueueComponent>("queue")
        .unwrap()
        .broker()
        .clone();

    let result = template
        .request_with_timeout("queue:slow", Exchange::in_out("A"), Duration::from_millis(50))
        .await;
    assert!(result.exception().is_some_and(MediationError::is_timeout));
    assert_eq!(broker.queue_names(), vec!["slow".to_string()]);

    // Let the route finish and attempt its reply.
    let watched = Arc::clone(&context);
    assert!(eventually(Duration::from_secs(1), || watched.in_flight_count() == 0).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(broker.queue_names(), vec!["slow".to_string()]);
    assert_eq!(broker.depth("slow"), 0);
    assert_eq!(context.correlation().pending_count(), 0);
    context.stop().await;
}

#[tokio::test]
async fn cancelled_temporary_request_deletes_reply_queue() {
    let context = started_context(test_config(), Vec::new()).await;
    let template = context.create_producer_template();
    let broker = context
        .component_as::<QueueComponent>("queue")
        .unwrap()
        .broker()
        .clone();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = template.request_with_cancel("queue:void", "x", &cancel).await;
    assert!(matches!(result, Err(MediationError::Cancelled { .. })));
    assert_eq!(context.correlation().pending_count(), 0);
    assert_eq!(broker.queue_names(), vec!["void".to_string()]);
    context.stop().await;
}

#[tokio::test]
async fn callback_receives_reply() {
    let context = started_context(
        test_config(),
        vec![from("queue:svc").transform(body().prepend("Hello "))],
    )
    .await;
    let template = context.create_producer_template();

    let (tx, rx) = tokio::sync::oneshot::channel();
    template
        .request_with_callback("queue:svc?replyTo=cb", "Z", move |exchange| {
            let _ = tx.send(exchange);
        })
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(!completed.is_failed());
    assert_eq!(completed.message().body_ref::<String>().unwrap(), "Hello Z");
    context.stop().await;
}

#[tokio::test]
async fn callback_receives_timeout() {
    let mut config = test_config();
    config.default_request_timeout_ms = 100;
    let context = started_context(config, Vec::new()).await;
    let template = context.create_producer_template();

    let (tx, rx) = tokio::sync::oneshot::channel();
    template
        .request_with_callback("queue:void?replyTo=cb", "Z", move |exchange| {
            let _ = tx.send(exchange);
        })
        .unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(completed
        .exception()
        .is_some_and(MediationError::is_timeout));
    assert_eq!(context.correlation().pending_count(), 0);
    context.stop().await;
}
