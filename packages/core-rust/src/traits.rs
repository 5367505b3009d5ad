use async_trait::async_trait;

use crate::exchange::Exchange;

/// One stage of a route pipeline.
///
/// A processor receives the exchange by value and hands it back when done;
/// the returned exchange is the continuation. Synchronous processors return
/// immediately, asynchronous ones suspend at an `.await` (a reply, a timer)
/// without occupying a worker thread.
///
/// Failures are recorded with [`Exchange::set_exception`], which makes the
/// pipeline skip every remaining normal step.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Process one exchange.
    async fn process(&self, exchange: Exchange) -> Exchange;

    /// Short label used in logs and in `ProcessorFailure` errors.
    fn name(&self) -> &str {
        "processor"
    }
}
