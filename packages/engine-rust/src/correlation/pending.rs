use std::sync::Arc;
use std::time::Duration;

use mediator_core::{MediationError, Message};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::table::{timeout_error, PendingTable, ReplyOutcome};

/// Handle to one registered InOut request.
///
/// The entry is in the table as soon as this handle exists, so the request
/// may be transmitted right after. Dropping the handle removes the entry;
/// a reply arriving afterwards is an orphan.
#[must_use = "dropping a PendingReply cancels the request"]
pub struct PendingReply {
    correlation_id: String,
    timeout: Duration,
    rx: Option<oneshot::Receiver<ReplyOutcome>>,
    table: Arc<PendingTable>,
}

impl PendingReply {
    pub(crate) fn new(
        correlation_id: String,
        timeout: Duration,
        rx: oneshot::Receiver<ReplyOutcome>,
        table: Arc<PendingTable>,
    ) -> Self {
        Self {
            correlation_id,
            timeout,
            rx: Some(rx),
            table,
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for the reply until the registered timeout.
    ///
    /// # Errors
    ///
    /// `CorrelationTimeout` if no reply arrived in time, `Cancelled` if the
    /// engine shut down first.
    pub async fn wait(self) -> Result<Message, MediationError> {
        self.wait_or_cancel(&CancellationToken::new()).await
    }

    /// Like [`wait`](Self::wait) but also gives up when `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait), plus `Cancelled` on cancellation.
    pub async fn wait_or_cancel(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<Message, MediationError> {
        let Some(mut rx) = self.rx.take() else {
            return Err(self.cancelled());
        };

        tokio::select! {
            outcome = &mut rx => {
                return outcome.unwrap_or_else(|_| Err(self.cancelled()));
            }
            () = tokio::time::sleep(self.timeout) => {
                if self.table.discard(&self.correlation_id) {
                    self.table.record_timeout();
                    tracing::debug!(
                        correlation_id = %self.correlation_id,
                        timeout = ?self.timeout,
                        "request timed out"
                    );
                    return Err(timeout_error(&self.correlation_id, self.timeout));
                }
            }
            () = cancel.cancelled() => {
                if self.table.discard(&self.correlation_id) {
                    tracing::debug!(correlation_id = %self.correlation_id, "request cancelled");
                    return Err(self.cancelled());
                }
            }
        }

        // Someone else removed the entry first and is completing it right now.
        rx.await.unwrap_or_else(|_| Err(self.cancelled()))
    }

    fn cancelled(&self) -> MediationError {
        MediationError::Cancelled {
            correlation_id: self.correlation_id.clone(),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.discard(&self.correlation_id);
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
