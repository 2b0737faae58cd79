use std::time::Duration;

use metrics::gauge;
use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::metrics::{DATA_TYPE_LABEL, DISCOGS_CONSUMER_STATE};
use crate::types::DataType;

/// Lifecycle of the consumer of one data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Consuming normally.
    Active,
    /// `file_complete` was received, the consumer waits for late messages until the grace
    /// period elapses.
    CompletionPending,
    /// The subscription is torn down.
    Cancelled,
}

impl ConsumerState {
    fn as_gauge(&self) -> f64 {
        match self {
            ConsumerState::Active => 0.0,
            ConsumerState::CompletionPending => 1.0,
            ConsumerState::Cancelled => 2.0,
        }
    }
}

/// Controller deciding when the consumer of a data type may be cancelled.
///
/// `Active -> CompletionPending` on `file_complete`, `CompletionPending -> Cancelled` when the
/// grace period elapses without messages. A message arriving while pending moves the consumer
/// back to `Active`; once it was accepted the grace period starts over, since completion was
/// already announced.
#[derive(Debug)]
pub struct ConsumerLifecycle {
    data_type: DataType,
    grace: Duration,
    state: ConsumerState,
    completion_seen: bool,
    grace_deadline: Option<Instant>,
}

impl ConsumerLifecycle {
    pub fn new(data_type: DataType, grace: Duration) -> Self {
        let lifecycle = Self {
            data_type,
            grace,
            state: ConsumerState::Active,
            completion_seen: false,
            grace_deadline: None,
        };
        lifecycle.publish_state();

        lifecycle
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ConsumerState::Cancelled
    }

    /// Deadline of the grace period, while completion is pending.
    pub fn grace_deadline(&self) -> Option<Instant> {
        match self.state {
            ConsumerState::CompletionPending => self.grace_deadline,
            _ => None,
        }
    }

    /// Records a `file_complete` message. Restarts the grace period if already pending.
    pub fn on_file_complete(&mut self, total_processed: Option<u64>) {
        if self.is_cancelled() {
            return;
        }

        self.completion_seen = true;
        info!(
            data_type = %self.data_type,
            total_processed,
            grace_secs = self.grace.as_secs(),
            "file complete received, waiting for late messages"
        );
        self.enter_completion_pending();
    }

    /// Records the arrival of a data message.
    pub fn on_message(&mut self) {
        if self.state == ConsumerState::CompletionPending {
            info!(data_type = %self.data_type, "message received after file complete, consumer stays active");
            self.transition(ConsumerState::Active);
            self.grace_deadline = None;
        }
    }

    /// Records that the last received message was accepted.
    ///
    /// Re-enters `CompletionPending` with a fresh grace period if completion was announced.
    pub fn on_message_accepted(&mut self) {
        if self.state == ConsumerState::Active && self.completion_seen {
            self.enter_completion_pending();
        }
    }

    /// Returns `true` if the grace period elapsed at `now` and the consumer may be cancelled.
    pub fn grace_elapsed(&self, now: Instant) -> bool {
        self.grace_deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn cancel(&mut self) {
        if !self.is_cancelled() {
            self.transition(ConsumerState::Cancelled);
            self.grace_deadline = None;
        }
    }

    fn enter_completion_pending(&mut self) {
        self.grace_deadline = Some(Instant::now() + self.grace);
        self.transition(ConsumerState::CompletionPending);
    }

    fn transition(&mut self, state: ConsumerState) {
        self.state = state;
        self.publish_state();
    }

    fn publish_state(&self) {
        gauge!(DISCOGS_CONSUMER_STATE, DATA_TYPE_LABEL => self.data_type.as_str())
            .set(self.state.as_gauge());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn test_file_complete_starts_grace_period() {
        let mut lifecycle = ConsumerLifecycle::new(DataType::Artists, GRACE);
        assert_eq!(lifecycle.grace_deadline(), None);

        lifecycle.on_file_complete(Some(3));
        assert_eq!(lifecycle.state(), ConsumerState::CompletionPending);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(!lifecycle.grace_elapsed(Instant::now()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(lifecycle.grace_elapsed(Instant::now()));

        lifecycle.cancel();
        assert!(lifecycle.is_cancelled());
        assert_eq!(lifecycle.grace_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_message_resets_grace_period() {
        let mut lifecycle = ConsumerLifecycle::new(DataType::Artists, GRACE);
        lifecycle.on_file_complete(Some(3));

        tokio::time::advance(Duration::from_secs(200)).await;
        lifecycle.on_message();
        assert_eq!(lifecycle.state(), ConsumerState::Active);
        assert_eq!(lifecycle.grace_deadline(), None);

        lifecycle.on_message_accepted();
        assert_eq!(lifecycle.state(), ConsumerState::CompletionPending);

        // 300s after the first completion the consumer is still within the renewed period.
        tokio::time::advance(Duration::from_secs(100)).await;
        assert!(!lifecycle.grace_elapsed(Instant::now()));
        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(lifecycle.grace_elapsed(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_before_completion_keep_consumer_active() {
        let mut lifecycle = ConsumerLifecycle::new(DataType::Labels, GRACE);
        lifecycle.on_message();
        lifecycle.on_message_accepted();

        assert_eq!(lifecycle.state(), ConsumerState::Active);
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(!lifecycle.grace_elapsed(Instant::now()));
    }

    #[test]
    fn test_cancelled_consumer_ignores_completion() {
        let mut lifecycle = ConsumerLifecycle::new(DataType::Masters, GRACE);
        lifecycle.cancel();
        lifecycle.on_file_complete(Some(1));

        assert!(lifecycle.is_cancelled());
    }
}
