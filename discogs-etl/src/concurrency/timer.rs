//! Timer that stays pending until armed.
//!
//! Used as an optional branch of `tokio::select!` loops: batch flush deadlines and
//! completion grace periods are armed on demand and disarmed once handled.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep_until};

/// Resolves once its deadline passes. Pending forever while disarmed.
///
/// The timer is `Unpin` and can be polled by reference inside `select!`. After it fires
/// it is disarmed again, so a loop never observes the same deadline twice.
#[derive(Debug, Default)]
pub struct DeferredTimer {
    deadline: Option<Pin<Box<Sleep>>>,
}

impl DeferredTimer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Arms the timer to fire after `duration`, replacing any previous deadline.
    pub fn start(&mut self, duration: Duration) {
        self.start_at(Instant::now() + duration);
    }

    /// Arms the timer to fire at `deadline`, replacing any previous deadline.
    pub fn start_at(&mut self, deadline: Instant) {
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.deadline = Some(Box::pin(sleep_until(deadline))),
        }
    }

    /// Arms or disarms the timer to match `deadline`.
    pub fn set(&mut self, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => self.start_at(deadline),
            None => self.stop(),
        }
    }

    pub fn stop(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.as_ref().map(|sleep| sleep.deadline())
    }
}

impl Future for DeferredTimer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let Some(deadline) = this.deadline.as_mut() else {
            return Poll::Pending;
        };

        ready!(deadline.as_mut().poll(cx));
        this.deadline = None;

        Poll::Ready(())
    }
}
