use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::bus::Acknowledger;
use crate::error::EtlResult;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack,
    Nack { requeue: bool },
}

/// Shared log of settlements, in settlement order.
#[derive(Debug, Clone, Default)]
pub struct AckLog {
    outcomes: Arc<Mutex<Vec<(u64, AckOutcome)>>>,
}

impl AckLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an acknowledger that records into this log under `tag`.
    pub fn acker(&self, tag: u64) -> Box<dyn Acknowledger> {
        Box::new(RecordingAcker {
            tag,
            log: self.clone(),
        })
    }

    pub fn outcomes(&self) -> Vec<(u64, AckOutcome)> {
        self.outcomes.lock().unwrap().clone()
    }

    pub fn count(&self, outcome: AckOutcome) -> usize {
        self.outcomes
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, recorded)| *recorded == outcome)
            .count()
    }

    fn record(&self, tag: u64, outcome: AckOutcome) {
        self.outcomes.lock().unwrap().push((tag, outcome));
    }
}

struct RecordingAcker {
    tag: u64,
    log: AckLog,
}

#[async_trait]
impl Acknowledger for RecordingAcker {
    async fn ack(&self) -> EtlResult<()> {
        self.log.record(self.tag, AckOutcome::Ack);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> EtlResult<()> {
        self.log.record(self.tag, AckOutcome::Nack { requeue });
        Ok(())
    }
}
