//! Append-only delivery journal.
//!
//! When tracing is enabled the scheduler records one entry per inbox
//! delivery. Two runs of the same scenario (with seeded agent ids) must
//! produce identical journals - the replay check the kernel's determinism
//! guarantee hangs on. The journal serialises with serde for export.

use crate::message::AgentId;
use serde::{Deserialize, Serialize};

/// One inbox delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Scheduler cycle during which the delivery happened.
    pub cycle: u64,

    /// Virtual time of the delivery.
    pub time: f64,

    /// Sending agent, `None` for system-originated messages.
    pub sender: Option<AgentId>,

    /// The inbox the message landed in.
    pub recipient: AgentId,

    /// Routing topic.
    pub topic: String,
}

/// The per-run delivery log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    records: Vec<DeliveryRecord>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, record: DeliveryRecord) {
        self.records.push(record);
    }

    /// All recorded deliveries, in delivery order.
    pub fn records(&self) -> &[DeliveryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_round_trips_through_serde() {
        let mut journal = Journal::new();
        journal.push(DeliveryRecord {
            cycle: 1,
            time: 0.5,
            sender: Some(AgentId::from_seed(1)),
            recipient: AgentId::from_seed(2),
            topic: "ping".into(),
        });

        let json = serde_json::to_string(&journal).unwrap();
        let back: Journal = serde_json::from_str(&json).unwrap();
        assert_eq!(journal, back);
        assert_eq!(back.len(), 1);
        assert!(!back.is_empty());
    }
}
