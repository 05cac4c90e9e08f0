use serde::{Deserialize, Serialize};

/// Snapshot of the dispatcher's view of the pool.
///
/// `pending` is indexed by worker id. Published after every dispatch and
/// completion, so it always matches the heap the dispatcher is working with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerStatus {
    pub workers: usize,
    pub pending: Vec<usize>,
    pub in_flight: usize,
    pub dispatched: u64,
    pub completed: u64,
}

impl BalancerStatus {
    pub fn new(pending: Vec<usize>, dispatched: u64, completed: u64) -> Self {
        Self {
            workers: pending.len(),
            in_flight: pending.iter().sum(),
            pending,
            dispatched,
            completed,
        }
    }

    pub fn max_pending(&self) -> usize {
        self.pending.iter().copied().max().unwrap_or(0)
    }

    /// Difference between the most and least loaded worker.
    pub fn spread(&self) -> usize {
        let min = self.pending.iter().copied().min().unwrap_or(0);
        self.max_pending() - min
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_derives_totals() {
        let status = BalancerStatus::new(vec![2, 0, 3], 9, 4);
        assert_eq!(status.workers, 3);
        assert_eq!(status.in_flight, 5);
        assert_eq!(status.max_pending(), 3);
        assert_eq!(status.spread(), 3);
        assert!(!status.is_idle());
    }

    #[test]
    fn serializes_for_reporting() {
        let status = BalancerStatus::new(vec![1, 1], 2, 0);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["pending"], serde_json::json!([1, 1]));
        assert_eq!(json["in_flight"], 2);
    }
}
