use crate::plan::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Counts consecutive failures of one collaborator. Opens at `threshold`,
/// lets a single probe through once `reset_ms` has passed since opening.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
    pub reset_ms: u64,
    opened_at: Timestamp,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_ms: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold: threshold.max(1),
            reset_ms,
            opened_at: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    /// Returns true when this failure tripped a closed circuit. A failed
    /// half-open attempt re-opens it without reporting a new trip.
    pub fn record_failure(&mut self, now: Timestamp) -> bool {
        self.failures += 1;
        let was_closed = self.state == CircuitState::Closed;
        if self.failures >= self.threshold || self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Open;
            self.opened_at = now;
        }
        was_closed && self.state == CircuitState::Open
    }

    pub fn allow(&mut self, now: Timestamp) -> bool {
        if self.state == CircuitState::Open && now.saturating_sub(self.opened_at) >= self.reset_ms {
            self.state = CircuitState::HalfOpen;
        }
        matches!(self.state, CircuitState::Closed | CircuitState::HalfOpen)
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_opens_on_threshold() {
        let mut cb = CircuitBreaker::new(3, 1_000);
        assert!(cb.allow(0));
        assert!(!cb.record_failure(1));
        assert!(!cb.record_failure(2));
        assert!(cb.allow(2));
        assert!(cb.record_failure(3));
        assert!(!cb.allow(4));
        assert!(matches!(cb.state, CircuitState::Open));
    }

    #[test]
    fn test_circuit_resets_on_success() {
        let mut cb = CircuitBreaker::new(2, 1_000);
        cb.record_failure(0);
        cb.record_failure(0);
        assert!(!cb.allow(10));
        cb.record_success();
        assert!(cb.allow(10));
        assert!(matches!(cb.state, CircuitState::Closed));
    }

    #[test]
    fn test_half_open_retry() {
        let mut cb = CircuitBreaker::new(1, 500);
        assert!(cb.record_failure(100));
        assert!(!cb.allow(400));
        assert!(cb.allow(600));
        assert_eq!(cb.state, CircuitState::HalfOpen);
        // a failed half-open attempt re-opens without a new trip
        assert!(!cb.record_failure(601));
        assert!(!cb.allow(700));
        assert!(cb.allow(1_200));
        assert!(!cb.record_failure(1_201));
        assert!(cb.is_open());

        // closed again, so the next failure is a fresh trip
        cb.record_success();
        assert!(cb.record_failure(2_000));
    }

    #[test]
    fn test_only_closed_to_open_reports_a_trip() {
        let mut cb = CircuitBreaker::new(2, 100);
        assert!(!cb.record_failure(0));
        assert!(cb.record_failure(1));
        // still open: further failures are not trips
        assert!(!cb.record_failure(2));
        assert!(cb.allow(200));
        assert!(!cb.record_failure(201));
        assert!(cb.allow(400));
        cb.record_success();
        assert!(!cb.record_failure(500));
        assert!(cb.record_failure(501));
    }
}
