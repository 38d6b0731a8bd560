/// What to do with a decoded block given the ingestion window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeDecision {
    /// Below the start block
    Skip,
    Forward,
    /// The stop block itself: forward it, then end ingestion
    ForwardAndStop,
    /// Past the stop block
    Stop,
}

/// Inclusive `[start, stop]` block window. A bound of 0 is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchRange {
    pub start: u64,
    pub stop: u64,
}

impl BatchRange {
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    pub fn check(&self, number: u64) -> RangeDecision {
        if number < self.start {
            RangeDecision::Skip
        } else if self.stop > 0 && number > self.stop {
            RangeDecision::Stop
        } else if self.stop > 0 && number == self.stop {
            RangeDecision::ForwardAndStop
        } else {
            RangeDecision::Forward
        }
    }
}
