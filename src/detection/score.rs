/// Running anomaly score of one evaluation. Penalties and bonuses are kept
/// apart; the total is their sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoreAccumulator {
    positive: i32,
    negative: i32,
}

impl ScoreAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, delta: i32) {
        if delta >= 0 {
            self.positive = self.positive.saturating_add(delta);
        } else {
            self.negative = self.negative.saturating_add(delta);
        }
    }

    /// Add `delta`, letting it lower the score by at most `bound`.
    /// Returns the delta actually applied.
    pub fn add_bounded(&mut self, delta: i32, bound: i32) -> i32 {
        let applied = delta.max(-bound.max(0));
        self.add(applied);
        applied
    }

    /// Sum of applied penalties.
    pub fn positive(&self) -> i32 {
        self.positive
    }

    /// Sum of applied bonuses, zero or below.
    pub fn negative(&self) -> i32 {
        self.negative
    }

    pub fn total(&self) -> i32 {
        self.positive.saturating_add(self.negative)
    }

    pub fn reaches(&self, threshold: i32) -> bool {
        self.total() >= threshold
    }
}
