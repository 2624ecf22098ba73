/// Exponential approach of `p_unknown` toward 1 while a track goes unseen.
///
/// `p' = 1 - (1 - p) * (1 - g)^k` for `k` unobserved ticks. A pure function
/// of the prior value and the elapsed steps, non-decreasing in `k`.
#[derive(Clone, Copy, Debug)]
pub struct UncertaintyModel {
    growth: f64,
    eviction_threshold: f64,
}

impl UncertaintyModel {
    pub fn new(growth: f64, eviction_threshold: f64) -> Self {
        Self {
            growth,
            eviction_threshold,
        }
    }

    /// Value after reobservation.
    #[inline]
    pub fn reset(&self) -> f64 {
        0.0
    }

    /// Advance `p` by `steps` unobserved ticks.
    pub fn advance(&self, p: f64, steps: u64) -> f64 {
        if steps == 0 {
            return p;
        }
        let survival = (1.0 - self.growth).powi(steps.min(i32::MAX as u64) as i32);
        let next = 1.0 - (1.0 - p) * survival;
        // Rounding must never pull the value below where it started.
        next.clamp(p, 1.0)
    }

    /// Whether a track at `p` has crossed the removal threshold.
    #[inline]
    pub fn expired(&self, p: f64) -> bool {
        p >= self.eviction_threshold
    }

    /// Closed form from zero, handy for fixtures.
    pub fn after_silence(&self, steps: u64) -> f64 {
        self.advance(self.reset(), steps)
    }
}
