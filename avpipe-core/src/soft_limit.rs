//! Soft limit - exponential moving average admission threshold.
//!
//! Each decode stage feeds its outstanding-frame backlog through one of
//! these. A single burst barely moves the average; sustained backlog pushes
//! it over the limit and frames start being discarded.

/// Default smoothing factor
pub const DEFAULT_ALPHA: f64 = 0.01;

/// Default limit for video stages (frames)
pub const VIDEO_SOFT_LIMIT: f64 = 8.0;

/// Default limit for audio stages (frames)
pub const AUDIO_SOFT_LIMIT: f64 = 32.0;

/// EMA threshold tracker
#[derive(Debug, Clone)]
pub struct SoftLimit {
    alpha: f64,
    limit: f64,
    average: f64,
}

impl SoftLimit {
    pub fn new(limit: f64) -> Self {
        Self::with_alpha(limit, DEFAULT_ALPHA)
    }

    /// `alpha` is clamped into (0, 1]
    pub fn with_alpha(limit: f64, alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            DEFAULT_ALPHA
        };
        Self {
            alpha,
            limit,
            average: 0.0,
        }
    }

    /// Fold `value` into the average and report whether it stays under the limit
    pub fn add_value(&mut self, value: f64) -> bool {
        self.average = self.alpha * value + (1.0 - self.alpha) * self.average;
        self.average < self.limit
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Takes effect on the next `add_value`
    pub fn set_limit(&mut self, limit: f64) {
        self.limit = limit;
    }

    pub fn average(&self) -> f64 {
        self.average
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpha_one_tracks_last_value() {
        let mut limit = SoftLimit::with_alpha(5.0, 1.0);
        assert!(limit.add_value(3.0));
        assert_eq!(limit.average(), 3.0);
        assert!(!limit.add_value(9.0));
        assert_eq!(limit.average(), 9.0);
        assert!(limit.add_value(4.0));
        assert_eq!(limit.average(), 4.0);
    }

    #[test]
    fn test_constant_input_crosses_limit() {
        let mut limit = SoftLimit::with_alpha(8.0, 0.5);
        // 5.0, 7.5, 8.75
        assert!(limit.add_value(10.0));
        assert!(limit.add_value(10.0));
        assert!(!limit.add_value(10.0));
        assert!(!limit.add_value(10.0));
    }

    #[test]
    fn test_default_alpha_absorbs_bursts() {
        let mut limit = SoftLimit::new(VIDEO_SOFT_LIMIT);
        assert_eq!(limit.alpha(), DEFAULT_ALPHA);
        for _ in 0..10 {
            assert!(limit.add_value(50.0));
        }
        assert!(limit.average() < VIDEO_SOFT_LIMIT);
    }

    #[test]
    fn test_set_limit_applies_to_next_value() {
        let mut limit = SoftLimit::with_alpha(10.0, 1.0);
        assert!(limit.add_value(6.0));
        limit.set_limit(5.0);
        assert_eq!(limit.limit(), 5.0);
        assert!(!limit.add_value(6.0));
    }

    #[test]
    fn test_invalid_alpha_falls_back() {
        assert_eq!(SoftLimit::with_alpha(1.0, 0.0).alpha(), DEFAULT_ALPHA);
        assert_eq!(SoftLimit::with_alpha(1.0, f64::NAN).alpha(), DEFAULT_ALPHA);
        assert_eq!(SoftLimit::with_alpha(1.0, 4.0).alpha(), 1.0);
    }
}
