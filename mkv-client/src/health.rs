//! # Decaying Error Rate
//!
//! Purpose: Track recent transient failures per node with an exponentially
//! decaying score so selection drifts back to a node once it recovers.
//!
//! ## Design Principles
//! 1. **Observation-Driven Decay**: Decay compounds only between reads and
//!    increments; nothing runs in the background.
//! 2. **Wall-Clock Pure**: The score is a function of elapsed time and
//!    recorded failures, no I/O.
//! 3. **Lock Per Counter**: Each node owns an independent mutex, so scoring
//!    one node never contends with another.

use std::sync::Mutex;
use std::time::Instant;

/// Default decay rate: a half-life of ten seconds.
const DEFAULT_RATE: f64 = -0.069_314_718_055_994_53; // ln(0.5) / 10

struct Observation {
    score: f64,
    base: Instant,
}

/// Exponentially decaying failure score.
///
/// The stored score decays as `score * e^(rate * dt)` where `dt` is the time
/// since the last observation. Every read or increment re-anchors the
/// observation time.
pub struct DecayingErrorRate {
    rate: f64,
    state: Mutex<Observation>,
}

impl Default for DecayingErrorRate {
    fn default() -> Self {
        Self::with_rate(DEFAULT_RATE)
    }
}

impl DecayingErrorRate {
    /// Creates a counter with an explicit decay rate (per second, negative).
    pub fn with_rate(rate: f64) -> Self {
        DecayingErrorRate {
            rate,
            state: Mutex::new(Observation { score: 0.0, base: Instant::now() }),
        }
    }

    /// Returns the current decayed score and re-anchors the observation time.
    pub fn value(&self) -> f64 {
        self.value_at(Instant::now())
    }

    /// Records `amount` failures on top of the current decayed score.
    pub fn incr(&self, amount: f64) {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let decayed = decay(state.score, self.rate, now, state.base);
        state.score = decayed + amount;
        state.base = now;
    }

    fn value_at(&self, now: Instant) -> f64 {
        let mut state = lock(&self.state);
        state.score = decay(state.score, self.rate, now, state.base);
        state.base = now;
        state.score
    }
}

fn decay(score: f64, rate: f64, now: Instant, base: Instant) -> f64 {
    let dt = now.saturating_duration_since(base).as_secs_f64();
    score * std::f64::consts::E.powf(rate * dt)
}

fn lock(state: &Mutex<Observation>) -> std::sync::MutexGuard<'_, Observation> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fresh_counter_reads_zero() {
        let rate = DecayingErrorRate::default();
        assert_eq!(rate.value(), 0.0);
    }

    #[test]
    fn test_incr_then_immediate_read_is_whole() {
        let rate = DecayingErrorRate::default();
        rate.incr(1.0);
        let value = rate.value();
        assert!((value - 1.0).abs() < 1e-3, "got {value}");
    }

    #[test]
    fn test_one_half_life_halves_the_score() {
        let rate = DecayingErrorRate::default();
        rate.incr(1.0);
        let anchor = { lock(&rate.state).base };
        let value = rate.value_at(anchor + Duration::from_secs(10));
        assert!((value - 0.5).abs() < 1e-6, "got {value}");
    }

    #[test]
    fn test_decay_compounds_between_observations() {
        let rate = DecayingErrorRate::default();
        rate.incr(4.0);
        let anchor = { lock(&rate.state).base };
        let half = rate.value_at(anchor + Duration::from_secs(10));
        assert!((half - 2.0).abs() < 1e-6, "got {half}");
        // second read decays from the re-anchored observation, not t0
        let quarter = rate.value_at(anchor + Duration::from_secs(20));
        assert!((quarter - 1.0).abs() < 1e-6, "got {quarter}");
    }

    #[test]
    fn test_incr_adds_to_decayed_value() {
        let rate = DecayingErrorRate::default();
        rate.incr(1.0);
        rate.incr(1.0);
        let value = rate.value();
        assert!(value > 1.9 && value <= 2.0, "got {value}");
    }

    #[test]
    fn test_concurrent_incr_is_lossless() {
        let rate = Arc::new(DecayingErrorRate::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rate = Arc::clone(&rate);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    rate.incr(1.0);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        // allow for decay during the run; increments must not be lost
        let value = rate.value();
        assert!(value > 700.0 && value <= 800.0, "got {value}");
    }
}
