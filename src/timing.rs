//! Randomized timing policy shared by both engines.
//!
//! Fixed intervals are trivially fingerprintable, so every delay used by
//! the collector and the reciprocator is drawn from here. No fixed seed:
//! samples come from the thread-local generator.

use rand::Rng;
use std::time::Duration;

/// Uniform draw over `[min, max]`. Degenerate ranges (`min >= max`)
/// return `min` deterministically.
pub fn sample_range(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Center-weighted draw over `[min, max]`: the mean of two independent
/// uniform draws, so typical values dominate over extremes. Used where a
/// "usual" wait should be common (inter-batch delays, rest durations).
pub fn sample_centered(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let mut rng = rand::thread_rng();
    let a = rng.gen_range(min.as_millis()..=max.as_millis());
    let b = rng.gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(((a + b) / 2) as u64)
}

/// Convenience for second-valued settings fields.
pub fn sample_secs(min_secs: u64, max_secs: u64) -> Duration {
    sample_range(Duration::from_secs(min_secs), Duration::from_secs(max_secs))
}

/// One scheduled scroll action during home-timeline browsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollGesture {
    /// Small forward scroll, the common case. Pixels.
    Forward(u32),
    /// Large "skim" jump past content. Pixels.
    Skim(u32),
    /// Small backward correction. Pixels.
    Backward(u32),
    /// Long reading pause; scrolling is suspended entirely.
    Dwell(Duration),
}

impl ScrollGesture {
    /// Signed pixel delta for the scroll script; `None` for a dwell.
    pub fn delta(&self) -> Option<i32> {
        match self {
            ScrollGesture::Forward(px) | ScrollGesture::Skim(px) => Some(*px as i32),
            ScrollGesture::Backward(px) => Some(-(*px as i32)),
            ScrollGesture::Dwell(_) => None,
        }
    }
}

const DWELL_MIN: Duration = Duration::from_secs(10);
const DWELL_MAX: Duration = Duration::from_secs(30);

/// Weighted gesture draw: mostly small forward scrolls, occasionally a
/// long skim, a backward correction, or a rare dwell pause.
pub fn sample_scroll_gesture() -> ScrollGesture {
    let mut rng = rand::thread_rng();
    let roll: f64 = rng.gen();
    if roll < 0.70 {
        ScrollGesture::Forward(rng.gen_range(250..=700))
    } else if roll < 0.85 {
        ScrollGesture::Skim(rng.gen_range(1200..=2500))
    } else if roll < 0.95 {
        ScrollGesture::Backward(rng.gen_range(120..=400))
    } else {
        ScrollGesture::Dwell(sample_range(DWELL_MIN, DWELL_MAX))
    }
}

/// Bernoulli draw used to couple scans to scrolls without firing on
/// every scroll.
pub fn roll_probability(p: f64) -> bool {
    rand::thread_rng().gen_bool(p.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_range_stays_in_bounds() {
        let min = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        for _ in 0..200 {
            let v = sample_range(min, max);
            assert!(v >= min && v <= max, "{v:?} out of bounds");
        }
    }

    #[test]
    fn degenerate_range_returns_min() {
        let five = Duration::from_secs(5);
        for _ in 0..20 {
            assert_eq!(sample_range(five, five), five);
            assert_eq!(sample_range(five, Duration::from_secs(3)), five);
            assert_eq!(sample_centered(five, five), five);
        }
    }

    #[test]
    fn sample_centered_stays_in_bounds() {
        let min = Duration::from_millis(50);
        let max = Duration::from_millis(150);
        for _ in 0..200 {
            let v = sample_centered(min, max);
            assert!(v >= min && v <= max, "{v:?} out of bounds");
        }
    }

    #[test]
    fn gesture_magnitudes_and_deltas() {
        let mut saw_forward = false;
        let mut saw_other = false;
        for _ in 0..500 {
            match sample_scroll_gesture() {
                ScrollGesture::Forward(px) => {
                    assert!((250..=700).contains(&px));
                    saw_forward = true;
                }
                ScrollGesture::Skim(px) => {
                    assert!((1200..=2500).contains(&px));
                    saw_other = true;
                }
                ScrollGesture::Backward(px) => {
                    assert!((120..=400).contains(&px));
                    assert!(ScrollGesture::Backward(px).delta().unwrap() < 0);
                    saw_other = true;
                }
                ScrollGesture::Dwell(pause) => {
                    assert!(pause >= Duration::from_secs(10) && pause <= Duration::from_secs(30));
                    assert!(ScrollGesture::Dwell(pause).delta().is_none());
                    saw_other = true;
                }
            }
        }
        // 500 draws make both branches overwhelmingly likely.
        assert!(saw_forward && saw_other);
    }

    #[test]
    fn roll_probability_extremes() {
        assert!(!roll_probability(0.0));
        assert!(roll_probability(1.0));
    }
}
