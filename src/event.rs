//!
//! Current-level event sequences.
//!
//! One event summarizes a segment of raw signal as (mean, stdv, start,
//! length), produced by upstream event detection. The basecaller only ever
//! reads them and applies per-read drift correction.
//!

///
/// One signal segment.
///
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    /// mean current level (pA)
    pub mean: f64,
    /// level standard deviation within the segment (pA)
    pub stdv: f64,
    /// segment start time (s)
    pub start: f64,
    /// segment duration (s)
    pub length: f64,
}

///
/// An ordered run of events for one strand.
///
/// `apply_drift_correction` tracks the cumulative drift already applied, so
/// re-applying the same drift is a no-op and callers that need a pristine
/// copy clone before correcting.
///
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSequence {
    events: Vec<Event>,
    drift_applied: f64,
}

impl EventSequence {
    pub fn new(events: Vec<Event>) -> EventSequence {
        EventSequence {
            events,
            drift_applied: 0.0,
        }
    }
    pub fn len(&self) -> usize {
        self.events.len()
    }
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }
    pub fn as_slice(&self) -> &[Event] {
        &self.events
    }
    ///
    /// Correct event means to a total applied drift of `drift`:
    /// `mean -= (drift - already_applied) * start`.
    ///
    pub fn apply_drift_correction(&mut self, drift: f64) {
        let delta = drift - self.drift_applied;
        if delta != 0.0 {
            for ev in self.events.iter_mut() {
                ev.mean -= delta * ev.start;
            }
        }
        self.drift_applied = drift;
    }
    ///
    /// Mean and standard deviation of the event means.
    ///
    pub fn mean_stdv(&self) -> (f64, f64) {
        if self.events.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.events.len() as f64;
        let mean = self.events.iter().map(|ev| ev.mean).sum::<f64>() / n;
        let var = self
            .events
            .iter()
            .map(|ev| (ev.mean - mean) * (ev.mean - mean))
            .sum::<f64>()
            / n;
        (mean, var.sqrt())
    }
    ///
    /// The first `n` events as a fresh sequence. Used to build the scaling
    /// training slices; the tracked drift baseline carries over.
    ///
    pub fn prefix(&self, n: usize) -> EventSequence {
        EventSequence {
            events: self.events[..n.min(self.events.len())].to_vec(),
            drift_applied: self.drift_applied,
        }
    }
    ///
    /// The last `n` events as a fresh sequence.
    ///
    pub fn suffix(&self, n: usize) -> EventSequence {
        let n = n.min(self.events.len());
        EventSequence {
            events: self.events[self.events.len() - n..].to_vec(),
            drift_applied: self.drift_applied,
        }
    }
}

impl std::ops::Index<usize> for EventSequence {
    type Output = Event;
    fn index(&self, i: usize) -> &Event {
        &self.events[i]
    }
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn seq() -> EventSequence {
        EventSequence::new(vec![
            Event {
                mean: 60.0,
                stdv: 1.0,
                start: 0.0,
                length: 0.01,
            },
            Event {
                mean: 62.0,
                stdv: 1.1,
                start: 1.0,
                length: 0.01,
            },
            Event {
                mean: 64.0,
                stdv: 0.9,
                start: 2.0,
                length: 0.01,
            },
        ])
    }

    #[test]
    fn zero_drift_is_identity() {
        let mut s = seq();
        let before = s.clone();
        s.apply_drift_correction(0.0);
        assert_eq!(s, before);
    }

    #[test]
    fn drift_correction_tracks_baseline() {
        let mut s = seq();
        s.apply_drift_correction(0.5);
        assert_abs_diff_eq!(s[0].mean, 60.0);
        assert_abs_diff_eq!(s[1].mean, 61.5);
        assert_abs_diff_eq!(s[2].mean, 63.0);
        // same drift again: no further change
        s.apply_drift_correction(0.5);
        assert_abs_diff_eq!(s[1].mean, 61.5);
        // back to zero restores the input
        s.apply_drift_correction(0.0);
        assert_abs_diff_eq!(s[1].mean, 62.0);
        assert_abs_diff_eq!(s[2].mean, 64.0);
    }

    #[test]
    fn mean_stdv_of_means() {
        let (mean, stdv) = seq().mean_stdv();
        assert_abs_diff_eq!(mean, 62.0);
        assert_abs_diff_eq!(stdv, (8.0f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn prefix_suffix_clip() {
        let s = seq();
        assert_eq!(s.prefix(2).len(), 2);
        assert_eq!(s.suffix(2).len(), 2);
        assert_abs_diff_eq!(s.suffix(2)[0].mean, 62.0);
        assert_eq!(s.prefix(10).len(), 3);
        assert_eq!(s.suffix(10).len(), 3);
    }
}
