//! Median window filter.
//!
//! Each measurement channel keeps a ring of the most recent raw samples;
//! the reported value is the median of the last `min(N, 20)` of them.
//! The median rejects transient outliers (contact bounce on the probe,
//! bus glitches) with a shorter effective lag than a boxcar average.

/// Hard upper bound on the window. Configured counts above this, or
/// below 1, degrade to a window of 1 (pass-through).
pub const MAX_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct MedianWindow {
    samples: [f32; MAX_WINDOW],
    count: usize,
    next: usize,
}

impl Default for MedianWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl MedianWindow {
    pub fn new() -> Self {
        Self {
            samples: [0.0; MAX_WINDOW],
            count: 0,
            next: 0,
        }
    }

    /// Push a raw sample and return the filtered value: the median of the
    /// most recent `min(window, samples so far)` samples.
    ///
    /// The ring always retains [`MAX_WINDOW`] samples, so shrinking or
    /// growing the configured window between pushes behaves as if the new
    /// length had always been in effect.
    pub fn push(&mut self, raw: f32, window: i32) -> f32 {
        self.samples[self.next] = raw;
        self.next = (self.next + 1) % MAX_WINDOW;
        self.count = (self.count + 1).min(MAX_WINDOW);

        let k = effective_window(window).min(self.count);
        let mut recent = [0.0f32; MAX_WINDOW];
        for (i, slot) in recent[..k].iter_mut().enumerate() {
            // Walk backwards from the newest sample.
            let idx = (self.next + MAX_WINDOW - 1 - i) % MAX_WINDOW;
            *slot = self.samples[idx];
        }
        median(&mut recent[..k])
    }

    /// Drop all history (used after a sensor reconnect).
    pub fn reset(&mut self) {
        self.count = 0;
        self.next = 0;
    }
}

fn effective_window(window: i32) -> usize {
    if (1..=MAX_WINDOW as i32).contains(&window) {
        window as usize
    } else {
        1
    }
}

/// Median of a non-empty slice; sorts in place.
fn median(xs: &mut [f32]) -> f32 {
    debug_assert!(!xs.is_empty());
    xs.sort_by(|a, b| a.partial_cmp(b).expect("no NaN samples in filter"));
    let mid = xs.len() / 2;
    if xs.len() % 2 == 0 {
        (xs[mid - 1] + xs[mid]) / 2.0
    } else {
        xs[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sample_passes_through() {
        let mut w = MedianWindow::new();
        assert_eq!(w.push(4.2, 5), 4.2);
    }

    #[test]
    fn median_rejects_outlier() {
        let mut w = MedianWindow::new();
        w.push(10.0, 5);
        w.push(10.1, 5);
        w.push(99.0, 5); // glitch
        w.push(10.2, 5);
        let out = w.push(10.0, 5);
        assert!((out - 10.1).abs() < 1e-6, "outlier leaked: {out}");
    }

    #[test]
    fn even_window_averages_middle_pair() {
        let mut w = MedianWindow::new();
        w.push(1.0, 4);
        w.push(2.0, 4);
        w.push(3.0, 4);
        let out = w.push(4.0, 4);
        assert_eq!(out, 2.5);
    }

    #[test]
    fn out_of_range_window_degrades_to_passthrough() {
        let mut w = MedianWindow::new();
        w.push(1.0, 25);
        w.push(2.0, 25);
        assert_eq!(w.push(9.0, 25), 9.0);

        let mut w = MedianWindow::new();
        w.push(1.0, 0);
        assert_eq!(w.push(7.0, 0), 7.0);
        assert_eq!(w.push(3.0, -1), 3.0);
    }

    #[test]
    fn window_uses_only_most_recent_samples() {
        let mut w = MedianWindow::new();
        for _ in 0..10 {
            w.push(100.0, 3);
        }
        w.push(1.0, 3);
        w.push(2.0, 3);
        // Last three samples are 1, 2, 3 — the old 100s are out of scope.
        assert_eq!(w.push(3.0, 3), 2.0);
    }

    #[test]
    fn shrinking_window_takes_effect_immediately() {
        let mut w = MedianWindow::new();
        for v in [1.0, 2.0, 3.0, 4.0, 50.0] {
            w.push(v, 5);
        }
        // Same history, window now 1: newest sample wins.
        assert_eq!(w.push(6.0, 1), 6.0);
    }

    #[test]
    fn reset_clears_history() {
        let mut w = MedianWindow::new();
        w.push(5.0, 3);
        w.push(6.0, 3);
        w.reset();
        assert_eq!(w.push(1.0, 3), 1.0);
    }
}
