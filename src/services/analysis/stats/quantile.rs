//! Percentiles over a stream in constant space.
//!
//! The first [`EXACT_LIMIT`] values are kept verbatim and percentiles over them are exact.
//! Past that the buffer seeds one P² marker set per percentile (Jain & Chlamtac, 1985) and is
//! dropped, so memory stays fixed however large the batch grows.

use serde::{Deserialize, Serialize};

pub const EXACT_LIMIT: usize = 32;

const PROBABILITIES: [f64; 4] = [0.25, 0.50, 0.75, 0.90];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
}

/// Linear interpolation between closest ranks; `sorted` must be ascending and finite.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if !(0.0..=1.0).contains(&q) || sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let pos = q * (sorted.len() as f64 - 1.0);
    let idx = pos.floor() as usize;
    let frac = pos - idx as f64;
    let a = sorted[idx];
    let b = sorted[(idx + 1).min(sorted.len() - 1)];
    Some(a + (b - a) * frac)
}

pub fn percentiles(values: &mut [f64]) -> Option<Percentiles> {
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    Some(Percentiles {
        p25: quantile_sorted(values, 0.25)?,
        p50: quantile_sorted(values, 0.50)?,
        p75: quantile_sorted(values, 0.75)?,
        p90: quantile_sorted(values, 0.90)?,
    })
}

/// Five markers tracking one quantile: min, two midpoints, the target, and max.
#[derive(Debug, Clone)]
struct P2Marker {
    heights: [f64; 5],
    positions: [f64; 5],
    desired: [f64; 5],
    increments: [f64; 5],
}

impl P2Marker {
    /// `sorted` must be ascending with more than five values.
    fn seeded(p: f64, sorted: &[f64]) -> Self {
        let last = sorted.len() - 1;
        let m = last as f64;
        let desired = [0.0, m * p / 2.0, m * p, m * (1.0 + p) / 2.0, m];
        let mut ranks = [
            0,
            desired[1].round() as usize,
            desired[2].round() as usize,
            desired[3].round() as usize,
            last,
        ];
        for i in 1..5 {
            ranks[i] = ranks[i].max(ranks[i - 1] + 1);
        }
        for i in (1..4).rev() {
            ranks[i] = ranks[i].min(ranks[i + 1] - 1);
        }
        Self {
            heights: ranks.map(|r| sorted[r]),
            positions: ranks.map(|r| r as f64),
            desired,
            increments: [0.0, p / 2.0, p, (1.0 + p) / 2.0, 1.0],
        }
    }

    fn push(&mut self, x: f64) {
        let h = &mut self.heights;
        let cell = if x < h[0] {
            h[0] = x;
            0
        } else if x >= h[4] {
            h[4] = x;
            3
        } else {
            (0..4).find(|&i| h[i] <= x && x < h[i + 1]).unwrap_or(3)
        };
        for position in &mut self.positions[cell + 1..] {
            *position += 1.0;
        }
        for (desired, increment) in self.desired.iter_mut().zip(self.increments) {
            *desired += increment;
        }

        for i in 1..4 {
            let drift = self.desired[i] - self.positions[i];
            let n = self.positions;
            if (drift >= 1.0 && n[i + 1] - n[i] > 1.0) || (drift <= -1.0 && n[i - 1] - n[i] < -1.0) {
                let step = drift.signum();
                let candidate = self.parabolic(i, step);
                self.heights[i] = if self.heights[i - 1] < candidate && candidate < self.heights[i + 1] {
                    candidate
                } else {
                    self.linear(i, step)
                };
                self.positions[i] += step;
            }
        }
    }

    fn parabolic(&self, i: usize, step: f64) -> f64 {
        let (q, n) = (&self.heights, &self.positions);
        q[i] + step / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + step) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - step) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, step: f64) -> f64 {
        let j = if step > 0.0 { i + 1 } else { i - 1 };
        let (q, n) = (&self.heights, &self.positions);
        q[i] + step * (q[j] - q[i]) / (n[j] - n[i])
    }

    fn estimate(&self) -> f64 {
        self.heights[2]
    }
}

/// p25/p50/p75/p90 over a stream of values.
#[derive(Debug, Clone, Default)]
pub struct StreamingPercentiles {
    buffer: Vec<f64>,
    markers: Option<[P2Marker; 4]>,
    saw_non_finite: bool,
}

impl StreamingPercentiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            self.saw_non_finite = true;
            return;
        }
        if let Some(markers) = self.markers.as_mut() {
            for marker in markers.iter_mut() {
                marker.push(value);
            }
            return;
        }
        self.buffer.push(value);
        if self.buffer.len() > EXACT_LIMIT {
            self.buffer.sort_by(f64::total_cmp);
            let markers = PROBABILITIES.map(|p| P2Marker::seeded(p, &self.buffer));
            self.markers = Some(markers);
            self.buffer = Vec::new();
        }
    }

    /// Values still held verbatim; zero once the markers take over.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_exact(&self) -> bool {
        self.markers.is_none()
    }

    /// `None` for an empty stream or one that contained a non-finite value.
    pub fn estimate(&self) -> Option<Percentiles> {
        if self.saw_non_finite {
            return None;
        }
        match &self.markers {
            Some([p25, p50, p75, p90]) => Some(Percentiles {
                p25: p25.estimate(),
                p50: p50.estimate(),
                p75: p75.estimate(),
                p90: p90.estimate(),
            }),
            None => percentiles(&mut self.buffer.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(values: &[f64]) -> Percentiles {
        percentiles(&mut values.to_vec()).unwrap()
    }

    fn streamed(values: &[f64]) -> StreamingPercentiles {
        let mut stream = StreamingPercentiles::new();
        for v in values {
            stream.push(*v);
        }
        stream
    }

    fn assert_close(got: Percentiles, want: Percentiles, tolerance: f64) {
        for (g, w) in [
            (got.p25, want.p25),
            (got.p50, want.p50),
            (got.p75, want.p75),
            (got.p90, want.p90),
        ] {
            assert!((g - w).abs() <= tolerance, "got {got:?}, want {want:?}");
        }
    }

    #[test]
    fn small_streams_are_exact() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        let stream = streamed(&values);
        assert!(stream.is_exact());
        assert_eq!(stream.estimate().unwrap(), exact(&values));
        assert!(StreamingPercentiles::new().estimate().is_none());
    }

    #[test]
    fn large_streams_hold_constant_state_and_track_true_percentiles() {
        // Deterministic scramble of 0..100.
        let values: Vec<f64> = (0..10_000u64)
            .map(|i| ((i * 7919) % 10_007) as f64 / 10_007.0 * 100.0)
            .collect();
        let stream = streamed(&values);
        assert!(!stream.is_exact());
        assert_eq!(stream.buffered(), 0);
        assert_close(stream.estimate().unwrap(), exact(&values), 0.5);
    }

    #[test]
    fn sorted_input_stays_close() {
        let values: Vec<f64> = (0..=1000).map(f64::from).collect();
        assert_close(streamed(&values).estimate().unwrap(), exact(&values), 2.0);

        let constant = vec![3.0; 50];
        let p = streamed(&constant).estimate().unwrap();
        assert_eq!((p.p25, p.p90), (3.0, 3.0));
    }

    #[test]
    fn non_finite_values_poison_the_stream() {
        let mut stream = streamed(&[1.0, 2.0, 3.0]);
        stream.push(f64::INFINITY);
        assert!(stream.estimate().is_none());
    }

    #[test]
    fn interpolates_between_ranks() {
        let mut values = vec![5.0, 1.0, 4.0, 2.0, 3.0];
        let p = percentiles(&mut values).unwrap();
        assert_eq!(p.p50, 3.0);
        assert_eq!(p.p25, 2.0);
        assert_eq!(p.p75, 4.0);
        assert!((p.p90 - 4.6).abs() < 1e-12);
    }

    #[test]
    fn rejects_empty_and_non_finite_input() {
        assert!(percentiles(&mut []).is_none());
        assert!(percentiles(&mut [1.0, f64::NAN]).is_none());
        assert_eq!(quantile_sorted(&[7.0], 0.9), Some(7.0));
        assert_eq!(quantile_sorted(&[1.0, 2.0], 1.5), None);
    }
}
