/// Running count/mean/variance/min/max using Welford's update.
///
/// Memory is constant per metric; non-finite inputs are ignored.
#[derive(Debug, Clone, Default)]
pub struct Welford {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Welford {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.count += 1;
        if self.count == 1 {
            self.mean = value;
            self.m2 = 0.0;
            self.min = value;
            self.max = value;
            return;
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Sample variance (n - 1 denominator).
    pub fn variance(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        Some((self.m2 / (self.count - 1) as f64).max(0.0))
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// `None` when the spread is degenerate (fewer than two points or zero variance).
    pub fn z_score(&self, value: f64) -> Option<f64> {
        let std_dev = self.std_dev()?;
        if !(std_dev > 1e-12) || !value.is_finite() {
            return None;
        }
        Some((value - self.mean) / std_dev)
    }
}

impl FromIterator<f64> for Welford {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = Welford::new();
        for value in iter {
            acc.push(value);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_two_pass_moments() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let acc: Welford = values.iter().copied().collect();
        assert_eq!(acc.count(), 8);
        assert!((acc.mean().unwrap() - 5.0).abs() < 1e-12);
        // Sum of squared deviations is 32, sample variance 32 / 7.
        assert!((acc.variance().unwrap() - 32.0 / 7.0).abs() < 1e-12);
        assert_eq!(acc.min(), Some(2.0));
        assert_eq!(acc.max(), Some(9.0));
    }

    #[test]
    fn stays_stable_with_large_offsets() {
        let offset = 1e9;
        let acc: Welford = [4.0, 7.0, 13.0, 16.0].iter().map(|v| v + offset).collect();
        // Naive sum-of-squares loses this variance entirely at this magnitude.
        assert!((acc.variance().unwrap() - 30.0).abs() < 1e-4);
    }

    #[test]
    fn degenerate_inputs_have_no_spread() {
        let mut acc = Welford::new();
        assert_eq!(acc.mean(), None);
        acc.push(f64::NAN);
        acc.push(3.0);
        assert_eq!(acc.count(), 1);
        assert_eq!(acc.variance(), None);
        acc.push(3.0);
        assert_eq!(acc.z_score(10.0), None);
    }
}
