use statrs::distribution::{ContinuousCDF, Normal};

/// Two-sided p-value for a standard-normal test statistic.
pub fn two_sided_p_value(z: f64) -> Option<f64> {
    if !z.is_finite() {
        return None;
    }
    let normal = Normal::new(0.0, 1.0).ok()?;
    // sf() keeps precision for large |z| where 1 - cdf underflows.
    let p = 2.0 * normal.sf(z.abs());
    Some(p.max(f64::MIN_POSITIVE).min(1.0))
}

/// Difference of means with unequal variances (normal approximation).
pub fn mean_difference_p_value(
    current_mean: f64,
    current_variance: f64,
    current_n: u64,
    baseline_mean: f64,
    baseline_variance: f64,
    baseline_n: u64,
) -> Option<f64> {
    if current_n < 2 || baseline_n < 2 {
        return None;
    }
    let se = (current_variance / current_n as f64 + baseline_variance / baseline_n as f64).sqrt();
    if !(se.is_finite() && se > 0.0) {
        return None;
    }
    two_sided_p_value((current_mean - baseline_mean) / se)
}

/// Pooled two-proportion z-test.
pub fn proportion_difference_p_value(
    current_share: f64,
    current_n: u64,
    baseline_share: f64,
    baseline_n: u64,
) -> Option<f64> {
    if current_n == 0 || baseline_n == 0 {
        return None;
    }
    let (n1, n2) = (current_n as f64, baseline_n as f64);
    let pooled = (current_share * n1 + baseline_share * n2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();
    if !(se.is_finite() && se > 0.0) {
        return None;
    }
    two_sided_p_value((current_share - baseline_share) / se)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p_value_matches_normal_tail() {
        let p = two_sided_p_value(1.959_963_984_540_054).unwrap();
        assert!((p - 0.05).abs() < 1e-6);
        assert!(two_sided_p_value(40.0).unwrap() > 0.0);
        assert!(two_sided_p_value(f64::NAN).is_none());
    }

    #[test]
    fn shifted_means_with_tight_spread_are_significant() {
        let p = mean_difference_p_value(6.0, 0.25, 100, 5.0, 0.25, 400).unwrap();
        assert!(p < 0.05);
        assert!(mean_difference_p_value(6.0, 0.25, 1, 5.0, 0.25, 400).is_none());
    }

    #[test]
    fn identical_shares_are_not_significant() {
        let p = proportion_difference_p_value(0.4, 200, 0.4, 800).unwrap();
        assert!(p > 0.99);
    }
}
