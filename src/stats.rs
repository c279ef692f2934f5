use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::engine::EngineError;

const STD_EPSILON: f64 = 1e-8;
const SECS_PER_DAY: f64 = 86_400.0;
// Hysteresis band: the exit level is never allowed closer than this fraction
// of the entry level.
const MAX_EXIT_ENTRY_RATIO: f64 = 0.75;
const ENTRY_WIDE_MULT: f64 = 1.5;
const ENTRY_TIGHT_MULT: f64 = 0.85;
const EXIT_FAST_MULT: f64 = 0.8;
const EXIT_SLOW_MULT: f64 = 1.2;
const EXIT_CAP_MULT: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub ts: i64,
    pub price: f64,
}

/// Pair two ordered series on equal timestamps over their common range.
/// Unmatched points are dropped, so the result is as long as the shorter
/// overlap, never padded.
pub fn align_series(a: &[PricePoint], b: &[PricePoint]) -> (Vec<f64>, Vec<f64>) {
    let mut out_a = Vec::new();
    let mut out_b = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].ts.cmp(&b[j].ts) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out_a.push(a[i].price);
                out_b.push(b[j].price);
                i += 1;
                j += 1;
            }
        }
    }
    (out_a, out_b)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CointegrationResult {
    pub beta: f64,
    pub intercept: f64,
    pub p_value: f64,
    pub half_life_days: f64,
    pub evaluated_at: i64,
    pub samples: usize,
}

impl CointegrationResult {
    /// A pair is tradeable only while the residuals test stationary and the
    /// estimated reversion horizon is finite and inside the configured band.
    pub fn qualifies(&self, p_threshold: f64, half_life_min_days: f64, half_life_max_days: f64) -> bool {
        self.p_value < p_threshold
            && self.half_life_days.is_finite()
            && self.half_life_days >= half_life_min_days
            && self.half_life_days <= half_life_max_days
    }
}

/// OLS regression of `a` on `b` with intercept; beta is the slope.
/// Runs the Engle-Granger residual stationarity test and the AR(1) half-life
/// fit on the regression residuals. Only the training window may be passed
/// in here; later signal evaluation must not feed back into this estimate.
pub fn estimate_pair(
    a: &[f64],
    b: &[f64],
    min_samples: usize,
    bar_secs: u64,
    evaluated_at: i64,
) -> Result<CointegrationResult, EngineError> {
    let n = a.len().min(b.len());
    if n < min_samples.max(5) {
        return Err(EngineError::InsufficientData {
            needed: min_samples.max(5),
            got: n,
        });
    }
    let y = &a[a.len() - n..];
    let x = &b[b.len() - n..];
    let (intercept, beta) = ols(y, x).ok_or_else(|| {
        EngineError::DegenerateStatistic("regressor variance is zero".to_string())
    })?;
    let residuals: Vec<f64> = (0..n).map(|i| y[i] - intercept - beta * x[i]).collect();
    let (half_life_bars, p_value) = residual_stationarity(&residuals);
    let half_life_days = half_life_bars * bar_secs as f64 / SECS_PER_DAY;
    Ok(CointegrationResult {
        beta,
        intercept,
        p_value,
        half_life_days,
        evaluated_at,
        samples: n,
    })
}

fn ols(y: &[f64], x: &[f64]) -> Option<(f64, f64)> {
    let n = y.len().min(x.len());
    if n < 2 {
        return None;
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    for i in 0..n {
        let dx = x[i] - mean_x;
        cov += dx * (y[i] - mean_y);
        var_x += dx * dx;
    }
    if var_x.abs() < 1e-12 {
        return None;
    }
    let slope = cov / var_x;
    Some((mean_y - slope * mean_x, slope))
}

/// AR(1) fit on residual levels: dr_t = phi * r_{t-1} + eps. Returns the
/// implied half-life in bars and a Dickey-Fuller p-value for the phi t-stat.
/// A non-reverting series (1 + phi outside (0, 1)) reports an infinite
/// half-life, which fails qualification upstream.
fn residual_stationarity(residuals: &[f64]) -> (f64, f64) {
    if residuals.len() < 5 {
        return (f64::INFINITY, 1.0);
    }
    let mut lag: Vec<f64> = Vec::with_capacity(residuals.len() - 1);
    let mut delta: Vec<f64> = Vec::with_capacity(residuals.len() - 1);
    for w in residuals.windows(2) {
        lag.push(w[0]);
        delta.push(w[1] - w[0]);
    }
    let n = lag.len();
    let mean_lag = lag.iter().sum::<f64>() / n as f64;
    let mean_delta = delta.iter().sum::<f64>() / n as f64;
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        num += (lag[i] - mean_lag) * (delta[i] - mean_delta);
        den += (lag[i] - mean_lag) * (lag[i] - mean_lag);
    }
    if den.abs() < 1e-12 {
        return (f64::INFINITY, 1.0);
    }
    let phi = (num / den).clamp(-0.999, 0.999);

    let mut rss = 0.0;
    for i in 0..n {
        let fitted = phi * (lag[i] - mean_lag) + mean_delta;
        let err = delta[i] - fitted;
        rss += err * err;
    }
    let sigma2 = rss / (n.saturating_sub(2)).max(1) as f64;
    let se_phi = (sigma2 / den).sqrt();
    let t_stat = if se_phi < 1e-12 { 0.0 } else { phi / se_phi };
    let p_value = df_p_value(t_stat, n);

    let ar_coef = 1.0 + phi;
    let half_life = if ar_coef <= 0.0 || ar_coef >= 1.0 {
        f64::INFINITY
    } else {
        -(2.0_f64).ln() / ar_coef.ln()
    };
    (half_life, p_value.clamp(0.0, 1.0))
}

fn df_p_value(t_stat: f64, n: usize) -> f64 {
    // Interpolated Dickey-Fuller critical values (with constant), approximate
    const CRITS: &[(usize, f64, f64, f64)] = &[
        (25, -3.75, -3.00, -2.63),
        (50, -3.58, -2.93, -2.60),
        (100, -3.51, -2.89, -2.58),
        (250, -3.46, -2.88, -2.57),
        (500, -3.44, -2.87, -2.57),
    ];
    let (c1, c5, c10) = interpolate_crits(n, CRITS);
    if t_stat < c1 {
        0.005
    } else if t_stat < c5 {
        0.025
    } else if t_stat < c10 {
        0.075
    } else {
        0.5
    }
}

fn interpolate_crits(n: usize, table: &[(usize, f64, f64, f64)]) -> (f64, f64, f64) {
    if n <= table[0].0 {
        return (table[0].1, table[0].2, table[0].3);
    }
    for w in table.windows(2) {
        let (n1, a1, b1, c1) = w[0];
        let (n2, a2, b2, c2) = w[1];
        if n >= n1 && n <= n2 {
            let t = (n - n1) as f64 / (n2 - n1) as f64;
            let lerp = |lo: f64, hi: f64| lo + t * (hi - lo);
            return (lerp(a1, a2), lerp(b1, b2), lerp(c1, c2));
        }
    }
    let last = table[table.len() - 1];
    (last.1, last.2, last.3)
}

/// Frozen normalization statistics for a pair's spread. Mean/std come from
/// the training window only and are held fixed until the next accepted
/// retraining, so signal extremity is always judged against the same
/// reference the hedge ratio was fitted on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpreadModel {
    pub beta: f64,
    pub train_mean: f64,
    pub train_std: f64,
    /// Std of spread first-differences over the training window, the
    /// denominator of the volatility ratio.
    pub train_vol: f64,
    pub trained_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ZScoreSignal {
    pub ts: i64,
    pub z: f64,
    pub spread: f64,
    pub mean: f64,
    pub std: f64,
}

impl SpreadModel {
    pub fn fit(result: &CointegrationResult, a: &[f64], b: &[f64]) -> Result<Self, EngineError> {
        let n = a.len().min(b.len());
        if n < 2 {
            return Err(EngineError::InsufficientData { needed: 2, got: n });
        }
        let spreads: Vec<f64> = (0..n)
            .map(|i| a[a.len() - n + i] - result.beta * b[b.len() - n + i])
            .collect();
        let (train_mean, train_std) = mean_std(&spreads).ok_or_else(|| {
            EngineError::DegenerateStatistic("empty training spread".to_string())
        })?;
        let diffs: Vec<f64> = spreads.windows(2).map(|w| w[1] - w[0]).collect();
        let train_vol = mean_std(&diffs).map(|(_, s)| s).unwrap_or(0.0);
        Ok(Self {
            beta: result.beta,
            train_mean,
            train_std,
            train_vol,
            trained_at: result.evaluated_at,
        })
    }

    pub fn spread(&self, price_a: f64, price_b: f64) -> f64 {
        price_a - self.beta * price_b
    }

    /// One signal per aligned price pair. Abstains with DegenerateStatistic
    /// when the frozen std cannot support a division.
    pub fn signal(&self, ts: i64, price_a: f64, price_b: f64) -> Result<ZScoreSignal, EngineError> {
        if self.train_std < STD_EPSILON {
            return Err(EngineError::DegenerateStatistic(format!(
                "train std {:.3e} below epsilon",
                self.train_std
            )));
        }
        let spread = self.spread(price_a, price_b);
        Ok(ZScoreSignal {
            ts,
            z: (spread - self.train_mean) / self.train_std,
            spread,
            mean: self.train_mean,
            std: self.train_std,
        })
    }
}

pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    Some((mean, var.sqrt()))
}

pub fn tail_std(window: &VecDeque<f64>, len: usize) -> Option<f64> {
    if window.is_empty() || len == 0 {
        return None;
    }
    let start = window.len().saturating_sub(len);
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for v in window.iter().skip(start) {
        sum += *v;
        sum_sq += v * v;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let mean = sum / count as f64;
    let var = (sum_sq / count as f64) - mean * mean;
    Some(var.max(0.0).sqrt())
}

/// Reversion speed in [0, 1] from the recent spread window: zero-crossing
/// rate around the window mean blended with lag-1 autocorrelation. Above 0.5
/// counts as fast reversion.
pub fn reversion_speed(spread: &[f64]) -> f64 {
    if spread.len() < 3 {
        return 0.5;
    }
    let mean = spread.iter().sum::<f64>() / spread.len() as f64;
    let centered: Vec<f64> = spread.iter().map(|v| v - mean).collect();
    let mut crossings = 0usize;
    for w in centered.windows(2) {
        if w[0] != 0.0 && w[0].signum() != w[1].signum() {
            crossings += 1;
        }
    }
    let crossing_rate = crossings as f64 / (centered.len() - 1) as f64;
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 1..centered.len() {
        num += centered[i] * centered[i - 1];
    }
    for v in &centered {
        den += v * v;
    }
    let rho = if den.abs() < 1e-12 {
        1.0
    } else {
        (num / den).clamp(-1.0, 1.0)
    };
    let speed = 0.5 * (2.0 * crossing_rate).min(1.0) + 0.5 * ((1.0 - rho) / 2.0).clamp(0.0, 1.0);
    speed.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub entry: f64,
    pub exit: f64,
}

/// Adaptive entry/exit levels for the cycle. Entry widens with the ratio of
/// recent to training volatility; exit tightens when reversion is fast.
/// The exit level is clamped strictly below entry, so the hysteresis band
/// can never degenerate.
pub fn dynamic_thresholds(
    base_entry: f64,
    base_exit: f64,
    vol_ratio: Option<f64>,
    speed: f64,
) -> Thresholds {
    let entry_mult = match vol_ratio {
        Some(ratio) if ratio < 0.7 => ENTRY_TIGHT_MULT,
        Some(ratio) if ratio > 1.3 => ENTRY_WIDE_MULT,
        _ => 1.0,
    };
    let entry = (base_entry * entry_mult).min(base_entry * ENTRY_WIDE_MULT);
    let exit_mult = if speed > 0.5 { EXIT_FAST_MULT } else { EXIT_SLOW_MULT };
    let exit = (base_exit * exit_mult)
        .min(base_exit * EXIT_CAP_MULT)
        .min(entry * MAX_EXIT_ENTRY_RATIO);
    Thresholds { entry, exit }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn points(values: &[(i64, f64)]) -> Vec<PricePoint> {
        values
            .iter()
            .map(|&(ts, price)| PricePoint { ts, price })
            .collect()
    }

    #[test]
    fn align_series_drops_unmatched_timestamps() {
        let a = points(&[(1, 10.0), (2, 11.0), (4, 12.0), (5, 13.0)]);
        let b = points(&[(2, 20.0), (3, 21.0), (4, 22.0), (6, 23.0)]);
        let (xa, xb) = align_series(&a, &b);
        assert_eq!(xa, vec![11.0, 12.0]);
        assert_eq!(xb, vec![20.0, 22.0]);
    }

    #[test]
    fn ols_beta_matches_closed_form() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.1, 4.2, 5.9, 8.1, 9.9];
        let (intercept, slope) = ols(&y, &x).unwrap();
        // closed form recomputed by hand
        let mean_x = 3.0;
        let mean_y = y.iter().sum::<f64>() / 5.0;
        let cov: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(xv, yv)| (xv - mean_x) * (yv - mean_y))
            .sum();
        let var_x: f64 = x.iter().map(|xv| (xv - mean_x) * (xv - mean_x)).sum();
        assert!((slope - cov / var_x).abs() < 1e-12);
        assert!((intercept - (mean_y - slope * mean_x)).abs() < 1e-12);
    }

    #[test]
    fn estimate_pair_rejects_short_history() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![1.0, 2.0, 3.0];
        let err = estimate_pair(&a, &b, 30, 60, 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientData { needed: 30, got: 3 }
        ));
    }

    #[test]
    fn swapping_series_inverts_beta_and_keeps_verdict() {
        let mut rng = StdRng::seed_from_u64(7);
        // mean-reverting driver plus tightly coupled second leg
        let mut level = 0.0_f64;
        let mut a = Vec::new();
        let mut b = Vec::new();
        for _ in 0..300 {
            level = 0.8 * level + rng.gen_range(-0.5..0.5);
            let pa = 100.0 + level;
            a.push(pa);
            b.push(pa / 2.0 + rng.gen_range(-0.01..0.01));
        }
        let ab = estimate_pair(&a, &b, 30, 60, 0).unwrap();
        let ba = estimate_pair(&b, &a, 30, 60, 0).unwrap();
        assert!((ab.beta * ba.beta - 1.0).abs() < 0.05);
        assert!((ab.p_value - ba.p_value).abs() < 1e-12);
    }

    #[test]
    fn trending_residuals_report_infinite_half_life() {
        let residuals: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let (half_life, p) = residual_stationarity(&residuals);
        assert!(half_life.is_infinite());
        assert!(p >= 0.5);
    }

    #[test]
    fn oscillating_residuals_report_fast_half_life() {
        let residuals: Vec<f64> = (0..100).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let (half_life, p) = residual_stationarity(&residuals);
        assert!(half_life.is_finite());
        assert!(half_life < 1.0);
        assert!(p < 0.05);
    }

    #[test]
    fn qualification_requires_both_conditions() {
        let mut result = CointegrationResult {
            beta: 1.0,
            intercept: 0.0,
            p_value: 0.025,
            half_life_days: 5.0,
            evaluated_at: 0,
            samples: 100,
        };
        assert!(result.qualifies(0.05, 1.0, 60.0));
        result.p_value = 0.075;
        assert!(!result.qualifies(0.05, 1.0, 60.0));
        result.p_value = 0.025;
        result.half_life_days = f64::INFINITY;
        assert!(!result.qualifies(0.05, 1.0, 60.0));
        result.half_life_days = 90.0;
        assert!(!result.qualifies(0.05, 1.0, 60.0));
    }

    #[test]
    fn zscore_is_zero_at_mean_and_two_at_two_sigma() {
        let model = SpreadModel {
            beta: 1.5,
            train_mean: 10.0,
            train_std: 2.5,
            train_vol: 0.4,
            trained_at: 0,
        };
        // price pair placed exactly at the training mean
        let at_mean = model.signal(1, 10.0 + 1.5 * 20.0, 20.0).unwrap();
        assert!(at_mean.z.abs() < 1e-9);
        let at_two_sigma = model.signal(2, 15.0 + 1.5 * 20.0, 20.0).unwrap();
        assert!((at_two_sigma.z - 2.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_std_abstains() {
        let model = SpreadModel {
            beta: 1.0,
            train_mean: 0.0,
            train_std: 0.0,
            train_vol: 0.0,
            trained_at: 0,
        };
        assert!(matches!(
            model.signal(0, 1.0, 1.0),
            Err(EngineError::DegenerateStatistic(_))
        ));
    }

    #[test]
    fn fit_freezes_training_statistics() {
        let result = CointegrationResult {
            beta: 2.0,
            intercept: 0.0,
            p_value: 0.01,
            half_life_days: 3.0,
            evaluated_at: 99,
            samples: 4,
        };
        let a = vec![10.0, 12.0, 14.0, 16.0];
        let b = vec![4.0, 5.0, 6.0, 7.0];
        let model = SpreadModel::fit(&result, &a, &b).unwrap();
        // spreads are 2, 2, 2, 2
        assert!((model.train_mean - 2.0).abs() < 1e-12);
        assert!(model.train_std.abs() < 1e-12);
        assert_eq!(model.trained_at, 99);
    }

    #[test]
    fn reversion_speed_separates_fast_and_slow() {
        let fast: Vec<f64> = (0..50).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let slow: Vec<f64> = (0..50).map(|i| i as f64).collect();
        assert!(reversion_speed(&fast) > 0.5);
        assert!(reversion_speed(&slow) < 0.5);
    }

    #[test]
    fn thresholds_follow_volatility_ratio() {
        let tight = dynamic_thresholds(2.0, 1.0, Some(0.5), 0.3);
        let base = dynamic_thresholds(2.0, 1.0, Some(1.0), 0.3);
        let wide = dynamic_thresholds(2.0, 1.0, Some(2.0), 0.3);
        assert!((tight.entry - 1.7).abs() < 1e-12);
        assert!((base.entry - 2.0).abs() < 1e-12);
        assert!((wide.entry - 3.0).abs() < 1e-12);
    }

    #[test]
    fn exit_tightens_with_fast_reversion() {
        let fast = dynamic_thresholds(2.0, 1.0, Some(1.0), 0.9);
        let slow = dynamic_thresholds(2.0, 1.0, Some(1.0), 0.1);
        assert!((fast.exit - 0.8).abs() < 1e-12);
        assert!((slow.exit - 1.2).abs() < 1e-12);
    }

    #[test]
    fn hysteresis_band_never_degenerates() {
        for &ratio in &[None, Some(0.2), Some(0.7), Some(1.0), Some(1.3), Some(5.0)] {
            for &speed in &[0.0, 0.4, 0.5, 0.6, 1.0] {
                for &(entry, exit) in &[(2.0, 1.0), (1.5, 1.4), (1.0, 1.0), (0.5, 2.0)] {
                    let t = dynamic_thresholds(entry, exit, ratio, speed);
                    assert!(
                        t.exit < t.entry,
                        "exit {} not below entry {} (ratio {:?}, speed {})",
                        t.exit,
                        t.entry,
                        ratio,
                        speed
                    );
                }
            }
        }
    }
}
