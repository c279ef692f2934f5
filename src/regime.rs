use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::engine::EngineError;
use crate::stats::mean_std;

pub const REGIME_STATES: usize = 3;
const MAX_ITERS: usize = 200;
const LL_TOL: f64 = 1e-4;
const VAR_FLOOR: f64 = 1e-10;
const PROB_FLOOR: f64 = 1e-300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Regime {
    MeanReverting,
    Trending,
    Volatile,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::MeanReverting => "MEAN_REVERTING",
            Regime::Trending => "TRENDING",
            Regime::Volatile => "VOLATILE",
        }
    }
}

/// Gaussian HMM over spread first-differences. State identity is anonymous
/// during fitting; labels are assigned afterwards from the variance ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HmmParams {
    pub initial: [f64; REGIME_STATES],
    pub transition: [[f64; REGIME_STATES]; REGIME_STATES],
    pub means: [f64; REGIME_STATES],
    pub variances: [f64; REGIME_STATES],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeModel {
    pub params: HmmParams,
    /// labels[state] maps a hidden state index to its regime. Lowest
    /// variance is MEAN_REVERTING, highest is VOLATILE, regardless of the
    /// state order EM happened to converge to.
    pub labels: [Regime; REGIME_STATES],
    pub trained_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeState {
    pub regime: Regime,
    pub confidence: f64,
    /// Posterior mass in label order: mean-reverting, trending, volatile.
    pub posterior: [f64; REGIME_STATES],
}

impl RegimeState {
    /// Fallback when no usable model exists. Reported as fully volatile so
    /// entry gating stays closed rather than open.
    pub fn unknown() -> Self {
        Self {
            regime: Regime::Volatile,
            confidence: 1.0,
            posterior: [0.0, 0.0, 1.0],
        }
    }

    pub fn confidence_in(&self, regime: Regime) -> f64 {
        self.posterior[regime_index(regime)]
    }
}

fn regime_index(regime: Regime) -> usize {
    match regime {
        Regime::MeanReverting => 0,
        Regime::Trending => 1,
        Regime::Volatile => 2,
    }
}

/// Baum-Welch fit with scaled forward-backward passes. Converges on the
/// log-likelihood delta or stops at the iteration cap.
pub fn train(
    observations: &[f64],
    min_samples: usize,
    trained_at: i64,
) -> Result<RegimeModel, EngineError> {
    let needed = min_samples.max(10);
    if observations.len() < needed {
        return Err(EngineError::InsufficientData {
            needed,
            got: observations.len(),
        });
    }
    let (_, std_all) = mean_std(observations).ok_or_else(|| {
        EngineError::DegenerateStatistic("empty observation window".to_string())
    })?;
    if std_all < 1e-8 {
        return Err(EngineError::DegenerateStatistic(
            "observation window has no variance".to_string(),
        ));
    }

    let mut params = init_params(observations, std_all);
    let mut prev_ll = f64::NEG_INFINITY;
    for _ in 0..MAX_ITERS {
        let pass = forward_backward(&params, observations);
        reestimate(&mut params, observations, &pass);
        if (pass.log_likelihood - prev_ll).abs() < LL_TOL {
            break;
        }
        prev_ll = pass.log_likelihood;
    }

    Ok(RegimeModel {
        labels: variance_ranked_labels(&params.variances),
        params,
        trained_at,
    })
}

fn init_params(observations: &[f64], std_all: f64) -> HmmParams {
    let mut sorted = observations.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let quantile = |f: f64| sorted[((sorted.len() - 1) as f64 * f) as usize];
    let var_all = (std_all * std_all).max(VAR_FLOOR);
    HmmParams {
        initial: [1.0 / 3.0; REGIME_STATES],
        transition: [
            [0.8, 0.1, 0.1],
            [0.1, 0.8, 0.1],
            [0.1, 0.1, 0.8],
        ],
        means: [quantile(1.0 / 6.0), quantile(0.5), quantile(5.0 / 6.0)],
        // staggered so EM can pull the states apart by dispersion
        variances: [0.5 * var_all, var_all, 2.0 * var_all],
    }
}

struct ForwardBackward {
    gamma: Vec<[f64; REGIME_STATES]>,
    xi_sum: [[f64; REGIME_STATES]; REGIME_STATES],
    log_likelihood: f64,
}

fn emissions(params: &HmmParams, observations: &[f64]) -> Vec<[f64; REGIME_STATES]> {
    observations
        .iter()
        .map(|&obs| {
            let mut row = [0.0; REGIME_STATES];
            for s in 0..REGIME_STATES {
                row[s] = gaussian_pdf(obs, params.means[s], params.variances[s]).max(PROB_FLOOR);
            }
            row
        })
        .collect()
}

fn gaussian_pdf(x: f64, mean: f64, var: f64) -> f64 {
    let v = var.max(VAR_FLOOR);
    let d = x - mean;
    (-(d * d) / (2.0 * v)).exp() / (2.0 * std::f64::consts::PI * v).sqrt()
}

fn forward_backward(params: &HmmParams, observations: &[f64]) -> ForwardBackward {
    let t_len = observations.len();
    let emit = emissions(params, observations);

    let mut alpha = vec![[0.0; REGIME_STATES]; t_len];
    let mut scale = vec![0.0; t_len];
    for s in 0..REGIME_STATES {
        alpha[0][s] = params.initial[s] * emit[0][s];
    }
    scale[0] = alpha[0].iter().sum::<f64>().max(PROB_FLOOR);
    for s in 0..REGIME_STATES {
        alpha[0][s] /= scale[0];
    }
    for t in 1..t_len {
        for s in 0..REGIME_STATES {
            let mut acc = 0.0;
            for p in 0..REGIME_STATES {
                acc += alpha[t - 1][p] * params.transition[p][s];
            }
            alpha[t][s] = acc * emit[t][s];
        }
        scale[t] = alpha[t].iter().sum::<f64>().max(PROB_FLOOR);
        for s in 0..REGIME_STATES {
            alpha[t][s] /= scale[t];
        }
    }

    let mut beta = vec![[0.0; REGIME_STATES]; t_len];
    beta[t_len - 1] = [1.0; REGIME_STATES];
    for t in (0..t_len - 1).rev() {
        for s in 0..REGIME_STATES {
            let mut acc = 0.0;
            for n in 0..REGIME_STATES {
                acc += params.transition[s][n] * emit[t + 1][n] * beta[t + 1][n];
            }
            beta[t][s] = acc / scale[t + 1];
        }
    }

    let mut gamma = vec![[0.0; REGIME_STATES]; t_len];
    for t in 0..t_len {
        let mut total = 0.0;
        for s in 0..REGIME_STATES {
            gamma[t][s] = alpha[t][s] * beta[t][s];
            total += gamma[t][s];
        }
        if total > 0.0 {
            for s in 0..REGIME_STATES {
                gamma[t][s] /= total;
            }
        }
    }

    let mut xi_sum = [[0.0; REGIME_STATES]; REGIME_STATES];
    for t in 0..t_len - 1 {
        let mut step = [[0.0; REGIME_STATES]; REGIME_STATES];
        let mut total = 0.0;
        for i in 0..REGIME_STATES {
            for j in 0..REGIME_STATES {
                step[i][j] =
                    alpha[t][i] * params.transition[i][j] * emit[t + 1][j] * beta[t + 1][j];
                total += step[i][j];
            }
        }
        if total > 0.0 {
            for i in 0..REGIME_STATES {
                for j in 0..REGIME_STATES {
                    xi_sum[i][j] += step[i][j] / total;
                }
            }
        }
    }

    let log_likelihood = scale.iter().map(|c| c.ln()).sum();
    ForwardBackward {
        gamma,
        xi_sum,
        log_likelihood,
    }
}

fn reestimate(params: &mut HmmParams, observations: &[f64], pass: &ForwardBackward) {
    let t_len = observations.len();
    params.initial = pass.gamma[0];
    for i in 0..REGIME_STATES {
        let denom: f64 = pass.gamma[..t_len - 1].iter().map(|g| g[i]).sum();
        if denom > 1e-12 {
            for j in 0..REGIME_STATES {
                params.transition[i][j] = pass.xi_sum[i][j] / denom;
            }
        }
        let row_sum: f64 = params.transition[i].iter().sum();
        if row_sum > 0.0 {
            for j in 0..REGIME_STATES {
                params.transition[i][j] /= row_sum;
            }
        }

        let weight: f64 = pass.gamma.iter().map(|g| g[i]).sum();
        if weight > 1e-12 {
            let mean = pass
                .gamma
                .iter()
                .zip(observations)
                .map(|(g, &o)| g[i] * o)
                .sum::<f64>()
                / weight;
            let var = pass
                .gamma
                .iter()
                .zip(observations)
                .map(|(g, &o)| {
                    let d = o - mean;
                    g[i] * d * d
                })
                .sum::<f64>()
                / weight;
            params.means[i] = mean;
            params.variances[i] = var.max(VAR_FLOOR);
        }
    }
}

fn variance_ranked_labels(variances: &[f64; REGIME_STATES]) -> [Regime; REGIME_STATES] {
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| variances[a].partial_cmp(&variances[b]).unwrap_or(Ordering::Equal));
    let mut labels = [Regime::Trending; REGIME_STATES];
    labels[order[0]] = Regime::MeanReverting;
    labels[order[1]] = Regime::Trending;
    labels[order[2]] = Regime::Volatile;
    labels
}

/// Normalized filtering distribution after one forward pass over the window.
/// Online classification uses this rather than a smoothing pass so the most
/// recent observation carries full weight.
pub fn forward_posterior(params: &HmmParams, observations: &[f64]) -> [f64; REGIME_STATES] {
    if observations.is_empty() {
        return [1.0 / REGIME_STATES as f64; REGIME_STATES];
    }
    let emit = emissions(params, observations);
    let mut current = [0.0; REGIME_STATES];
    for s in 0..REGIME_STATES {
        current[s] = params.initial[s] * emit[0][s];
    }
    normalize(&mut current);
    for t in 1..observations.len() {
        let mut next = [0.0; REGIME_STATES];
        for s in 0..REGIME_STATES {
            let mut acc = 0.0;
            for p in 0..REGIME_STATES {
                acc += current[p] * params.transition[p][s];
            }
            next[s] = acc * emit[t][s];
        }
        normalize(&mut next);
        current = next;
    }
    current
}

fn normalize(probs: &mut [f64; REGIME_STATES]) {
    let total: f64 = probs.iter().sum();
    if total > 0.0 {
        for p in probs.iter_mut() {
            *p /= total;
        }
    } else {
        *probs = [1.0 / REGIME_STATES as f64; REGIME_STATES];
    }
}

impl RegimeModel {
    pub fn classify(&self, observations: &[f64]) -> RegimeState {
        if observations.is_empty() {
            return RegimeState::unknown();
        }
        let posterior = forward_posterior(&self.params, observations);
        let mut best = 0;
        for s in 1..REGIME_STATES {
            if posterior[s] > posterior[best] {
                best = s;
            }
        }
        let mut by_regime = [0.0; REGIME_STATES];
        for s in 0..REGIME_STATES {
            by_regime[regime_index(self.labels[s])] += posterior[s];
        }
        RegimeState {
            regime: self.labels[best],
            confidence: posterior[best],
            posterior: by_regime,
        }
    }
}
