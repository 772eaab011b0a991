//! Running statistics for Monte Carlo estimates and training diagnostics.

use serde::{Deserialize, Serialize};

/// Keep track of the average, the error and the chi-squared of
/// integral estimates collected over multiple iterations.
///
/// Single evaluations can be added with [`StatisticsAccumulator::add_sample()`] and
/// are combined into one iteration estimate by [`StatisticsAccumulator::update_iter()`].
/// Alternatively, a finished estimate can be added directly with
/// [`StatisticsAccumulator::add_iteration()`]. Iterations are combined with
/// inverse-variance weights.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StatisticsAccumulator {
    sum: f64,
    sum_sq: f64,
    new_samples: usize,
    new_zero_evaluations: usize,
    weight_sum: f64,
    weighted_sum: f64,
    /// Reference point for the chi-squared sums, the first iteration average.
    guess: f64,
    shifted_sum: f64,
    shifted_sum_sq: f64,
    pub avg: f64,
    pub err: f64,
    pub chi_sq: f64,
    pub cur_iter: usize,
    pub processed_samples: usize,
    pub num_zero_evaluations: usize,
    pub max_eval: f64,
}

impl StatisticsAccumulator {
    pub fn new() -> StatisticsAccumulator {
        StatisticsAccumulator::default()
    }

    /// Add an evaluation. The average and error are only updated upon calling [`Self::update_iter()`].
    pub fn add_sample(&mut self, eval: f64) {
        self.sum += eval;
        self.sum_sq += eval * eval;
        self.new_samples += 1;

        if eval == 0. {
            self.new_zero_evaluations += 1;
        }

        if eval > self.max_eval {
            self.max_eval = eval;
        }
    }

    /// Turn the samples added with [`Self::add_sample()`] into an iteration estimate.
    /// Returns `false` when there were fewer than two samples, in which case they are discarded.
    pub fn update_iter(&mut self) -> bool {
        let n = self.new_samples;
        let (sum, sum_sq) = (self.sum, self.sum_sq);
        self.sum = 0.;
        self.sum_sq = 0.;
        self.new_samples = 0;

        if n < 2 {
            self.new_zero_evaluations = 0;
            self.cur_iter += 1;
            return false;
        }

        let nf = n as f64;
        let mean = sum / nf;
        let var = ((sum_sq / nf - mean * mean) * nf / (nf - 1.)).max(0.) / nf;

        self.num_zero_evaluations += self.new_zero_evaluations;
        self.new_zero_evaluations = 0;
        self.add_iteration(mean, var, n);
        true
    }

    /// Add the estimate `mean` with variance `variance` of one iteration that used `samples` points.
    pub fn add_iteration(&mut self, mean: f64, variance: f64, samples: usize) {
        // a vanishing variance means all points were identical
        let w = if variance > 0. {
            variance.recip()
        } else {
            f64::MAX.sqrt()
        };

        if self.cur_iter == 0 || self.weight_sum == 0. {
            self.guess = mean;
        }

        let d = mean - self.guess;
        self.weight_sum += w;
        self.weighted_sum += w * mean;
        self.shifted_sum += w * d;
        self.shifted_sum_sq += w * d * d;

        self.avg = self.weighted_sum / self.weight_sum;
        self.err = self.weight_sum.recip().sqrt();
        self.chi_sq = (self.shifted_sum_sq - self.shifted_sum * self.shifted_sum / self.weight_sum).max(0.);
        self.processed_samples += samples;
        self.cur_iter += 1;
    }

    /// The chi-squared per degree of freedom of the combined iterations.
    pub fn reduced_chi_sq(&self) -> f64 {
        if self.cur_iter > 1 {
            self.chi_sq / (self.cur_iter - 1) as f64
        } else {
            0.
        }
    }

    /// Format the current average and error as `mean(err)`.
    pub fn format_uncertainty(&self) -> String {
        format_uncertainty(self.avg, self.err)
    }
}

/// Format `mean ± err` as `mean(err)`, with the error given to two significant digits
/// in units of the last printed digit of the mean, e.g. `0.2501(13)`.
pub fn format_uncertainty(mean: f64, err: f64) -> String {
    if !mean.is_finite() || !err.is_finite() {
        return format!("{:e} ± {:e}", mean, err);
    }

    if err == 0. {
        return format!("{}(0)", mean);
    }

    if mean != 0. && (mean.abs() >= 1e6 || mean.abs() < 1e-5) {
        let exponent = mean.abs().log10().floor() as i32;
        let fac = 10f64.powi(exponent);
        return format!("{}e{}", format_uncertainty(mean / fac, err / fac), exponent);
    }

    let decimals = (1 - err.log10().floor() as i32).max(0);
    let scaled = (err * 10f64.powi(decimals)).round();
    format!("{:.*}({:.0})", decimals as usize, mean, scaled)
}

/// The mean and the population variance of `data`.
pub fn moments(data: &[f64]) -> (f64, f64) {
    if data.is_empty() {
        return (0., 0.);
    }

    let n = data.len() as f64;
    let mean = data.iter().sum::<f64>() / n;
    let var = data.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var)
}

/// Exponentially weighted moving average of the last `window` entries of `data`.
///
/// The weights are `exp(t)` for `t` evenly spaced in `[-1, 0]`, normalised, with
/// the most recent value receiving the largest weight. If `data` has at most
/// `window` entries, the last entry is returned.
pub fn ewma(data: &[f64], window: usize) -> Option<f64> {
    let last = *data.last()?;
    let window = window.max(1);
    if data.len() <= window {
        return Some(last);
    }

    let step = if window > 1 {
        1. / (window - 1) as f64
    } else {
        0.
    };

    let mut norm = 0.;
    let mut acc = 0.;
    for (i, x) in data[data.len() - window..].iter().enumerate() {
        let w = (i as f64 * step - 1.).exp();
        norm += w;
        acc += w * x;
    }

    Some(acc / norm)
}
