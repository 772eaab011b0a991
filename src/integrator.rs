//! Train a [Flow] to approximate the shape of a nonnegative integrand, and use
//! the trained flow for importance sampling.
//!
//! The integrand is treated as a black box: only its values at the sampled
//! points enter the loss, with the importance weights `w = p / q` held fixed
//! during back-propagation.
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//!
//! use flowmc::flow::FlowConfig;
//! use flowmc::functions::product;
//! use flowmc::integrator::{Integrator, IntegratorSettings, Pointwise, TrainingOptions};
//!
//! let mut integrator = Integrator::from_config(
//!     &FlowConfig::new(2),
//!     Pointwise(product),
//!     IntegratorSettings::default(),
//! )
//! .unwrap();
//!
//! let options = TrainingOptions::default();
//! integrator.train(&options, &AtomicBool::new(false)).unwrap();
//! let (mean, variance) = integrator.integrate(100_000).unwrap();
//! println!("{} ± {}", mean, (variance / 100_000.).sqrt());
//! ```

use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{FlowError, Result},
    flow::{Flow, FlowConfig, FlowState},
    optimizer::{Adam, LearningRate},
    rng::MonteCarloRng,
    statistics::{ewma, format_uncertainty, moments, StatisticsAccumulator},
};

/// A function that can be evaluated on a batch of points.
pub trait Integrand {
    fn evaluate(&mut self, points: &[Vec<f64>]) -> Vec<f64>;
}

impl<F: FnMut(&[Vec<f64>]) -> Vec<f64>> Integrand for F {
    fn evaluate(&mut self, points: &[Vec<f64>]) -> Vec<f64> {
        self(points)
    }
}

/// Evaluate a function of a single point on every point of a batch.
#[derive(Debug, Clone, Copy)]
pub struct Pointwise<F>(pub F);

impl<F: FnMut(&[f64]) -> f64> Integrand for Pointwise<F> {
    fn evaluate(&mut self, points: &[Vec<f64>]) -> Vec<f64> {
        points.iter().map(|p| (self.0)(p)).collect()
    }
}

/// The divergence that is minimised during training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossMode {
    /// `mean(w (log p_hat - log q))`, the importance sampled Kullback-Leibler divergence.
    #[default]
    KullbackLeibler,
    /// `mean(-w^2 log q)`, a surrogate of the Pearson chi-squared divergence.
    ChiSquared,
}

impl Display for LossMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossMode::KullbackLeibler => f.write_str("kl"),
            LossMode::ChiSquared => f.write_str("chi2"),
        }
    }
}

impl FromStr for LossMode {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kl" | "kullback_leibler" => Ok(LossMode::KullbackLeibler),
            "chi2" | "chi_squared" => Ok(LossMode::ChiSquared),
            _ => Err(FlowError::UnknownKey {
                kind: "loss",
                key: s.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorSettings {
    pub loss: LossMode,
    pub learning_rate: LearningRate,
    /// Clip the global gradient norm to this value.
    pub clip_norm: Option<f64>,
    /// Floor for densities and weights before reciprocals and logarithms.
    pub weight_epsilon: f64,
    pub seed: u64,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        IntegratorSettings {
            loss: LossMode::KullbackLeibler,
            learning_rate: LearningRate::default(),
            clip_norm: Some(5.),
            weight_epsilon: 1e-16,
            seed: 0,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<()> {
        self.learning_rate.validate()?;

        if let Some(c) = self.clip_norm {
            if !(c > 0.) {
                return Err(FlowError::InvalidConfiguration(format!(
                    "Gradient clip norm must be positive, found {}",
                    c
                )));
            }
        }

        if !(self.weight_epsilon > 0.) {
            return Err(FlowError::InvalidConfiguration(format!(
                "Weight epsilon must be positive, found {}",
                self.weight_epsilon
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegratorState {
    Uninitialized,
    Training,
    Converged,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegralEstimate {
    pub mean: f64,
    pub error: f64,
}

impl Display for IntegralEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&format_uncertainty(self.mean, self.error))
    }
}

/// The report of a single training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingStep {
    pub step: usize,
    pub loss: f64,
    /// Whether the parameters were updated. Steps with a non-finite loss or gradient are skipped.
    pub updated: bool,
    pub integral: Option<IntegralEstimate>,
}

/// Per-step loss, integral estimate and variance of the integral estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub loss: Vec<f64>,
    pub integral: Vec<f64>,
    pub variance: Vec<f64>,
}

impl TrainingHistory {
    pub fn len(&self) -> usize {
        self.loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loss.is_empty()
    }

    pub fn smoothed_loss(&self, window: usize) -> Option<f64> {
        ewma(&self.loss, window)
    }

    pub fn smoothed_integral(&self, window: usize) -> Option<f64> {
        ewma(&self.integral, window)
    }
}

/// Options of [Integrator::train].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub samples_per_step: usize,
    /// Log the progress every this many steps. Zero disables progress logging.
    pub log_every: usize,
    /// Keep a copy of the parameters with the lowest loss, see [Integrator::restore_best].
    pub keep_best: bool,
    /// Stop once the relative error of the per-step integral estimate drops below this value.
    pub target_relative_error: Option<f64>,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        TrainingOptions {
            epochs: 500,
            samples_per_step: 1000,
            log_every: 100,
            keep_best: false,
            target_relative_error: None,
        }
    }
}

/// The weights evaluated in one batch.
struct WeightedBatch {
    points: Vec<Vec<f64>>,
    weights: Vec<f64>,
    mean: f64,
    variance: f64,
}

pub struct Integrator<I: Integrand> {
    flow: Flow,
    integrand: I,
    settings: IntegratorSettings,
    optimizer: Adam,
    rng: MonteCarloRng,
    history: TrainingHistory,
    global_step: usize,
    state: IntegratorState,
    best: Option<(f64, FlowState)>,
    results: StatisticsAccumulator,
}

impl<I: Integrand> Integrator<I> {
    /// Create an integrator for an existing flow. Points are drawn from
    /// stream 0 of the settings' seed.
    pub fn new(flow: Flow, integrand: I, settings: IntegratorSettings) -> Result<Integrator<I>> {
        settings.validate()?;

        let block_sizes: Vec<_> = flow.layers().iter().map(|l| l.num_parameters()).collect();
        Ok(Integrator {
            optimizer: Adam::new(&block_sizes, settings.clip_norm),
            rng: MonteCarloRng::new(settings.seed, 0),
            flow,
            integrand,
            settings,
            history: TrainingHistory::default(),
            global_step: 0,
            state: IntegratorState::Uninitialized,
            best: None,
            results: StatisticsAccumulator::new(),
        })
    }

    /// Build the flow from `config`, with the conditioner weights drawn from
    /// stream 1 of the settings' seed.
    pub fn from_config(
        config: &FlowConfig,
        integrand: I,
        settings: IntegratorSettings,
    ) -> Result<Integrator<I>> {
        let mut init_rng = MonteCarloRng::new(settings.seed, 1);
        let flow = Flow::new(config, &mut init_rng)?;
        Self::new(flow, integrand, settings)
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn integrand_mut(&mut self) -> &mut I {
        &mut self.integrand
    }

    pub fn settings(&self) -> &IntegratorSettings {
        &self.settings
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn state(&self) -> IntegratorState {
        self.state
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// The combination of all estimates made with [Integrator::integrate].
    pub fn results(&self) -> &StatisticsAccumulator {
        &self.results
    }

    /// The lowest loss seen while training with [TrainingOptions::keep_best].
    pub fn best_loss(&self) -> Option<f64> {
        self.best.as_ref().map(|b| b.0)
    }

    /// Evaluate the integrand and replace non-finite and negative values by zero.
    fn evaluate(&mut self, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        let mut values = self.integrand.evaluate(points);
        if values.len() != points.len() {
            return Err(FlowError::DimensionMismatch {
                expected: points.len(),
                found: values.len(),
            });
        }

        let mut sanitised = 0;
        for v in &mut values {
            if !v.is_finite() || *v < 0. {
                *v = 0.;
                sanitised += 1;
            }
        }

        if sanitised > 0 {
            warn!(
                "Replaced {} non-finite or negative integrand values by zero",
                sanitised
            );
        }

        Ok(values)
    }

    /// Draw `n` points and compute their importance weights.
    fn weighted_batch(&mut self, n: usize) -> Result<(WeightedBatch, Vec<f64>)> {
        if n == 0 {
            return Err(FlowError::InvalidConfiguration(
                "At least one sample is required".to_owned(),
            ));
        }

        let (points, log_q) = self.flow.sample_with_log_prob(n, &mut self.rng)?;
        let p = self.evaluate(&points)?;

        let eps = self.settings.weight_epsilon;
        let weights: Vec<f64> = p
            .iter()
            .zip(&log_q)
            .map(|(p, lq)| p / lq.exp().max(eps))
            .collect();
        let (mean, variance) = moments(&weights);

        Ok((
            WeightedBatch {
                points,
                weights,
                mean,
                variance,
            },
            log_q,
        ))
    }

    /// Perform one optimisation step on a batch of `n` points.
    ///
    /// If `compute_integral` is set, the step also reports the integral estimate
    /// `mean(w)` and its standard error `sqrt(var(w) / n)` from the same batch.
    #[instrument(level = "debug", skip(self))]
    pub fn train_one_step(&mut self, n: usize, compute_integral: bool) -> Result<TrainingStep> {
        let (batch, log_q) = self.weighted_batch(n)?;
        if self.state == IntegratorState::Uninitialized {
            self.state = IntegratorState::Training;
        }

        let eps = self.settings.weight_epsilon;
        let nf = n as f64;
        let mean = batch.mean.max(eps);

        let (loss, seeds): (f64, Vec<f64>) = match self.settings.loss {
            LossMode::KullbackLeibler => {
                let loss = batch
                    .weights
                    .iter()
                    .zip(&log_q)
                    .filter(|(w, _)| **w > 0.)
                    .map(|(w, lq)| {
                        // w q = p
                        let log_p_hat = (w * lq.exp().max(eps) / mean).max(eps).ln();
                        w * (log_p_hat - lq)
                    })
                    .sum::<f64>()
                    / nf;
                (loss, batch.weights.iter().map(|w| -w / nf).collect())
            }
            LossMode::ChiSquared => {
                let loss = batch
                    .weights
                    .iter()
                    .zip(&log_q)
                    .map(|(w, lq)| -w * w * lq)
                    .sum::<f64>()
                    / nf;
                (loss, batch.weights.iter().map(|w| -w * w / nf).collect())
            }
        };

        let (_, grad) = self.flow.log_prob_gradient(&batch.points, &seeds)?;

        let updated = if !loss.is_finite() || !grad.is_finite() {
            warn!(
                "Skipping step {}: non-finite loss {} or gradient",
                self.global_step, loss
            );
            false
        } else {
            let lr = self.settings.learning_rate.at(self.global_step);
            let norm = self
                .optimizer
                .step(self.flow.parameters_mut(), &grad.layers, lr)?;
            debug!(
                "Step {}: loss={:e}, gradient norm={:e}, learning rate={:e}",
                self.global_step, loss, norm, lr
            );
            true
        };

        let variance = batch.variance / nf;
        self.history.loss.push(loss);
        self.history.integral.push(batch.mean);
        self.history.variance.push(variance);

        let step = self.global_step;
        self.global_step += 1;

        Ok(TrainingStep {
            step,
            loss,
            updated,
            integral: compute_integral.then(|| IntegralEstimate {
                mean: batch.mean,
                error: variance.sqrt(),
            }),
        })
    }

    /// Train for at most `options.epochs` steps. The `interrupt` flag is checked
    /// before every step; when set, training stops and the integrator remains
    /// usable in the [IntegratorState::Interrupted] state.
    pub fn train(
        &mut self,
        options: &TrainingOptions,
        interrupt: &AtomicBool,
    ) -> Result<IntegratorState> {
        if options.samples_per_step == 0 {
            return Err(FlowError::InvalidConfiguration(
                "At least one sample per step is required".to_owned(),
            ));
        }

        let window = options.log_every.max(10);
        for epoch in 0..options.epochs {
            if interrupt.load(Ordering::Relaxed) {
                info!("Training interrupted at step {}", self.global_step);
                self.state = IntegratorState::Interrupted;
                return Ok(self.state);
            }

            let step = self.train_one_step(options.samples_per_step, true)?;

            if options.keep_best
                && step.loss.is_finite()
                && self.best.as_ref().map_or(true, |b| step.loss < b.0)
            {
                self.best = Some((step.loss, self.flow.state()));
            }

            if options.log_every > 0 && (epoch + 1) % options.log_every == 0 {
                let integral = self.history.smoothed_integral(window).unwrap_or(0.);
                let error = ewma(&self.history.variance, window).unwrap_or(0.).sqrt();
                info!(
                    "Epoch {}: loss={:.6e}, integral={}",
                    self.global_step,
                    self.history.smoothed_loss(window).unwrap_or(step.loss),
                    format_uncertainty(integral, error)
                );
            }

            if let (Some(target), Some(estimate)) = (options.target_relative_error, step.integral) {
                if estimate.mean > 0. && estimate.error / estimate.mean < target {
                    info!(
                        "Reached relative error {:e} at step {}: {}",
                        estimate.error / estimate.mean,
                        self.global_step,
                        estimate
                    );
                    self.state = IntegratorState::Converged;
                    return Ok(self.state);
                }
            }
        }

        if options.target_relative_error.is_none() {
            self.state = IntegratorState::Converged;
        }

        Ok(self.state)
    }

    /// Restore the parameters with the lowest loss recorded during training.
    /// Returns `false` if no snapshot was kept.
    pub fn restore_best(&mut self) -> Result<bool> {
        match &self.best {
            Some((loss, state)) => {
                self.flow.load_state(state)?;
                info!("Restored parameters with loss {:e}", loss);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Draw `n` points from the flow.
    pub fn sample(&mut self, n: usize) -> Result<Vec<Vec<f64>>> {
        self.flow.sample(n, &mut self.rng)
    }

    /// Estimate the integral with `n` points, returning the mean and the variance of the weights.
    /// Every weight is also added to [Integrator::results], which combines the
    /// iterations and tracks the largest weight and the number of zero weights.
    pub fn integrate(&mut self, n: usize) -> Result<(f64, f64)> {
        let (batch, _) = self.weighted_batch(n)?;
        for w in &batch.weights {
            self.results.add_sample(*w);
        }
        if !self.results.update_iter() {
            debug!("Skipped combining an iteration with a single point");
        }
        debug!(
            "Integral with {} points: {}",
            n,
            format_uncertainty(batch.mean, (batch.variance / n as f64).sqrt())
        );
        Ok((batch.mean, batch.variance))
    }

    /// The importance weights `p / q` of `n` fresh points.
    pub fn acceptance(&mut self, n: usize) -> Result<Vec<f64>> {
        Ok(self.weighted_batch(n)?.0.weights)
    }

    /// The parameters of every layer.
    pub fn save(&self) -> FlowState {
        self.flow.state()
    }

    /// Restore parameters created by [Integrator::save]. The layer count and sizes must match.
    /// The moment estimates of the optimizer are reset, since they belong to the previous parameters.
    pub fn load(&mut self, state: &FlowState) -> Result<()> {
        self.flow.load_state(state)?;
        self.optimizer.reset();
        Ok(())
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        self.save().write(&mut writer)?;
        writer.flush()?;
        info!("Saved flow to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let file = File::open(path.as_ref())?;
        let state = FlowState::read(BufReader::new(file))?;
        self.load(&state)?;
        info!("Loaded flow from {}", path.as_ref().display());
        Ok(())
    }
}

/// The unweighting efficiency `mean(w) / max(w)` of a set of weights.
pub fn unweighting_efficiency(weights: &[f64]) -> f64 {
    let max = weights.iter().cloned().fold(0., f64::max);
    if max > 0. {
        moments(weights).0 / max
    } else {
        0.
    }
}

/// The weights of plain uniform sampling, i.e. the integrand values at `n` uniform points.
pub fn uniform_weights<I: Integrand>(
    integrand: &mut I,
    dims: usize,
    n: usize,
    rng: &mut MonteCarloRng,
) -> Vec<f64> {
    let points = rng.uniform_points(n, dims);
    integrand
        .evaluate(&points)
        .into_iter()
        .map(|v| if v.is_finite() && v > 0. { v } else { 0. })
        .collect()
}
