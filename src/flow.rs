//! A normalizing flow on the unit hypercube: a uniform base distribution
//! pushed through a chain of spline coupling layers.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    conditioner::{BlobEncoding, Conditioner, ConditionerFactory, DenseConfig},
    coupling::{CouplingLayer, Mask},
    error::{FlowError, Result},
    rng::MonteCarloRng,
    spline::{Spline, SplineConfig},
};

/// The structure of a [Flow].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub dims: usize,
    /// One mask per coupling layer, applied in this order when sampling.
    pub masks: Vec<Mask>,
    pub spline: SplineConfig,
    pub conditioner: DenseConfig,
    /// The number of bins of the one-blob encoding of the conditioner inputs.
    pub blob: Option<usize>,
}

impl FlowConfig {
    /// A flow with the default masks, spline and conditioner for `dims` dimensions.
    pub fn new(dims: usize) -> FlowConfig {
        FlowConfig {
            dims,
            masks: Self::default_masks(dims),
            spline: SplineConfig::default(),
            conditioner: DenseConfig::default(),
            blob: None,
        }
    }

    /// Alternating masks and their complement. For more than two dimensions
    /// these are followed by the split masks.
    pub fn default_masks(dims: usize) -> Vec<Mask> {
        let mut masks = vec![Mask::alternating(dims, true), Mask::alternating(dims, false)];
        if dims > 2 {
            masks.push(Mask::split(dims, true));
            masks.push(Mask::split(dims, false));
        }
        masks
    }
}

/// The derivatives of a scalar with respect to the parameters of every layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowGradient {
    pub layers: Vec<Vec<f64>>,
}

impl FlowGradient {
    pub fn norm(&self) -> f64 {
        self.layers
            .iter()
            .flatten()
            .map(|g| g * g)
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.layers.iter().flatten().all(|g| g.is_finite())
    }
}

/// The trainable state of a flow: the conditioner parameters of every layer,
/// keyed `layer_00`, `layer_01`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub dims: usize,
    pub layers: BTreeMap<String, Vec<f64>>,
}

impl FlowState {
    pub fn layer_key(index: usize) -> String {
        format!("layer_{:02}", index)
    }

    pub fn write<W: Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: R) -> Result<FlowState> {
        Ok(bincode::deserialize_from(reader)?)
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    dims: usize,
    layers: Vec<CouplingLayer>,
}

impl Flow {
    /// Build a flow with dense conditioners, initialised from `rng`.
    pub fn new(config: &FlowConfig, rng: &mut MonteCarloRng) -> Result<Flow> {
        let dense = config.conditioner.clone();
        let factory = move |i: usize, o: usize, rng: &mut MonteCarloRng| -> Box<dyn Conditioner> {
            Box::new(dense.build(i, o, rng))
        };
        Self::with_factory(config, &factory, rng)
    }

    /// Build a flow whose conditioners are created by `factory`.
    pub fn with_factory(
        config: &FlowConfig,
        factory: &dyn ConditionerFactory,
        rng: &mut MonteCarloRng,
    ) -> Result<Flow> {
        Self::check_coverage(config.dims, &config.masks)?;

        let spline = Spline::new(config.spline.clone())?;
        let blob = config.blob.map(BlobEncoding::new).transpose()?;

        let layers = config
            .masks
            .iter()
            .map(|m| CouplingLayer::new(m.clone(), spline.clone(), blob, factory, rng))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Created flow with {} layers and {} parameters",
            layers.len(),
            layers.iter().map(|l| l.num_parameters()).sum::<usize>()
        );

        Ok(Flow {
            dims: config.dims,
            layers,
        })
    }

    /// Assemble a flow from existing layers.
    pub fn from_layers(dims: usize, layers: Vec<CouplingLayer>) -> Result<Flow> {
        let masks: Vec<_> = layers.iter().map(|l| l.mask().clone()).collect();
        Self::check_coverage(dims, &masks)?;
        Ok(Flow { dims, layers })
    }

    /// Every dimension must be transformed by at least one layer and
    /// conditioned on by at least one other layer.
    pub fn check_coverage(dims: usize, masks: &[Mask]) -> Result<()> {
        if dims == 0 || masks.is_empty() {
            return Err(FlowError::InvalidConfiguration(
                "A flow needs at least one dimension and one layer".to_owned(),
            ));
        }

        for m in masks {
            if m.len() != dims {
                return Err(FlowError::DimensionMismatch {
                    expected: dims,
                    found: m.len(),
                });
            }
        }

        for d in 0..dims {
            let transformed = masks.iter().any(|m| m.is_transformed(d));
            let conditioned = masks.iter().any(|m| !m.is_transformed(d));
            if !transformed || !conditioned {
                return Err(FlowError::MaskCoverage { dimension: d });
            }
        }

        Ok(())
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn layers(&self) -> &[CouplingLayer] {
        &self.layers
    }

    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.num_parameters()).sum()
    }

    /// Mutable views on the parameters of every layer, in layer order.
    pub fn parameters_mut(&mut self) -> impl Iterator<Item = &mut [f64]> {
        self.layers.iter_mut().map(|l| l.parameters_mut())
    }

    /// Draw `n` points from the flow.
    pub fn sample(&self, n: usize, rng: &mut MonteCarloRng) -> Result<Vec<Vec<f64>>> {
        Ok(self.sample_with_log_prob(n, rng)?.0)
    }

    /// Draw `n` points together with their log density, computed from the
    /// forward Jacobians in the same pass.
    pub fn sample_with_log_prob(
        &self,
        n: usize,
        rng: &mut MonteCarloRng,
    ) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        let base = rng.uniform_points(n, self.dims);
        let (points, log_det) = self.forward(&base)?;
        Ok((points, log_det.into_iter().map(|l| -l).collect()))
    }

    /// Push points from the base space through all layers.
    pub fn forward(&self, points: &[Vec<f64>]) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        let mut current = points.to_vec();
        let mut log_det = vec![0.; points.len()];
        for l in &self.layers {
            let (next, ld) = l.forward(&current)?;
            for (a, b) in log_det.iter_mut().zip(ld) {
                *a += b;
            }
            current = next;
        }
        Ok((current, log_det))
    }

    /// Map points back to the base space.
    pub fn inverse(&self, points: &[Vec<f64>]) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        let mut current = points.to_vec();
        let mut log_det = vec![0.; points.len()];
        for l in self.layers.iter().rev() {
            let (next, ld) = l.inverse(&current)?;
            for (a, b) in log_det.iter_mut().zip(ld) {
                *a += b;
            }
            current = next;
        }
        Ok((current, log_det))
    }

    /// The log density of the flow. The uniform base contributes zero.
    pub fn log_prob(&self, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.inverse(points)?.1)
    }

    pub fn prob(&self, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self.log_prob(points)?.into_iter().map(f64::exp).collect())
    }

    /// Compute the log density of `points` and the derivatives of
    /// `sum_i seeds[i] * log_prob(points[i])` with respect to all parameters.
    pub fn log_prob_gradient(
        &self,
        points: &[Vec<f64>],
        seeds: &[f64],
    ) -> Result<(Vec<f64>, FlowGradient)> {
        if seeds.len() != points.len() {
            return Err(FlowError::DimensionMismatch {
                expected: points.len(),
                found: seeds.len(),
            });
        }

        // inputs[l] is the input of the inverse of layer l
        let mut inputs = vec![vec![]; self.layers.len()];
        let mut current = points.to_vec();
        let mut log_prob = vec![0.; points.len()];
        for (i, l) in self.layers.iter().enumerate().rev() {
            let (next, ld) = l.inverse(&current)?;
            for (a, b) in log_prob.iter_mut().zip(ld) {
                *a += b;
            }
            inputs[i] = std::mem::replace(&mut current, next);
        }

        let mut grads: Vec<Vec<f64>> = self
            .layers
            .iter()
            .map(|l| vec![0.; l.num_parameters()])
            .collect();

        // the base density is constant
        let mut grad_out = vec![vec![0.; self.dims]; points.len()];
        for ((l, x), g) in self.layers.iter().zip(&inputs).zip(&mut grads) {
            grad_out = l.inverse_gradient(x, &grad_out, seeds, g)?;
        }

        Ok((log_prob, FlowGradient { layers: grads }))
    }

    pub fn state(&self) -> FlowState {
        FlowState {
            dims: self.dims,
            layers: self
                .layers
                .iter()
                .enumerate()
                .map(|(i, l)| (FlowState::layer_key(i), l.parameters().to_vec()))
                .collect(),
        }
    }

    /// Restore the parameters from `state`. Nothing is modified if the state does not fit.
    pub fn load_state(&mut self, state: &FlowState) -> Result<()> {
        if state.dims != self.dims {
            return Err(FlowError::CheckpointMismatch(format!(
                "Checkpoint has {} dimensions, the flow has {}",
                state.dims, self.dims
            )));
        }

        if state.layers.len() != self.layers.len() {
            return Err(FlowError::CheckpointMismatch(format!(
                "Checkpoint has {} layers, the flow has {}",
                state.layers.len(),
                self.layers.len()
            )));
        }

        for (i, l) in self.layers.iter().enumerate() {
            let key = FlowState::layer_key(i);
            match state.layers.get(&key) {
                Some(p) if p.len() == l.num_parameters() => {}
                Some(p) => {
                    return Err(FlowError::CheckpointMismatch(format!(
                        "{} has {} parameters, expected {}",
                        key,
                        p.len(),
                        l.num_parameters()
                    )))
                }
                None => {
                    return Err(FlowError::CheckpointMismatch(format!("{} is missing", key)));
                }
            }
        }

        for (i, l) in self.layers.iter_mut().enumerate() {
            l.parameters_mut()
                .copy_from_slice(&state.layers[&FlowState::layer_key(i)]);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use rand::Rng;

    use super::{Flow, FlowConfig, FlowState};
    use crate::{
        conditioner::{Activation, DenseConfig},
        coupling::Mask,
        error::FlowError,
        rng::MonteCarloRng,
        spline::{SplineConfig, SplineKind},
    };

    /// A flow with randomised output layers, far from the identity.
    fn random_flow(dims: usize, kind: SplineKind, seed: u64) -> Flow {
        let config = FlowConfig {
            spline: SplineConfig::new(kind, 5),
            conditioner: DenseConfig {
                hidden_layers: vec![6],
                activation: Activation::Tanh,
                zero_init_output: false,
            },
            ..FlowConfig::new(dims)
        };
        let mut rng = MonteCarloRng::new(seed, 0);
        Flow::new(&config, &mut rng).unwrap()
    }

    #[test]
    fn mask_coverage() {
        let covering = vec![
            Mask::from_bits(&[1, 0, 1, 0]).unwrap(),
            Mask::from_bits(&[0, 1, 0, 1]).unwrap(),
        ];
        assert!(Flow::check_coverage(4, &covering).is_ok());

        let never_transformed = vec![
            Mask::from_bits(&[1, 0, 1, 0]).unwrap(),
            Mask::from_bits(&[0, 0, 0, 1]).unwrap(),
        ];
        assert!(matches!(
            Flow::check_coverage(4, &never_transformed),
            Err(FlowError::MaskCoverage { dimension: 1 })
        ));

        assert!(matches!(
            Flow::check_coverage(3, &covering),
            Err(FlowError::DimensionMismatch { .. })
        ));
        assert!(Flow::check_coverage(1, &[Mask::from_bits(&[1]).unwrap()]).is_err());

        assert_eq!(FlowConfig::default_masks(2).len(), 2);
        assert!(Flow::check_coverage(5, &FlowConfig::default_masks(5)).is_ok());
    }

    #[test]
    fn round_trip() {
        let flow = random_flow(3, SplineKind::RationalQuadratic, 1);
        let mut rng = MonteCarloRng::new(4, 0);
        let (points, log_q) = flow.sample_with_log_prob(100, &mut rng).unwrap();

        let (base, ld_inv) = flow.inverse(&points).unwrap();
        let (again, ld) = flow.forward(&base).unwrap();
        for (a, b) in points.iter().zip(&again) {
            for (u, v) in a.iter().zip(b) {
                assert!((u - v).abs() < 1e-6);
            }
        }
        for ((q, li), lf) in log_q.iter().zip(&ld_inv).zip(&ld) {
            assert!((q - li).abs() < 1e-6);
            assert!((li + lf).abs() < 1e-6);
        }
    }

    #[test]
    fn identity_at_initialisation() {
        let mut rng = MonteCarloRng::new(9, 0);
        let flow = Flow::new(&FlowConfig::new(2), &mut rng).unwrap();
        let points = vec![vec![0.1, 0.7], vec![0.55, 0.25]];
        let (out, ld) = flow.forward(&points).unwrap();
        for (a, b) in points.iter().zip(&out) {
            for (u, v) in a.iter().zip(b) {
                assert_relative_eq!(u, v, epsilon = 1e-12);
            }
        }
        assert!(ld.iter().all(|l| l.abs() < 1e-12));
    }

    #[test]
    fn density_is_normalised() {
        // E_q[1/q] = volume of the unit cube
        for kind in [SplineKind::Quadratic, SplineKind::RationalQuadratic] {
            let flow = random_flow(2, kind, 17);
            let mut rng = MonteCarloRng::new(5, 0);
            let (_, log_q) = flow.sample_with_log_prob(40000, &mut rng).unwrap();
            let inv: Vec<f64> = log_q.iter().map(|l| (-l).exp()).collect();
            let (mean, var) = crate::statistics::moments(&inv);
            let err = (var / inv.len() as f64).sqrt();
            assert!((mean - 1.).abs() < 5. * err + 1e-3, "{}: {} ± {}", kind, mean, err);

            // and a plain uniform estimate of the integral of q
            let uniform = rng.uniform_points(40000, 2);
            let q = flow.prob(&uniform).unwrap();
            let (mean, var) = crate::statistics::moments(&q);
            let err = (var / q.len() as f64).sqrt();
            assert!((mean - 1.).abs() < 5. * err + 1e-3, "{}: {} ± {}", kind, mean, err);
        }
    }

    #[test]
    fn log_prob_gradient_matches_finite_difference() {
        let flow = random_flow(3, SplineKind::Quadratic, 23);
        let mut rng = MonteCarloRng::new(8, 0);
        let points = rng.uniform_points(5, 3);
        let seeds: Vec<f64> = (0..5).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let (log_prob, grad) = flow.log_prob_gradient(&points, &seeds).unwrap();
        assert_eq!(log_prob, flow.log_prob(&points).unwrap());

        let objective = |f: &Flow| -> f64 {
            f.log_prob(&points)
                .unwrap()
                .iter()
                .zip(&seeds)
                .map(|(l, s)| l * s)
                .sum()
        };

        let eps = 1e-6;
        for layer in 0..flow.layers().len() {
            for j in (0..flow.layers()[layer].num_parameters()).step_by(5) {
                let mut up = flow.clone();
                up.parameters_mut().nth(layer).unwrap()[j] += eps;
                let mut down = flow.clone();
                down.parameters_mut().nth(layer).unwrap()[j] -= eps;
                let fd = (objective(&up) - objective(&down)) / (2. * eps);
                assert_relative_eq!(grad.layers[layer][j], fd, epsilon = 1e-5, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn state_round_trip() {
        let flow = random_flow(2, SplineKind::RationalQuadratic, 1);
        let state = flow.state();
        assert_eq!(
            state.layers.keys().cloned().collect::<Vec<_>>(),
            vec!["layer_00".to_owned(), "layer_01".to_owned()]
        );

        let mut buffer = vec![];
        state.write(&mut buffer).unwrap();
        let read = FlowState::read(buffer.as_slice()).unwrap();
        assert_eq!(read, state);

        let mut other = random_flow(2, SplineKind::RationalQuadratic, 2);
        assert_ne!(other.state(), state);
        other.load_state(&read).unwrap();
        assert_eq!(other.state(), state);

        let points = vec![vec![0.3, 0.4]];
        assert_eq!(other.log_prob(&points).unwrap(), flow.log_prob(&points).unwrap());

        let mut wrong = random_flow(3, SplineKind::RationalQuadratic, 1);
        assert!(matches!(
            wrong.load_state(&state),
            Err(FlowError::CheckpointMismatch(_))
        ));

        let mut truncated = state.clone();
        truncated.layers.get_mut("layer_01").unwrap().pop();
        assert!(other.load_state(&truncated).is_err());
        assert_eq!(other.state(), state);
    }
}
