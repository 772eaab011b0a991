//! Masked coupling layers.
//!
//! A coupling layer splits the coordinates of a point with a [Mask]. The
//! pass-through coordinates are fed to a [Conditioner] whose outputs define one
//! spline per transformed coordinate. Since the pass-through coordinates are not
//! modified, the layer is trivially invertible and its Jacobian is triangular.

use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    conditioner::{BlobEncoding, Conditioner, ConditionerFactory},
    domains::tape::Tape,
    error::{FlowError, Result},
    rng::MonteCarloRng,
    spline::Spline,
};

/// Selects the coordinates a coupling layer transforms (`true`) and
/// the coordinates that pass through and are conditioned on (`false`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mask(Vec<bool>);

impl Mask {
    pub fn new(bits: Vec<bool>) -> Mask {
        Mask(bits)
    }

    /// Create a mask from `0`/`1` entries.
    pub fn from_bits(bits: &[u8]) -> Result<Mask> {
        bits.iter()
            .map(|b| match b {
                0 => Ok(false),
                1 => Ok(true),
                _ => Err(FlowError::InvalidConfiguration(format!(
                    "Mask entries must be 0 or 1, found {}",
                    b
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Mask)
    }

    /// Transform every second coordinate, starting at 0 if `even` is set and at 1 otherwise.
    pub fn alternating(dims: usize, even: bool) -> Mask {
        let start = if even { 0 } else { 1 };
        Mask((0..dims).map(|i| i % 2 == start).collect())
    }

    /// Transform the first half of the coordinates if `first` is set, the second half otherwise.
    pub fn split(dims: usize, first: bool) -> Mask {
        let mid = dims / 2;
        Mask((0..dims).map(|i| (i < mid) == first).collect())
    }

    /// A random permutation of [Mask::split].
    pub fn random(dims: usize, rng: &mut MonteCarloRng) -> Mask {
        let mut m = Mask::split(dims, true);
        m.0.shuffle(rng);
        m
    }

    /// Swap transformed and pass-through coordinates.
    pub fn flip(&self) -> Mask {
        Mask(self.0.iter().map(|b| !b).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_transformed(&self, dim: usize) -> bool {
        self.0[dim]
    }

    pub fn transformed(&self) -> Vec<usize> {
        (0..self.0.len()).filter(|i| self.0[*i]).collect()
    }

    pub fn pass_through(&self) -> Vec<usize> {
        (0..self.0.len()).filter(|i| !self.0[*i]).collect()
    }

    pub fn bits(&self) -> &[bool] {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct CouplingLayer {
    mask: Mask,
    spline: Spline,
    blob: Option<BlobEncoding>,
    conditioner: Box<dyn Conditioner>,
    transformed: Vec<usize>,
    pass_through: Vec<usize>,
}

impl CouplingLayer {
    /// Create a layer whose conditioner is built by `factory`.
    pub fn new(
        mask: Mask,
        spline: Spline,
        blob: Option<BlobEncoding>,
        factory: &dyn ConditionerFactory,
        rng: &mut MonteCarloRng,
    ) -> Result<CouplingLayer> {
        let (in_features, out_features) = Self::conditioner_shape(&mask, &spline, blob);
        let conditioner = factory(in_features, out_features, rng);
        Self::with_conditioner(mask, spline, blob, conditioner)
    }

    pub fn with_conditioner(
        mask: Mask,
        spline: Spline,
        blob: Option<BlobEncoding>,
        conditioner: Box<dyn Conditioner>,
    ) -> Result<CouplingLayer> {
        let transformed = mask.transformed();
        if transformed.is_empty() {
            return Err(FlowError::InvalidConfiguration(format!(
                "Mask {:?} does not transform any dimension",
                mask.bits()
            )));
        }

        let (in_features, out_features) = Self::conditioner_shape(&mask, &spline, blob);
        if conditioner.in_features() != in_features {
            return Err(FlowError::DimensionMismatch {
                expected: in_features,
                found: conditioner.in_features(),
            });
        }
        if conditioner.out_features() != out_features {
            return Err(FlowError::DimensionMismatch {
                expected: out_features,
                found: conditioner.out_features(),
            });
        }

        Ok(CouplingLayer {
            pass_through: mask.pass_through(),
            transformed,
            mask,
            spline,
            blob,
            conditioner,
        })
    }

    /// The number of inputs and outputs of the conditioner of a layer.
    pub fn conditioner_shape(mask: &Mask, spline: &Spline, blob: Option<BlobEncoding>) -> (usize, usize) {
        let pass = mask.pass_through().len();
        let in_features = match blob {
            Some(b) => b.encoded_len(pass),
            None => pass,
        };
        (in_features, mask.transformed().len() * spline.num_raw_parameters())
    }

    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub fn spline(&self) -> &Spline {
        &self.spline
    }

    pub fn conditioner(&self) -> &dyn Conditioner {
        self.conditioner.as_ref()
    }

    pub fn parameters(&self) -> &[f64] {
        self.conditioner.parameters()
    }

    pub fn parameters_mut(&mut self) -> &mut [f64] {
        self.conditioner.parameters_mut()
    }

    pub fn num_parameters(&self) -> usize {
        self.conditioner.num_parameters()
    }

    fn check_dims(&self, points: &[Vec<f64>]) -> Result<()> {
        for p in points {
            if p.len() != self.mask.len() {
                return Err(FlowError::DimensionMismatch {
                    expected: self.mask.len(),
                    found: p.len(),
                });
            }
        }
        Ok(())
    }

    /// Gather the pass-through coordinates of all points.
    fn pass_through_values(&self, points: &[Vec<f64>]) -> Vec<f64> {
        points
            .iter()
            .flat_map(|p| self.pass_through.iter().map(move |d| p[*d]))
            .collect()
    }

    fn conditioner_inputs(&self, pass: &[f64]) -> Vec<f64> {
        match &self.blob {
            Some(b) => b.encode(pass),
            None => pass.to_vec(),
        }
    }

    /// Map points from the base towards the target side, returning the new points and `log |det J|`.
    pub fn forward(&self, points: &[Vec<f64>]) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        self.transform(points, false)
    }

    /// Map points from the target side towards the base, returning the new points and `log |det J|`.
    pub fn inverse(&self, points: &[Vec<f64>]) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        self.transform(points, true)
    }

    fn transform(&self, points: &[Vec<f64>], inverse: bool) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        self.check_dims(points)?;

        let inputs = self.conditioner_inputs(&self.pass_through_values(points));
        let raw = self.conditioner.forward(&inputs, points.len());
        let p = self.spline.num_raw_parameters();
        let stride = self.transformed.len() * p;

        Ok(points
            .par_iter()
            .zip(raw.par_chunks(stride))
            .map(|(x, r)| {
                let mut y = x.clone();
                let mut log_det = 0.;
                for (j, d) in self.transformed.iter().enumerate() {
                    let params = &r[j * p..(j + 1) * p];
                    let (v, ld) = if inverse {
                        self.spline.inverse(x[*d], params)
                    } else {
                        self.spline.forward(x[*d], params)
                    };
                    y[*d] = v;
                    log_det += ld;
                }
                (y, log_det)
            })
            .unzip())
    }

    /// Back-propagate through [CouplingLayer::inverse].
    ///
    /// Given the derivatives of a scalar with respect to the inverse outputs
    /// (`grad_outputs`) and to the inverse `log |det J|` (`grad_log_det`), add
    /// the derivatives with respect to the conditioner parameters to
    /// `grad_parameters` and return the derivatives with respect to `points`.
    pub fn inverse_gradient(
        &self,
        points: &[Vec<f64>],
        grad_outputs: &[Vec<f64>],
        grad_log_det: &[f64],
        grad_parameters: &mut [f64],
    ) -> Result<Vec<Vec<f64>>> {
        self.check_dims(points)?;
        self.check_dims(grad_outputs)?;
        if grad_outputs.len() != points.len() || grad_log_det.len() != points.len() {
            return Err(FlowError::DimensionMismatch {
                expected: points.len(),
                found: grad_outputs.len().min(grad_log_det.len()),
            });
        }
        if grad_parameters.len() != self.num_parameters() {
            return Err(FlowError::DimensionMismatch {
                expected: self.num_parameters(),
                found: grad_parameters.len(),
            });
        }

        let n = points.len();
        let pass = self.pass_through_values(points);
        let inputs = self.conditioner_inputs(&pass);
        let raw = self.conditioner.forward(&inputs, n);
        let p = self.spline.num_raw_parameters();
        let stride = self.transformed.len() * p;

        let per_sample: Vec<(Vec<f64>, Vec<f64>)> = points
            .par_iter()
            .zip(raw.par_chunks(stride))
            .zip(grad_outputs.par_iter().zip(grad_log_det.par_iter()))
            .map_init(
                || Tape::with_capacity(stride * 64),
                |tape, ((x, r), (gy, gld))| {
                    tape.clear();
                    let tape = &*tape;

                    let params: Vec<_> = r.iter().map(|v| tape.var(*v)).collect();
                    let mut inputs = Vec::with_capacity(self.transformed.len());
                    let mut total = tape.constant(0.);
                    for (j, d) in self.transformed.iter().enumerate() {
                        let xd = tape.var(x[*d]);
                        let (v, ld) = self.spline.inverse(xd, &params[j * p..(j + 1) * p]);
                        total = total + v * gy[*d] + ld * *gld;
                        inputs.push(xd);
                    }

                    let adjoints = tape.backward(total);

                    let mut grad_x = gy.clone();
                    for (d, xd) in self.transformed.iter().zip(&inputs) {
                        grad_x[*d] = adjoints[xd.index()];
                    }
                    let grad_raw = params.iter().map(|v| adjoints[v.index()]).collect();
                    (grad_x, grad_raw)
                },
            )
            .collect();

        let mut grad_raw = Vec::with_capacity(n * stride);
        let mut grad_points = Vec::with_capacity(n);
        for (gx, gr) in per_sample {
            grad_points.push(gx);
            grad_raw.extend(gr);
        }

        let grad_inputs = self
            .conditioner
            .backward(&inputs, n, &grad_raw, grad_parameters);
        let grad_pass = match &self.blob {
            Some(b) => b.backward(&pass, &grad_inputs),
            None => grad_inputs,
        };

        let k = self.pass_through.len();
        if k > 0 {
            for (g, gp) in grad_points.iter_mut().zip(grad_pass.chunks(k)) {
                for (d, v) in self.pass_through.iter().zip(gp) {
                    g[*d] += v;
                }
            }
        }

        Ok(grad_points)
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use rand::Rng;

    use super::{CouplingLayer, Mask};
    use crate::{
        conditioner::{Activation, BlobEncoding, Conditioner, DenseConfig},
        rng::MonteCarloRng,
        spline::{Spline, SplineConfig, SplineKind},
    };

    fn random_layer(kind: SplineKind, mask: Mask, blob: Option<BlobEncoding>) -> CouplingLayer {
        let dense = DenseConfig {
            hidden_layers: vec![8],
            activation: Activation::Tanh,
            zero_init_output: false,
        };
        let spline = Spline::new(SplineConfig::new(kind, 6)).unwrap();
        let mut rng = MonteCarloRng::new(11, 0);
        let factory = move |i: usize, o: usize, rng: &mut MonteCarloRng| -> Box<dyn Conditioner> {
            Box::new(dense.build(i, o, rng))
        };
        CouplingLayer::new(mask, spline, blob, &factory, &mut rng).unwrap()
    }

    #[test]
    fn masks() {
        assert_eq!(Mask::alternating(4, true), Mask::from_bits(&[1, 0, 1, 0]).unwrap());
        assert_eq!(Mask::alternating(3, false).bits(), &[false, true, false]);
        assert_eq!(Mask::split(5, true).transformed(), vec![0, 1]);
        assert_eq!(Mask::split(5, false).transformed(), vec![2, 3, 4]);
        assert_eq!(Mask::split(4, true).flip(), Mask::split(4, false));
        assert!(Mask::from_bits(&[0, 2]).is_err());

        let mut rng = MonteCarloRng::new(5, 0);
        let r = Mask::random(6, &mut rng);
        assert_eq!(r.transformed().len(), 3);
    }

    #[test]
    fn pass_through_and_round_trip() {
        let mut rng = MonteCarloRng::new(2, 0);
        let points: Vec<Vec<f64>> = (0..64).map(|_| (0..4).map(|_| rng.gen()).collect()).collect();

        for (kind, blob) in [
            (SplineKind::RationalQuadratic, None),
            (SplineKind::Quadratic, Some(BlobEncoding::new(5).unwrap())),
        ] {
            let layer = random_layer(kind, Mask::from_bits(&[1, 0, 0, 1]).unwrap(), blob);
            let (y, ld) = layer.forward(&points).unwrap();
            for (x, y) in points.iter().zip(&y) {
                assert_eq!(x[1].to_bits(), y[1].to_bits());
                assert_eq!(x[2].to_bits(), y[2].to_bits());
            }

            let (x, ld_inv) = layer.inverse(&y).unwrap();
            for ((a, b), (l1, l2)) in points.iter().zip(&x).zip(ld.iter().zip(&ld_inv)) {
                for (u, v) in a.iter().zip(b) {
                    assert!((u - v).abs() < 1e-6);
                }
                assert!((l1 + l2).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn rejects_bad_input() {
        let layer = random_layer(SplineKind::RationalQuadratic, Mask::alternating(2, true), None);
        assert!(layer.forward(&[vec![0.5, 0.5, 0.5]]).is_err());

        let spline = Spline::new(SplineConfig::default()).unwrap();
        let factory = |i: usize, o: usize, rng: &mut MonteCarloRng| -> Box<dyn Conditioner> {
            Box::new(DenseConfig::default().build(i, o, rng))
        };
        let mut rng = MonteCarloRng::new(0, 0);
        assert!(CouplingLayer::new(Mask::from_bits(&[0, 0]).unwrap(), spline, None, &factory, &mut rng).is_err());
    }

    #[test]
    fn inverse_gradient_matches_finite_difference() {
        let blob = Some(BlobEncoding::new(3).unwrap());
        for (kind, blob) in [(SplineKind::RationalQuadratic, None), (SplineKind::Quadratic, blob)] {
            let layer = random_layer(kind, Mask::from_bits(&[0, 1, 1]).unwrap(), blob);
            let points = vec![vec![0.31, 0.62, 0.08], vec![0.77, 0.45, 0.93]];
            let gy = vec![vec![0.4, -1.2, 0.7], vec![1.1, 0.3, -0.5]];
            let gld = vec![0.8, -0.6];

            let objective = |l: &CouplingLayer, pts: &[Vec<f64>]| -> f64 {
                let (x, ld) = l.inverse(pts).unwrap();
                x.iter()
                    .zip(&gy)
                    .map(|(x, g)| x.iter().zip(g).map(|(a, b)| a * b).sum::<f64>())
                    .sum::<f64>()
                    + ld.iter().zip(&gld).map(|(a, b)| a * b).sum::<f64>()
            };

            let mut grad = vec![0.; layer.num_parameters()];
            let grad_points = layer.inverse_gradient(&points, &gy, &gld, &mut grad).unwrap();

            let eps = 1e-6;
            for j in (0..layer.num_parameters()).step_by(7) {
                let mut up = layer.clone();
                up.parameters_mut()[j] += eps;
                let mut down = layer.clone();
                down.parameters_mut()[j] -= eps;
                let fd = (objective(&up, &points) - objective(&down, &points)) / (2. * eps);
                assert_relative_eq!(grad[j], fd, epsilon = 1e-5, max_relative = 1e-4);
            }

            for b in 0..points.len() {
                for d in 0..3 {
                    let mut up = points.clone();
                    up[b][d] += eps;
                    let mut down = points.clone();
                    down[b][d] -= eps;
                    let fd = (objective(&layer, &up) - objective(&layer, &down)) / (2. * eps);
                    assert_relative_eq!(grad_points[b][d], fd, epsilon = 1e-5, max_relative = 1e-4);
                }
            }
        }
    }
}
