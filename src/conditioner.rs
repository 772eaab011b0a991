//! Networks that map the pass-through coordinates of a coupling layer to
//! the raw parameters of its splines.
//!
//! Batches are stored row-major in flat slices: `inputs[b * in_features + i]`.

use std::fmt::Debug;
use std::str::FromStr;

use dyn_clone::DynClone;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{FlowError, Result},
    rng::MonteCarloRng,
};

/// A differentiable map with trainable parameters.
pub trait Conditioner: DynClone + Debug + Send + Sync {
    fn in_features(&self) -> usize;
    fn out_features(&self) -> usize;

    /// Evaluate a batch of `batch` rows of `in_features` values each.
    fn forward(&self, inputs: &[f64], batch: usize) -> Vec<f64>;

    /// Back-propagate `grad_outputs`, the derivatives of a scalar with respect to the
    /// outputs of [Conditioner::forward]. The derivatives with respect to the parameters
    /// are added to `grad_parameters` and the derivatives with respect to the inputs are returned.
    fn backward(
        &self,
        inputs: &[f64],
        batch: usize,
        grad_outputs: &[f64],
        grad_parameters: &mut [f64],
    ) -> Vec<f64>;

    /// All trainable parameters as one flat slice.
    fn parameters(&self) -> &[f64];
    fn parameters_mut(&mut self) -> &mut [f64];

    fn num_parameters(&self) -> usize {
        self.parameters().len()
    }
}
dyn_clone::clone_trait_object!(Conditioner);

/// A function that creates a conditioner with the given number of inputs and outputs.
pub trait ConditionerFactory:
    Fn(usize, usize, &mut MonteCarloRng) -> Box<dyn Conditioner> + Send + Sync
{
}
impl<T: Fn(usize, usize, &mut MonteCarloRng) -> Box<dyn Conditioner> + Send + Sync>
    ConditionerFactory for T
{
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    LeakyRelu,
    Tanh,
}

impl FromStr for Activation {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "relu" => Ok(Activation::Relu),
            "leaky_relu" | "leakyrelu" => Ok(Activation::LeakyRelu),
            "tanh" => Ok(Activation::Tanh),
            _ => Err(FlowError::UnknownKey {
                kind: "activation",
                key: s.to_owned(),
            }),
        }
    }
}

impl Activation {
    const LEAKY_SLOPE: f64 = 0.01;

    #[inline]
    fn apply(&self, z: f64) -> f64 {
        match self {
            Activation::Relu => z.max(0.),
            Activation::LeakyRelu => {
                if z > 0. {
                    z
                } else {
                    Self::LEAKY_SLOPE * z
                }
            }
            Activation::Tanh => z.tanh(),
        }
    }

    /// The derivative, given the pre-activation `z` and the activation `a`.
    #[inline]
    fn derivative(&self, z: f64, a: f64) -> f64 {
        match self {
            Activation::Relu => {
                if z > 0. {
                    1.
                } else {
                    0.
                }
            }
            Activation::LeakyRelu => {
                if z > 0. {
                    1.
                } else {
                    Self::LEAKY_SLOPE
                }
            }
            Activation::Tanh => 1. - a * a,
        }
    }
}

/// Settings of the default fully connected conditioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub hidden_layers: Vec<usize>,
    pub activation: Activation,
    /// Start with a zero output layer, so that every spline starts as the identity.
    pub zero_init_output: bool,
}

impl Default for DenseConfig {
    fn default() -> Self {
        DenseConfig {
            hidden_layers: vec![32, 32],
            activation: Activation::Relu,
            zero_init_output: true,
        }
    }
}

impl DenseConfig {
    pub fn build(&self, in_features: usize, out_features: usize, rng: &mut MonteCarloRng) -> DenseNetwork {
        DenseNetwork::new(in_features, out_features, self, rng)
    }
}

/// A multilayer perceptron with a linear output layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseNetwork {
    /// `sizes[0]` is the input size, the last entry the output size.
    sizes: Vec<usize>,
    activation: Activation,
    /// Per layer the `n_out x n_in` weight matrix followed by the bias.
    parameters: Vec<f64>,
}

impl DenseNetwork {
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &DenseConfig,
        rng: &mut MonteCarloRng,
    ) -> DenseNetwork {
        let mut sizes = Vec::with_capacity(config.hidden_layers.len() + 2);
        sizes.push(in_features);
        sizes.extend_from_slice(&config.hidden_layers);
        sizes.push(out_features);

        let num_layers = sizes.len() - 1;
        let mut parameters = Vec::new();
        for (l, s) in sizes.windows(2).enumerate() {
            let (n_in, n_out) = (s[0], s[1]);
            let is_output = l + 1 == num_layers;

            if is_output && config.zero_init_output {
                parameters.extend(std::iter::repeat(0.).take(n_in * n_out));
            } else {
                let limit = match config.activation {
                    Activation::Relu | Activation::LeakyRelu => (6. / n_in.max(1) as f64).sqrt(),
                    Activation::Tanh => (6. / (n_in + n_out).max(1) as f64).sqrt(),
                };
                parameters.extend((0..n_in * n_out).map(|_| rng.gen_range(-limit..limit)));
            }
            parameters.extend(std::iter::repeat(0.).take(n_out));
        }

        DenseNetwork {
            sizes,
            activation: config.activation,
            parameters,
        }
    }

    fn layers(&self) -> impl Iterator<Item = (usize, usize, &[f64], &[f64])> + '_ {
        let mut offset = 0;
        self.sizes.windows(2).map(move |s| {
            let (n_in, n_out) = (s[0], s[1]);
            let w = &self.parameters[offset..offset + n_in * n_out];
            let b = &self.parameters[offset + n_in * n_out..offset + n_in * n_out + n_out];
            offset += n_in * n_out + n_out;
            (n_in, n_out, w, b)
        })
    }

    /// Evaluate one row, storing the pre-activations and activations of every layer.
    /// `activations[0]` is the input itself.
    fn forward_row(&self, x: &[f64]) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let num_layers = self.sizes.len() - 1;
        let mut pre = Vec::with_capacity(num_layers);
        let mut act = Vec::with_capacity(num_layers + 1);
        act.push(x.to_vec());

        for (l, (n_in, n_out, w, b)) in self.layers().enumerate() {
            let input = &act[l];
            let z: Vec<f64> = (0..n_out)
                .map(|o| {
                    w[o * n_in..(o + 1) * n_in]
                        .iter()
                        .zip(input)
                        .fold(b[o], |acc, (wi, xi)| wi.mul_add(*xi, acc))
                })
                .collect();

            let a = if l + 1 == num_layers {
                z.clone()
            } else {
                z.iter().map(|v| self.activation.apply(*v)).collect()
            };
            pre.push(z);
            act.push(a);
        }

        (pre, act)
    }
}

impl Conditioner for DenseNetwork {
    fn in_features(&self) -> usize {
        self.sizes[0]
    }

    fn out_features(&self) -> usize {
        self.sizes[self.sizes.len() - 1]
    }

    fn forward(&self, inputs: &[f64], batch: usize) -> Vec<f64> {
        let (n_in, n_out) = (self.in_features(), self.out_features());
        debug_assert_eq!(inputs.len(), batch * n_in);

        let mut out = vec![0.; batch * n_out];
        out.par_chunks_mut(n_out.max(1))
            .enumerate()
            .for_each(|(r, o)| {
                let (_, mut act) = self.forward_row(&inputs[r * n_in..(r + 1) * n_in]);
                if let Some(last) = act.pop() {
                    o.copy_from_slice(&last);
                }
            });
        out
    }

    fn backward(
        &self,
        inputs: &[f64],
        batch: usize,
        grad_outputs: &[f64],
        grad_parameters: &mut [f64],
    ) -> Vec<f64> {
        let (n_in, n_out) = (self.in_features(), self.out_features());
        debug_assert_eq!(grad_outputs.len(), batch * n_out);
        debug_assert_eq!(grad_parameters.len(), self.parameters.len());

        // parameter offsets of every layer
        let mut offsets = Vec::with_capacity(self.sizes.len());
        let mut offset = 0;
        for s in self.sizes.windows(2) {
            offsets.push(offset);
            offset += s[0] * s[1] + s[1];
        }

        let num_layers = self.sizes.len() - 1;
        let mut grad_inputs = vec![0.; batch * n_in];
        for r in 0..batch {
            let (pre, act) = self.forward_row(&inputs[r * n_in..(r + 1) * n_in]);
            let mut delta = grad_outputs[r * n_out..(r + 1) * n_out].to_vec();

            for l in (0..num_layers).rev() {
                let (li, lo) = (self.sizes[l], self.sizes[l + 1]);
                if l + 1 != num_layers {
                    for (d, (z, a)) in delta.iter_mut().zip(pre[l].iter().zip(&act[l + 1])) {
                        *d *= self.activation.derivative(*z, *a);
                    }
                }

                let w_offset = offsets[l];
                let b_offset = w_offset + li * lo;
                let mut next = vec![0.; li];
                for (o, d) in delta.iter().enumerate() {
                    if *d == 0. {
                        continue;
                    }
                    grad_parameters[b_offset + o] += d;
                    let row = w_offset + o * li;
                    for (i, x) in act[l].iter().enumerate() {
                        grad_parameters[row + i] += d * x;
                        next[i] += d * self.parameters[row + i];
                    }
                }
                delta = next;
            }

            grad_inputs[r * n_in..(r + 1) * n_in].copy_from_slice(&delta);
        }

        grad_inputs
    }

    fn parameters(&self) -> &[f64] {
        &self.parameters
    }

    fn parameters_mut(&mut self) -> &mut [f64] {
        &mut self.parameters
    }
}

/// One-blob encoding: every input coordinate `x` is replaced by `bins` Gaussian
/// bumps `exp(-(n^2 / 2) (c_k - x)^2)` centred at `c_k = (k + 1/2) / n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobEncoding {
    pub bins: usize,
}

impl BlobEncoding {
    pub fn new(bins: usize) -> Result<BlobEncoding> {
        if bins == 0 {
            return Err(FlowError::InvalidConfiguration(
                "The blob encoding needs at least one bin".to_owned(),
            ));
        }
        Ok(BlobEncoding { bins })
    }

    pub fn encoded_len(&self, features: usize) -> usize {
        features * self.bins
    }

    #[inline]
    fn centre(&self, k: usize) -> f64 {
        (k as f64 + 0.5) / self.bins as f64
    }

    /// Encode a flat batch of values.
    pub fn encode(&self, x: &[f64]) -> Vec<f64> {
        let n2 = (self.bins * self.bins) as f64;
        x.iter()
            .flat_map(|x| (0..self.bins).map(move |k| (-0.5 * n2 * (self.centre(k) - x).powi(2)).exp()))
            .collect()
    }

    /// The derivatives with respect to `x`, given the derivatives with respect to the encoding.
    pub fn backward(&self, x: &[f64], grad_encoded: &[f64]) -> Vec<f64> {
        let n2 = (self.bins * self.bins) as f64;
        x.iter()
            .zip(grad_encoded.chunks(self.bins))
            .map(|(x, g)| {
                g.iter()
                    .enumerate()
                    .map(|(k, g)| {
                        let d = self.centre(k) - x;
                        g * (-0.5 * n2 * d * d).exp() * n2 * d
                    })
                    .sum()
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use rand::Rng;

    use super::{Activation, BlobEncoding, Conditioner, DenseConfig, DenseNetwork};
    use crate::rng::MonteCarloRng;

    /// A network with a random output layer, so that gradients are non-trivial.
    fn random_network(activation: Activation) -> DenseNetwork {
        let config = DenseConfig {
            hidden_layers: vec![5, 4],
            activation,
            zero_init_output: false,
        };
        let mut rng = MonteCarloRng::new(3, 0);
        let mut net = config.build(3, 2, &mut rng);
        for p in net.parameters_mut() {
            *p += rng.gen_range(-0.1..0.1);
        }
        net
    }

    #[test]
    fn zero_output_layer() {
        let mut rng = MonteCarloRng::new(1, 0);
        let net = DenseConfig::default().build(4, 7, &mut rng);
        assert_eq!(net.num_parameters(), 4 * 32 + 32 + 32 * 32 + 32 + 32 * 7 + 7);

        let out = net.forward(&[0.1, 0.2, 0.3, 0.4, 0.9, 0.8, 0.7, 0.6], 2);
        assert_eq!(out, vec![0.; 14]);
    }

    #[test]
    fn backward_matches_finite_difference() {
        for activation in [Activation::Tanh, Activation::LeakyRelu] {
            let net = random_network(activation);
            let inputs = [0.2, -0.4, 0.7, 0.5, 0.1, -0.3];
            let seeds = [1.0, -0.5, 0.3, 2.0];

            let loss = |n: &DenseNetwork, x: &[f64]| -> f64 {
                n.forward(x, 2).iter().zip(&seeds).map(|(o, s)| o * s).sum()
            };

            let mut grad = vec![0.; net.num_parameters()];
            let grad_inputs = net.backward(&inputs, 2, &seeds, &mut grad);

            let eps = 1e-6;
            for j in 0..net.num_parameters() {
                let mut up = net.clone();
                up.parameters_mut()[j] += eps;
                let mut down = net.clone();
                down.parameters_mut()[j] -= eps;
                let fd = (loss(&up, &inputs) - loss(&down, &inputs)) / (2. * eps);
                assert_relative_eq!(grad[j], fd, epsilon = 1e-6);
            }

            for i in 0..inputs.len() {
                let mut up = inputs;
                up[i] += eps;
                let mut down = inputs;
                down[i] -= eps;
                let fd = (loss(&net, &up) - loss(&net, &down)) / (2. * eps);
                assert_relative_eq!(grad_inputs[i], fd, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn blob_encoding() {
        let blob = BlobEncoding::new(4).unwrap();
        let enc = blob.encode(&[0.375, 0.9]);
        assert_eq!(enc.len(), 8);
        // 0.375 is the centre of the second bump
        assert_relative_eq!(enc[1], 1.);
        assert_relative_eq!(enc[0], (-0.5f64 * 16. * 0.25 * 0.25).exp());

        let x = [0.3, 0.61];
        let g = [0.5, -1., 2., 0.25, 1., 1., -0.7, 0.3];
        let grad = blob.backward(&x, &g);
        let eps = 1e-7;
        for i in 0..2 {
            let mut up = x;
            up[i] += eps;
            let mut down = x;
            down[i] -= eps;
            let f = |x: &[f64]| -> f64 { blob.encode(x).iter().zip(&g).map(|(e, g)| e * g).sum() };
            assert_relative_eq!(grad[i], (f(&up) - f(&down)) / (2. * eps), epsilon = 1e-6);
        }

        assert!(BlobEncoding::new(0).is_err());
    }

    #[test]
    fn parse_activation() {
        assert_eq!("ReLU".parse::<Activation>().unwrap(), Activation::Relu);
        assert!("swish".parse::<Activation>().is_err());
    }
}
