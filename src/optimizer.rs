//! Gradient descent on the conditioner parameters.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// A learning rate that may depend on the training step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LearningRate {
    Constant(f64),
    /// Decay from `base` to `eta_min` along half a cosine period over `total_steps`,
    /// staying at `eta_min` afterwards.
    CosineAnnealing {
        base: f64,
        total_steps: usize,
        eta_min: f64,
    },
}

impl Default for LearningRate {
    fn default() -> Self {
        LearningRate::Constant(1e-3)
    }
}

impl LearningRate {
    pub fn at(&self, step: usize) -> f64 {
        match *self {
            LearningRate::Constant(lr) => lr,
            LearningRate::CosineAnnealing {
                base,
                total_steps,
                eta_min,
            } => {
                if total_steps == 0 || step >= total_steps {
                    return eta_min;
                }
                let phase = PI * step as f64 / total_steps as f64;
                eta_min + (base - eta_min) * (1. + phase.cos()) / 2.
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ok = match *self {
            LearningRate::Constant(lr) => lr > 0. && lr.is_finite(),
            LearningRate::CosineAnnealing { base, eta_min, .. } => {
                base > 0. && base.is_finite() && eta_min >= 0. && eta_min <= base
            }
        };

        if ok {
            Ok(())
        } else {
            Err(FlowError::InvalidConfiguration(format!(
                "Invalid learning rate {:?}",
                self
            )))
        }
    }
}

/// The Adam optimizer with optional clipping of the global gradient norm.
///
/// The moment estimates are stored per parameter block, matching the layers of a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adam {
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub clip_norm: Option<f64>,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
    t: u64,
}

impl Adam {
    /// Create an optimizer for parameter blocks of the given sizes.
    pub fn new(block_sizes: &[usize], clip_norm: Option<f64>) -> Adam {
        Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            clip_norm,
            m: block_sizes.iter().map(|s| vec![0.; *s]).collect(),
            v: block_sizes.iter().map(|s| vec![0.; *s]).collect(),
            t: 0,
        }
    }

    /// The number of updates performed.
    pub fn steps(&self) -> u64 {
        self.t
    }

    /// Forget the moment estimates.
    pub fn reset(&mut self) {
        for b in self.m.iter_mut().chain(self.v.iter_mut()) {
            b.iter_mut().for_each(|x| *x = 0.);
        }
        self.t = 0;
    }

    /// Update `params` with the gradient `grads`, block by block.
    /// Returns the global norm of the gradient before clipping.
    pub fn step<'a>(
        &mut self,
        params: impl Iterator<Item = &'a mut [f64]>,
        grads: &[Vec<f64>],
        learning_rate: f64,
    ) -> Result<f64> {
        if grads.len() != self.m.len() {
            return Err(FlowError::DimensionMismatch {
                expected: self.m.len(),
                found: grads.len(),
            });
        }
        for (g, m) in grads.iter().zip(&self.m) {
            if g.len() != m.len() {
                return Err(FlowError::DimensionMismatch {
                    expected: m.len(),
                    found: g.len(),
                });
            }
        }

        let norm = grads.iter().flatten().map(|g| g * g).sum::<f64>().sqrt();
        let scale = match self.clip_norm {
            Some(c) if norm > c => c / norm,
            _ => 1.,
        };

        self.t += 1;
        let b1t = 1. - self.beta1.powi(self.t as i32);
        let b2t = 1. - self.beta2.powi(self.t as i32);

        for (((p, g), m), v) in params.zip(grads).zip(&mut self.m).zip(&mut self.v) {
            for (((p, g), m), v) in p.iter_mut().zip(g).zip(m.iter_mut()).zip(v.iter_mut()) {
                let g = g * scale;
                *m = self.beta1 * *m + (1. - self.beta1) * g;
                *v = self.beta2 * *v + (1. - self.beta2) * g * g;
                let m_hat = *m / b1t;
                let v_hat = *v / b2t;
                *p -= learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }

        Ok(norm)
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use super::{Adam, LearningRate};

    #[test]
    fn cosine_annealing() {
        let lr = LearningRate::CosineAnnealing {
            base: 1e-2,
            total_steps: 100,
            eta_min: 1e-4,
        };
        assert_relative_eq!(lr.at(0), 1e-2);
        assert_relative_eq!(lr.at(50), (1e-2 + 1e-4) / 2., epsilon = 1e-15);
        assert_relative_eq!(lr.at(100), 1e-4);
        assert_relative_eq!(lr.at(1000), 1e-4);
        assert!(lr.at(30) > lr.at(31));
        assert!(lr.validate().is_ok());
        assert!(LearningRate::Constant(-1.).validate().is_err());
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        let mut adam = Adam::new(&[2, 1], None);
        let mut a = vec![1., -1.];
        let mut b = vec![0.5];
        let grads = vec![vec![3., -0.2], vec![0.7]];
        let norm = adam
            .step([a.as_mut_slice(), b.as_mut_slice()].into_iter(), &grads, 0.1)
            .unwrap();

        assert_relative_eq!(norm, (9f64 + 0.04 + 0.49).sqrt());
        // bias corrected first step is lr * sign(g)
        assert_relative_eq!(a[0], 0.9, epsilon = 1e-6);
        assert_relative_eq!(a[1], -0.9, epsilon = 1e-6);
        assert_relative_eq!(b[0], 0.4, epsilon = 1e-6);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn minimises_quadratic_with_clipping() {
        let mut adam = Adam::new(&[2], Some(1.));
        let lr = LearningRate::CosineAnnealing {
            base: 0.1,
            total_steps: 2000,
            eta_min: 1e-4,
        };
        let mut x = vec![3., -4.];
        for i in 0..2000 {
            let grads = vec![vec![2. * x[0], 8. * x[1]]];
            adam.step(std::iter::once(x.as_mut_slice()), &grads, lr.at(i)).unwrap();
        }
        assert!(x[0].abs() < 1e-2 && x[1].abs() < 1e-2);

        assert!(adam.step(std::iter::once(x.as_mut_slice()), &[vec![1.]], 0.1).is_err());
    }
}
