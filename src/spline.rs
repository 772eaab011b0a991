//! Monotonic piecewise spline bijections of an interval.
//!
//! A [Spline] maps `[left, right]` onto `[bottom, top]` with a strictly
//! increasing function that is defined by `K` bins. The shape of the bins is
//! given by a flat slice of unconstrained parameters, usually produced by a
//! conditioner network:
//!
//! - [SplineKind::Quadratic]: `K` width logits followed by `K + 1` knot
//!   height logits (or `K - 1` when the boundary heights are fixed to 1).
//!   The density is piecewise linear, so the transform is piecewise quadratic.
//! - [SplineKind::RationalQuadratic]: `K` width logits, `K` height logits and
//!   `K + 1` knot derivative logits.
//!
//! All transforms are generic over [Real], so that the same code evaluates
//! on `f64` and records on a [Tape](crate::domains::tape::Tape) for training.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{
    domains::float::Real,
    error::{FlowError, Result},
};

/// Quadratic coefficients smaller than this are treated as zero when inverting.
const QUADRATIC_THRESHOLD: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplineKind {
    Quadratic,
    RationalQuadratic,
}

impl Display for SplineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplineKind::Quadratic => f.write_str("quadratic"),
            SplineKind::RationalQuadratic => f.write_str("rational_quadratic"),
        }
    }
}

impl FromStr for SplineKind {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "quadratic" | "piecewise_quadratic" => Ok(SplineKind::Quadratic),
            "rational_quadratic" | "rational-quadratic" | "rq" | "rqs" => {
                Ok(SplineKind::RationalQuadratic)
            }
            _ => Err(FlowError::UnknownKey {
                kind: "spline kind",
                key: s.to_owned(),
            }),
        }
    }
}

/// Settings of a spline transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplineConfig {
    pub kind: SplineKind,
    pub num_bins: usize,
    pub min_bin_width: f64,
    pub min_bin_height: f64,
    /// Only used by [SplineKind::RationalQuadratic].
    pub min_derivative: f64,
    /// Input interval `(left, right)`.
    pub domain: (f64, f64),
    /// Output interval `(bottom, top)`.
    pub range: (f64, f64),
    /// Fix the first and last knot heights of a quadratic spline to exactly 1,
    /// so that the density is continuous across the boundary of the unit cell.
    pub boundary_constrained: bool,
}

impl Default for SplineConfig {
    fn default() -> Self {
        SplineConfig {
            kind: SplineKind::RationalQuadratic,
            num_bins: 16,
            min_bin_width: 1e-3,
            min_bin_height: 1e-3,
            min_derivative: 1e-3,
            domain: (0., 1.),
            range: (0., 1.),
            boundary_constrained: false,
        }
    }
}

impl SplineConfig {
    pub fn new(kind: SplineKind, num_bins: usize) -> SplineConfig {
        SplineConfig {
            kind,
            num_bins,
            ..Default::default()
        }
    }

    /// Check that the configuration describes a valid bijection.
    pub fn validate(&self) -> Result<()> {
        let k = self.num_bins;
        if k == 0 {
            return Err(FlowError::InvalidConfiguration(
                "A spline needs at least one bin".to_owned(),
            ));
        }

        if self.boundary_constrained {
            if self.kind != SplineKind::Quadratic {
                return Err(FlowError::InvalidConfiguration(
                    "Boundary constraints are only supported for quadratic splines".to_owned(),
                ));
            }
            if k < 2 {
                return Err(FlowError::InvalidConfiguration(
                    "A boundary constrained spline needs at least two bins".to_owned(),
                ));
            }
        }

        if !(self.min_bin_width >= 0.) || self.min_bin_width * k as f64 > 1. {
            return Err(FlowError::InvalidConfiguration(format!(
                "Minimal bin width {} too large for {} bins",
                self.min_bin_width, k
            )));
        }

        if !(self.min_bin_height >= 0.) || self.min_bin_height * k as f64 > 1. {
            return Err(FlowError::InvalidConfiguration(format!(
                "Minimal bin height {} too large for {} bins",
                self.min_bin_height, k
            )));
        }

        if !(0. ..1.).contains(&self.min_derivative) {
            return Err(FlowError::InvalidConfiguration(format!(
                "Minimal derivative {} must lie in [0, 1)",
                self.min_derivative
            )));
        }

        for (name, (lo, hi)) in [("domain", self.domain), ("range", self.range)] {
            if !lo.is_finite() || !hi.is_finite() || lo >= hi {
                return Err(FlowError::InvalidConfiguration(format!(
                    "Spline {} ({}, {}) is not a proper interval",
                    name, lo, hi
                )));
            }
        }

        Ok(())
    }

    /// The number of unconstrained parameters that define one spline.
    pub fn num_raw_parameters(&self) -> usize {
        let k = self.num_bins;
        match self.kind {
            SplineKind::Quadratic if self.boundary_constrained => 2 * k - 1,
            SplineKind::Quadratic => 2 * k + 1,
            SplineKind::RationalQuadratic => 3 * k + 1,
        }
    }
}

/// The normalised knots of a spline on the unit square.
///
/// For a quadratic spline `heights` are the `K + 1` density values at the knots and
/// `cumheights` the cumulative distribution at the knots. For a rational-quadratic
/// spline `heights` are the `K` bin heights and `derivatives` the `K + 1` knot slopes.
#[derive(Debug, Clone)]
pub struct KnotTable<T> {
    pub widths: SmallVec<[T; 32]>,
    pub cumwidths: SmallVec<[T; 32]>,
    pub heights: SmallVec<[T; 32]>,
    pub cumheights: SmallVec<[T; 32]>,
    pub derivatives: SmallVec<[T; 32]>,
}

/// A monotonic spline bijection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spline {
    config: SplineConfig,
}

impl Spline {
    pub fn new(config: SplineConfig) -> Result<Spline> {
        config.validate()?;
        Ok(Spline { config })
    }

    pub fn config(&self) -> &SplineConfig {
        &self.config
    }

    pub fn num_raw_parameters(&self) -> usize {
        self.config.num_raw_parameters()
    }

    /// Map `x` from the domain to the range, returning the output and `log |dy/dx|`.
    /// Inputs outside of the domain are clamped.
    pub fn forward<T: Real>(&self, x: T, raw: &[T]) -> (T, T) {
        self.transform(x, raw, false)
    }

    /// Map `y` from the range back to the domain, returning the output and `log |dx/dy|`.
    /// Inputs outside of the range are clamped.
    pub fn inverse<T: Real>(&self, y: T, raw: &[T]) -> (T, T) {
        self.transform(y, raw, true)
    }

    fn transform<T: Real>(&self, v: T, raw: &[T], inverse: bool) -> (T, T) {
        assert_eq!(
            raw.len(),
            self.num_raw_parameters(),
            "Wrong number of spline parameters"
        );

        let ((left, right), (bottom, top)) = (self.config.domain, self.config.range);
        let (lo, hi) = if inverse { (bottom, top) } else { (left, right) };
        let unit = (v.clamp_to(lo, hi) - lo) / (hi - lo);

        let knots = self.knots(raw);
        let (out, logdet) = match (self.config.kind, inverse) {
            (SplineKind::Quadratic, false) => quadratic_forward(unit, &knots),
            (SplineKind::Quadratic, true) => quadratic_inverse(unit, &knots),
            (SplineKind::RationalQuadratic, false) => rational_quadratic_forward(unit, &knots),
            (SplineKind::RationalQuadratic, true) => rational_quadratic_inverse(unit, &knots),
        };

        let out = out.clamp_to(0., 1.);
        let scale = (top - bottom) / (right - left);
        if inverse {
            (out * (right - left) + left, logdet - scale.ln())
        } else {
            (out * (top - bottom) + bottom, logdet + scale.ln())
        }
    }

    /// Normalise the raw parameters into the knots of the spline on the unit square.
    pub fn knots<T: Real>(&self, raw: &[T]) -> KnotTable<T> {
        let k = self.config.num_bins;
        let (raw_widths, rest) = raw.split_at(k);

        let mut widths = softmax(raw_widths);
        blend(&mut widths, self.config.min_bin_width, k);
        let cumwidths = cumulative(&widths);
        for (w, c) in widths.iter_mut().zip(cumwidths.windows(2)) {
            *w = c[1] - c[0];
        }

        match self.config.kind {
            SplineKind::Quadratic => {
                let heights = self.quadratic_heights(rest, &widths);

                let zero = raw[0].zero();
                let mut cumheights = SmallVec::with_capacity(k + 1);
                cumheights.push(zero);
                let mut acc = zero;
                for (w, h) in widths.iter().zip(heights.windows(2)) {
                    acc = acc + (h[0] + h[1]) * *w * 0.5;
                    cumheights.push(acc);
                }

                KnotTable {
                    widths,
                    cumwidths,
                    heights,
                    cumheights,
                    derivatives: SmallVec::new(),
                }
            }
            SplineKind::RationalQuadratic => {
                let (raw_heights, raw_derivatives) = rest.split_at(k);
                let mut heights = softmax(raw_heights);
                blend(&mut heights, self.config.min_bin_height, k);
                let cumheights = cumulative(&heights);
                for (h, c) in heights.iter_mut().zip(cumheights.windows(2)) {
                    *h = c[1] - c[0];
                }

                let min_d = self.config.min_derivative;
                let derivatives = raw_derivatives
                    .iter()
                    .map(|u| u.softplus() * ((1. - min_d) / std::f64::consts::LN_2) + min_d)
                    .collect();

                KnotTable {
                    widths,
                    cumwidths,
                    heights,
                    cumheights,
                    derivatives,
                }
            }
        }
    }

    /// Knot heights of the piecewise linear density, normalised to unit area.
    fn quadratic_heights<T: Real>(&self, raw_heights: &[T], widths: &[T]) -> SmallVec<[T; 32]> {
        let k = widths.len();
        // the heights are normalised by the area below, so the shift cancels
        let max = raw_heights
            .iter()
            .map(|v| v.to_f64())
            .fold(f64::NEG_INFINITY, f64::max);
        let mut h: SmallVec<[T; 32]> = raw_heights.iter().map(|x| (*x - max).exp()).collect();

        if self.config.boundary_constrained {
            // Trapezoid area without the two boundary heights. Choosing the boundary
            // height `c` equal to the total area makes it exactly 1 after normalisation.
            let mut rest = h[0] * widths[0] * 0.5 + h[k - 2] * widths[k - 1] * 0.5;
            for (w, p) in widths[1..k - 1].iter().zip(h.windows(2)) {
                rest = rest + (p[0] + p[1]) * *w * 0.5;
            }
            let c = rest / (-(widths[0] + widths[k - 1]) * 0.5 + 1.);
            h.insert(0, c);
            h.push(c);
        }

        let mut area = raw_heights[0].zero();
        for (w, p) in widths.iter().zip(h.windows(2)) {
            area = area + (p[0] + p[1]) * *w * 0.5;
        }

        let min_h = self.config.min_bin_height;
        for x in &mut h {
            *x = *x / area * (1. - min_h) + min_h;
        }
        h
    }
}

fn softmax<T: Real>(x: &[T]) -> SmallVec<[T; 32]> {
    let max = x
        .iter()
        .map(|v| v.to_f64())
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: SmallVec<[T; 32]> = x.iter().map(|v| (*v - max).exp()).collect();
    let mut sum = exps[0];
    for e in &exps[1..] {
        sum = sum + *e;
    }
    exps.into_iter().map(|e| e / sum).collect()
}

/// Apply `min + (1 - k min) x` to every entry.
fn blend<T: Real>(x: &mut [T], min: f64, k: usize) {
    let scale = 1. - min * k as f64;
    for v in x {
        *v = *v * scale + min;
    }
}

/// Knot positions from bin sizes. The first knot is exactly 0 and the last exactly 1.
fn cumulative<T: Real>(sizes: &[T]) -> SmallVec<[T; 32]> {
    let mut out = SmallVec::with_capacity(sizes.len() + 1);
    out.push(sizes[0].zero());
    let mut acc = sizes[0].zero();
    for s in &sizes[..sizes.len() - 1] {
        acc = acc + *s;
        out.push(acc);
    }
    out.push(sizes[0].one());
    out
}

/// The bin of `v` given the `K + 1` knots.
fn search<T: Real>(knots: &[T], v: f64) -> usize {
    knots[1..knots.len() - 1].partition_point(|k| k.to_f64() <= v)
}

fn quadratic_forward<T: Real>(x: T, knots: &KnotTable<T>) -> (T, T) {
    let bin = search(&knots.cumwidths, x.to_f64());
    let w = knots.widths[bin];
    let (hl, hr) = (knots.heights[bin], knots.heights[bin + 1]);

    let alpha = (x - knots.cumwidths[bin]) / w;
    let a = (hr - hl) * w * 0.5;
    let b = hl * w;
    let c = knots.cumheights[bin];

    let y = (a * alpha + b) * alpha + c;
    let density = (hr - hl) * alpha + hl;
    (y, density.log())
}

fn quadratic_inverse<T: Real>(y: T, knots: &KnotTable<T>) -> (T, T) {
    let bin = search(&knots.cumheights, y.to_f64());
    let w = knots.widths[bin];
    let (hl, hr) = (knots.heights[bin], knots.heights[bin + 1]);

    let a = (hr - hl) * w * 0.5;
    let b = hl * w;
    let dy = y - knots.cumheights[bin];

    let alpha = if a.to_f64().abs() < QUADRATIC_THRESHOLD {
        dy / b
    } else {
        let disc = b * b + a * dy * 4.;
        let disc = if disc.to_f64() < 0. { disc.zero() } else { disc };
        // root of a x^2 + b x - dy that avoids cancellation
        dy * 2. / (b + disc.sqrt())
    };
    let alpha = alpha.clamp_to(0., 1.);

    let x = alpha * w + knots.cumwidths[bin];
    let density = (hr - hl) * alpha + hl;
    (x, -density.log())
}

fn rational_quadratic_forward<T: Real>(x: T, knots: &KnotTable<T>) -> (T, T) {
    let bin = search(&knots.cumwidths, x.to_f64());
    let (w, h) = (knots.widths[bin], knots.heights[bin]);
    let (d0, d1) = (knots.derivatives[bin], knots.derivatives[bin + 1]);
    let s = h / w;

    let theta = (x - knots.cumwidths[bin]) / w;
    let tt = theta * (-theta + 1.);
    let numerator = h * (s * theta * theta + d0 * tt);
    let denominator = s + (d0 + d1 - s * 2.) * tt;
    let y = knots.cumheights[bin] + numerator / denominator;

    (y, rational_quadratic_log_slope(theta, s, d0, d1, denominator))
}

fn rational_quadratic_inverse<T: Real>(y: T, knots: &KnotTable<T>) -> (T, T) {
    let bin = search(&knots.cumheights, y.to_f64());
    let (w, h) = (knots.widths[bin], knots.heights[bin]);
    let (d0, d1) = (knots.derivatives[bin], knots.derivatives[bin + 1]);
    let s = h / w;

    let dy = y - knots.cumheights[bin];
    let curvature = d0 + d1 - s * 2.;
    let a = h * (s - d0) + dy * curvature;
    let b = h * d0 - dy * curvature;
    let c = -s * dy;

    let disc = b * b - a * c * 4.;
    let disc = if disc.to_f64() < 0. { disc.zero() } else { disc };
    let theta = (c * 2. / (-b - disc.sqrt())).clamp_to(0., 1.);

    let x = theta * w + knots.cumwidths[bin];
    let tt = theta * (-theta + 1.);
    let denominator = s + curvature * tt;
    (x, -rational_quadratic_log_slope(theta, s, d0, d1, denominator))
}

fn rational_quadratic_log_slope<T: Real>(theta: T, s: T, d0: T, d1: T, denominator: T) -> T {
    let one_minus = -theta + 1.;
    let numerator = s * s * (d1 * theta * theta + s * theta * one_minus * 2. + d0 * one_minus * one_minus);
    numerator.log() - denominator.log() * 2.
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use rand::Rng;

    use super::{Spline, SplineConfig, SplineKind};
    use crate::{domains::tape::Tape, error::FlowError, rng::MonteCarloRng};

    fn random_parameters(spline: &Spline, seed: u64) -> Vec<f64> {
        let mut rng = MonteCarloRng::new(seed, 0);
        (0..spline.num_raw_parameters())
            .map(|_| rng.gen_range(-2.5..2.5))
            .collect()
    }

    fn configs() -> Vec<SplineConfig> {
        vec![
            SplineConfig::new(SplineKind::Quadratic, 8),
            SplineConfig {
                boundary_constrained: true,
                ..SplineConfig::new(SplineKind::Quadratic, 6)
            },
            SplineConfig::new(SplineKind::RationalQuadratic, 8),
            SplineConfig {
                domain: (-2., 3.),
                range: (1., 1.5),
                ..SplineConfig::new(SplineKind::RationalQuadratic, 5)
            },
        ]
    }

    #[test]
    fn round_trip() {
        for (i, config) in configs().into_iter().enumerate() {
            let spline = Spline::new(config.clone()).unwrap();
            let raw = random_parameters(&spline, i as u64);
            let (left, right) = config.domain;

            let (bottom, top) = config.range;

            for j in 0..=200 {
                let x = left + (right - left) * j as f64 / 200.;
                let (y, ld) = spline.forward(x, &raw);
                let (x2, ld_inv) = spline.inverse(y, &raw);
                assert!((x - x2).abs() < 1e-6, "{}: {} != {}", config.kind, x, x2);
                assert!((ld + ld_inv).abs() < 1e-6);

                let y = bottom + (top - bottom) * j as f64 / 200.;
                let (x, ld_inv) = spline.inverse(y, &raw);
                let (y2, ld) = spline.forward(x, &raw);
                assert!((y - y2).abs() < 1e-6, "{}: {} != {}", config.kind, y, y2);
                assert!((ld + ld_inv).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn jacobian_matches_finite_difference() {
        for (i, config) in configs().into_iter().enumerate() {
            let spline = Spline::new(config.clone()).unwrap();
            let raw = random_parameters(&spline, 10 + i as u64);
            let (left, right) = config.domain;
            let eps = 1e-7 * (right - left);

            for j in 1..50 {
                let x = left + (right - left) * (j as f64 + 0.37) / 50.;
                let (_, ld) = spline.forward(x, &raw);
                let slope =
                    (spline.forward(x + eps, &raw).0 - spline.forward(x - eps, &raw).0) / (2. * eps);
                assert_relative_eq!(ld.exp(), slope, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn monotonic_and_onto() {
        for (i, config) in configs().into_iter().enumerate() {
            let spline = Spline::new(config.clone()).unwrap();
            let raw = random_parameters(&spline, 20 + i as u64);
            let (left, right) = config.domain;
            let (bottom, top) = config.range;

            let mut prev = f64::NEG_INFINITY;
            for j in 0..=500 {
                let (y, _) = spline.forward(left + (right - left) * j as f64 / 500., &raw);
                assert!(y > prev);
                prev = y;
            }
            assert_relative_eq!(spline.forward(left, &raw).0, bottom, epsilon = 1e-12);
            assert_relative_eq!(spline.forward(right, &raw).0, top, epsilon = 1e-9);
        }
    }

    #[test]
    fn clamps_out_of_domain_inputs() {
        let spline = Spline::new(SplineConfig::new(SplineKind::RationalQuadratic, 4)).unwrap();
        let raw = random_parameters(&spline, 3);
        assert_eq!(spline.forward(-0.5, &raw).0, spline.forward(0., &raw).0);
        assert_eq!(spline.forward(1.5, &raw).0, spline.forward(1., &raw).0);
        assert_eq!(spline.inverse(2., &raw).0, spline.inverse(1., &raw).0);
    }

    #[test]
    fn identity_at_zero_parameters() {
        for kind in [SplineKind::Quadratic, SplineKind::RationalQuadratic] {
            let spline = Spline::new(SplineConfig::new(kind, 7)).unwrap();
            let raw = vec![0.; spline.num_raw_parameters()];
            for x in [0., 0.13, 0.5, 0.77, 1.] {
                let (y, ld) = spline.forward(x, &raw);
                assert_relative_eq!(y, x, epsilon = 1e-12);
                assert_relative_eq!(ld, 0., epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn boundary_heights_are_one() {
        let config = SplineConfig {
            boundary_constrained: true,
            ..SplineConfig::new(SplineKind::Quadratic, 5)
        };
        let spline = Spline::new(config).unwrap();
        assert_eq!(spline.num_raw_parameters(), 9);

        let raw = random_parameters(&spline, 99);
        let knots = spline.knots(&raw);
        assert_eq!(knots.heights.len(), 6);
        assert_relative_eq!(knots.heights[0], 1., epsilon = 1e-12);
        assert_relative_eq!(knots.heights[5], 1., epsilon = 1e-12);
        assert_relative_eq!(knots.cumheights[5], 1., epsilon = 1e-12);

        // the density at both ends is one
        assert_relative_eq!(spline.forward(0., &raw).1, 0., epsilon = 1e-9);
        assert_relative_eq!(spline.forward(1., &raw).1, 0., epsilon = 1e-9);
    }

    #[test]
    fn large_quadratic_height_logits() {
        for boundary_constrained in [false, true] {
            let config = SplineConfig {
                boundary_constrained,
                ..SplineConfig::new(SplineKind::Quadratic, 4)
            };
            let spline = Spline::new(config).unwrap();
            let mut raw = vec![0.; spline.num_raw_parameters()];
            raw[5] = 720.;
            raw[6] = 1e3;

            let knots = spline.knots(&raw);
            assert!(knots.heights.iter().all(|h| h.is_finite() && *h > 0.));
            assert_relative_eq!(knots.cumheights[4], 1., epsilon = 1e-12);

            for x in [0., 0.3, 0.55, 1.] {
                let (y, ld) = spline.forward(x, &raw);
                assert!(y.is_finite() && ld.is_finite());
                assert!((0. ..=1.).contains(&y));

                let (x2, ld_inv) = spline.inverse(y, &raw);
                assert!((x - x2).abs() < 1e-6);
                assert!((ld + ld_inv).abs() < 1e-6);
            }

            let (x, ld) = spline.inverse(0.3, &raw);
            assert!(x.is_finite() && ld.is_finite());
        }
    }

    #[test]
    fn invalid_configurations() {
        let too_wide = SplineConfig {
            min_bin_width: 0.1,
            ..SplineConfig::new(SplineKind::Quadratic, 16)
        };
        assert!(matches!(
            Spline::new(too_wide),
            Err(FlowError::InvalidConfiguration(_))
        ));

        let too_high = SplineConfig {
            min_bin_height: 0.5,
            ..SplineConfig::new(SplineKind::RationalQuadratic, 3)
        };
        assert!(Spline::new(too_high).is_err());

        let reversed = SplineConfig {
            range: (1., 0.),
            ..Default::default()
        };
        assert!(Spline::new(reversed).is_err());

        assert!(Spline::new(SplineConfig::new(SplineKind::Quadratic, 0)).is_err());
        assert!(Spline::new(SplineConfig {
            boundary_constrained: true,
            ..SplineConfig::new(SplineKind::RationalQuadratic, 4)
        })
        .is_err());
    }

    #[test]
    fn parse_kind() {
        assert_eq!("quadratic".parse::<SplineKind>().unwrap(), SplineKind::Quadratic);
        assert_eq!("RQ".parse::<SplineKind>().unwrap(), SplineKind::RationalQuadratic);
        assert_eq!(
            SplineKind::RationalQuadratic.to_string().parse::<SplineKind>().unwrap(),
            SplineKind::RationalQuadratic
        );
        match "cubic".parse::<SplineKind>() {
            Err(FlowError::UnknownKey { key, .. }) => assert_eq!(key, "cubic"),
            _ => panic!("Expected an unknown key error"),
        }
    }

    #[test]
    fn parameter_gradients_on_tape() {
        for (i, config) in configs().into_iter().enumerate() {
            let spline = Spline::new(config.clone()).unwrap();
            let raw = random_parameters(&spline, 40 + i as u64);
            let (bottom, top) = config.range;
            let y = bottom + 0.63 * (top - bottom);

            // d/draw of x + log|dx/dy| for the inverse
            let tape = Tape::new();
            let vars: Vec<_> = raw.iter().map(|r| tape.var(*r)).collect();
            let (x, ld) = spline.inverse(tape.constant(y), &vars);
            let adj = tape.backward(x + ld);

            let eps = 1e-6;
            for j in 0..raw.len() {
                let mut up = raw.clone();
                up[j] += eps;
                let mut down = raw.clone();
                down[j] -= eps;
                let f = |r: &[f64]| {
                    let (x, ld) = spline.inverse(y, r);
                    x + ld
                };
                let fd = (f(&up) - f(&down)) / (2. * eps);
                assert!(
                    (adj[vars[j].index()] - fd).abs() < 1e-5 * (1. + fd.abs()),
                    "{} parameter {}: {} vs {}",
                    config.kind,
                    j,
                    adj[vars[j].index()],
                    fd
                );
            }
        }
    }
}
