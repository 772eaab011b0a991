//! Reference integrands on the unit hypercube, for tests and benchmarks.
//!
//! All functions act on a single point; wrap them in
//! [Pointwise](crate::integrator::Pointwise) to integrate them.

/// `prod_i x_i`. Its integral is `2^-D`.
pub fn product(x: &[f64]) -> f64 {
    x.iter().product()
}

pub fn product_integral(dims: usize) -> f64 {
    0.5f64.powi(dims as i32)
}

/// An unnormalised Gaussian `exp(-|x - mean|^2 / width)`.
pub fn gaussian(x: &[f64], mean: f64, width: f64) -> f64 {
    let r2: f64 = x.iter().map(|x| (x - mean) * (x - mean)).sum();
    (-r2 / width).exp()
}

/// Two narrow Gaussians on the diagonal, at `(1/4, ..., 1/4)` and `(3/4, ..., 3/4)`.
pub fn camel(x: &[f64]) -> f64 {
    const WIDTH: f64 = 0.004;
    gaussian(x, 0.25, WIDTH) + gaussian(x, 0.75, WIDTH)
}

/// Two thin, overlapping half rings in two dimensions.
pub fn circle(x: &[f64]) -> f64 {
    const DX: f64 = 0.4;
    const DY: f64 = 0.6;
    const R2: f64 = 0.25 * 0.25;
    const W: f64 = 1. / 0.004;
    const POWER: f64 = 3.;

    let (u, v) = (x[0], x[1]);
    v.powf(POWER) * (-W * ((v - DY).powi(2) + (u - DX).powi(2) - R2).abs()).exp()
        + (1. - v).powf(POWER)
            * (-W * ((v - 1. + DY).powi(2) + (u - 1. + DX).powi(2) - R2).abs()).exp()
}

/// `(x^2 + y^2) / ((1 - x)(1 - y))`, cut to the rectangle `x, y < 0.9`.
/// The function peaks sharply towards the cut.
pub fn rectangle_cut(x: &[f64]) -> f64 {
    let (u, v) = (x[0], x[1]);
    if u < 0.9 && v < 0.9 {
        (u * u + v * v) / ((1. - u) * (1. - v))
    } else {
        0.
    }
}
