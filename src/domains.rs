//! Number types that the spline transforms are generic over.
//!
//! Splines are written once against the [Real](float::Real) trait and evaluated
//! either on plain `f64` or on [TapeVar](tape::TapeVar), which records the
//! operations so that derivatives with respect to the spline parameters can be
//! obtained by a reverse sweep.
pub mod float;
pub mod tape;
