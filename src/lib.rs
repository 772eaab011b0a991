//! flowmc performs adaptive Monte Carlo integration over the unit hypercube
//! with normalizing flows.
//!
//! A [Flow](flow::Flow) is a chain of [coupling layers](coupling::CouplingLayer)
//! that each transform part of the coordinates with monotonic
//! [splines](spline::Spline), whose shape is predicted by a small neural network
//! from the remaining coordinates. The [Integrator](integrator::Integrator)
//! trains the flow to resemble the integrand and then uses it for importance
//! sampling.
//!
//! For example:
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//!
//! use flowmc::{
//!     flow::FlowConfig,
//!     functions::camel,
//!     integrator::{Integrator, IntegratorSettings, Pointwise, TrainingOptions},
//!     optimizer::LearningRate,
//!     statistics::format_uncertainty,
//! };
//!
//! fn main() -> flowmc::error::Result<()> {
//!     let settings = IntegratorSettings {
//!         learning_rate: LearningRate::CosineAnnealing {
//!             base: 1e-3,
//!             total_steps: 500,
//!             eta_min: 1e-5,
//!         },
//!         ..Default::default()
//!     };
//!
//!     let mut integrator = Integrator::from_config(&FlowConfig::new(4), Pointwise(camel), settings)?;
//!     integrator.train(&TrainingOptions::default(), &AtomicBool::new(false))?;
//!
//!     let n = 100_000;
//!     let (mean, variance) = integrator.integrate(n)?;
//!     println!("{}", format_uncertainty(mean, (variance / n as f64).sqrt()));
//!     Ok(())
//! }
//! ```

pub mod conditioner;
pub mod coupling;
pub mod domains;
pub mod error;
pub mod flow;
pub mod functions;
pub mod integrator;
pub mod optimizer;
pub mod rng;
pub mod spline;
pub mod statistics;
