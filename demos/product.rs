use std::sync::atomic::AtomicBool;

use flowmc::{
    flow::FlowConfig,
    functions::{product, product_integral},
    integrator::{Integrator, IntegratorSettings, LossMode, Pointwise, TrainingOptions},
    optimizer::LearningRate,
    spline::{SplineConfig, SplineKind},
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FLOWMC_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dims = 3;
    let config = FlowConfig {
        spline: SplineConfig::new(SplineKind::Quadratic, 8),
        ..FlowConfig::new(dims)
    };
    let settings = IntegratorSettings {
        loss: LossMode::ChiSquared,
        learning_rate: LearningRate::CosineAnnealing {
            base: 5e-3,
            total_steps: 300,
            eta_min: 1e-5,
        },
        ..Default::default()
    };

    let mut integrator = Integrator::from_config(&config, Pointwise(product), settings).unwrap();

    let options = TrainingOptions {
        epochs: 300,
        samples_per_step: 1000,
        log_every: 50,
        ..Default::default()
    };
    integrator.train(&options, &AtomicBool::new(false)).unwrap();

    let path = std::env::temp_dir().join("flowmc_product.bin");
    integrator.save_to_file(&path).unwrap();

    // a fresh integrator picks up the trained parameters
    let mut restored = Integrator::from_config(
        &config,
        Pointwise(product),
        IntegratorSettings {
            seed: 1,
            ..Default::default()
        },
    )
    .unwrap();
    restored.load_from_file(&path).unwrap();

    for _ in 0..3 {
        restored.integrate(50_000).unwrap();
    }
    println!(
        "Integral: {}, exact {}",
        restored.results().format_uncertainty(),
        product_integral(dims)
    );
}
