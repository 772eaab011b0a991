use std::sync::atomic::AtomicBool;

use flowmc::{
    flow::FlowConfig,
    functions::camel,
    integrator::{
        uniform_weights, unweighting_efficiency, Integrator, IntegratorSettings, Pointwise,
        TrainingOptions,
    },
    optimizer::LearningRate,
    rng::MonteCarloRng,
    statistics::format_uncertainty,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FLOWMC_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dims = 4;
    let epochs = 600;
    let settings = IntegratorSettings {
        learning_rate: LearningRate::CosineAnnealing {
            base: 1e-3,
            total_steps: epochs,
            eta_min: 1e-5,
        },
        seed: 42,
        ..Default::default()
    };

    let mut integrator =
        Integrator::from_config(&FlowConfig::new(dims), Pointwise(camel), settings).unwrap();

    let options = TrainingOptions {
        epochs,
        samples_per_step: 2000,
        log_every: 50,
        keep_best: true,
        target_relative_error: None,
    };
    integrator.train(&options, &AtomicBool::new(false)).unwrap();
    integrator.restore_best().unwrap();

    for _ in 0..5 {
        integrator.integrate(100_000).unwrap();
    }
    let results = integrator.results();
    println!(
        "Integral: {}, chi2/dof = {:.2}",
        results.format_uncertainty(),
        results.reduced_chi_sq()
    );

    // two Gaussians of width 0.004 per dimension, neither clipped by the boundary
    let exact = 2. * (std::f64::consts::PI * 0.004).powf(dims as f64 / 2.);
    println!("Exact:    {}", exact);

    let flow_weights = integrator.acceptance(100_000).unwrap();
    let mut rng = MonteCarloRng::new(42, 7);
    let uniform = uniform_weights(integrator.integrand_mut(), dims, 100_000, &mut rng);
    println!(
        "Unweighting efficiency: flow {:.4}, uniform {:.4}",
        unweighting_efficiency(&flow_weights),
        unweighting_efficiency(&uniform)
    );

    let (mean, var) = integrator.integrate(100_000).unwrap();
    println!("Last iteration: {}", format_uncertainty(mean, (var / 1e5).sqrt()));
}
