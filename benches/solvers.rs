use criterion::{criterion_group, criterion_main, Criterion};
use slabsol::ode::test_models::{HarmonicOscillator, StiffDecay};
use slabsol::{AdaptivityKind, OdeOptions, SolverKind, TimeStepper};

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("mono_cg1_harmonic_oscillator", |b| {
        b.iter(|| {
            let mut ode = HarmonicOscillator::new(1.0);
            let options = OdeOptions::new().tol(1e-6).num_samples(0);
            TimeStepper::solve(&mut ode, options).unwrap();
        })
    });

    c.bench_function("mono_newton_harmonic_oscillator", |b| {
        b.iter(|| {
            let mut ode = HarmonicOscillator::new(1.0);
            let options = OdeOptions::new()
                .tol(1e-6)
                .solver(SolverKind::NewtonKrylov)
                .num_samples(0);
            TimeStepper::solve(&mut ode, options).unwrap();
        })
    });

    c.bench_function("multi_cg1_stiff_decay", |b| {
        b.iter(|| {
            let mut ode = StiffDecay::new(1.0, 100.0);
            let options = OdeOptions::new()
                .tol(1e-6)
                .adaptivity(AdaptivityKind::Multi)
                .initial_step(1e-3)
                .num_samples(0);
            TimeStepper::solve(&mut ode, options).unwrap();
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
