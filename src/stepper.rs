use nalgebra::DVector;
use tracing::{debug, info, warn};

use crate::error::{OdeSolverError, SlabsolError};
use crate::ode::{AdaptivityKind, OdeOptions, OdeSystem, Sample, SolverKind, SolverStatistics};
use crate::timeslab::{PreviousState, TimeSlab};
use crate::{Dependencies, Scalar};

/// Drives the time slab over the whole horizon: build, solve, check, then
/// commit and sample on success or shrink and retry on failure. Owns the
/// single live slab and the committed previous state; recoverable failures
/// (no convergence, accuracy rejection) never escape [TimeStepper::step] —
/// only a bounded number of retries converts them into a hard error.
pub struct TimeStepper<'a, T: Scalar, O: OdeSystem<T>> {
    ode: &'a mut O,
    options: OdeOptions<T>,
    timeslab: TimeSlab<T>,
    state: PreviousState<T>,
    t: T,
    end_time: T,
    first: bool,
    stopped: bool,
    finished: bool,
    next_sample: T,
    sample_spacing: T,
    last_sample: Option<T>,
    statistics: SolverStatistics,
}

impl<'a, T: Scalar, O: OdeSystem<T>> TimeStepper<'a, T, O> {
    pub fn new(ode: &'a mut O, options: OdeOptions<T>) -> Result<Self, SlabsolError> {
        if options.k_max <= T::zero() || options.k_max < options.k_min {
            return Err(SlabsolError::from(OdeSolverError::InvalidStepBounds));
        }
        // The implicit form is only handled by the mono-adaptive Newton
        // solver
        if ode.has_mass()
            && (options.solver == SolverKind::FixedPoint
                || options.adaptivity == AdaptivityKind::Multi)
        {
            return Err(SlabsolError::from(OdeSolverError::MassRequiresNewton));
        }

        let mut dependencies = Dependencies::new(ode.size());
        ode.sparsity(&mut dependencies);
        if options.detect_sparsity && !dependencies.sparse() {
            dependencies.detect(&*ode, options.sparsity_check_increment);
        }

        let state = PreviousState::new(&*ode);
        let timeslab = TimeSlab::new(&*ode, options.clone(), dependencies)?;
        let end_time = ode.endtime();

        let sample_spacing = if options.num_samples > 0 {
            end_time / T::from_usize(options.num_samples).unwrap()
        } else {
            end_time + end_time
        };

        let mut stepper = Self {
            ode,
            options,
            timeslab,
            state,
            t: T::zero(),
            end_time,
            first: true,
            stopped: false,
            finished: end_time <= T::zero(),
            next_sample: sample_spacing,
            sample_spacing,
            last_sample: None,
            statistics: SolverStatistics::new(),
        };

        // Initial update hook and sample at t = 0
        if !stepper.ode.update(&stepper.state.u, T::zero(), false) {
            stepper.stopped = true;
        }
        stepper.save_initial_sample();

        Ok(stepper)
    }

    /// Solve the ODE over [0, T], forwarding every accepted sample to the
    /// problem's `save` hook. Stops early if the `update` hook requests it.
    pub fn solve(ode: &'a mut O, options: OdeOptions<T>) -> Result<SolverStatistics, SlabsolError> {
        let mut stepper = Self::new(ode, options)?;
        while !stepper.finished() {
            stepper.step()?;
        }
        info!(
            "ODE solver finished at t = {}: {} time slabs, {} rejections.",
            stepper.t.as_f64(),
            stepper.statistics.number_of_timeslabs,
            stepper.statistics.number_of_rejections
        );
        Ok(stepper.statistics)
    }

    /// Advance the solution by one accepted time slab; returns the new
    /// current time.
    pub fn step(&mut self) -> Result<T, SlabsolError> {
        if self.finished() {
            return Ok(self.t);
        }

        let mut rejections = 0;
        loop {
            let b = self
                .timeslab
                .build(&self.state, self.t, self.end_time, &*self.ode)?;

            match self.timeslab.solve(&*self.ode) {
                Ok(iterations) => {
                    self.statistics.number_of_iterations += iterations;
                    if self.timeslab.check(&*self.ode, self.first)? {
                        return self.accept(b);
                    }
                    debug!(
                        "Rejecting time slab [{}, {}]: accuracy test failed.",
                        self.t.as_f64(),
                        b.as_f64()
                    );
                    rejections += 1;
                    self.reject(rejections)?;
                }
                Err(err) if Self::recoverable(&err) => {
                    warn!(
                        "Rejecting time slab [{}, {}]: {}.",
                        self.t.as_f64(),
                        b.as_f64(),
                        err
                    );
                    // the accuracy controller has not seen this slab; force
                    // the step down before rebuilding
                    self.timeslab.shrink(T::from(0.5));
                    rejections += 1;
                    self.reject(rejections)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// True once the horizon is reached or termination was requested.
    pub fn finished(&self) -> bool {
        self.finished || self.stopped
    }

    /// True if the problem's `update` hook requested termination.
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// The committed solution state at the current time.
    pub fn state(&self) -> &PreviousState<T> {
        &self.state
    }

    pub fn statistics(&self) -> &SolverStatistics {
        &self.statistics
    }

    fn accept(&mut self, b: T) -> Result<T, SlabsolError> {
        let eps = T::from(100.0) * T::EPSILON * self.end_time.max(T::one());
        let at_end = b >= self.end_time - eps;

        self.emit_samples(b, at_end);

        let proceed = self.timeslab.shift(&mut self.state, self.ode, at_end)?;
        self.statistics.number_of_timeslabs += 1;
        self.first = false;
        self.t = b;
        if at_end {
            self.finished = true;
        }
        if !proceed {
            info!("ODE solver stopped at t = {} on request.", self.t.as_f64());
            self.stopped = true;
        }
        Ok(self.t)
    }

    fn reject(&mut self, rejections: usize) -> Result<(), SlabsolError> {
        self.statistics.number_of_rejections += 1;
        if rejections > self.options.max_rejections
            || (self.timeslab.at_minimum() && rejections > 1)
        {
            return Err(SlabsolError::from(OdeSolverError::StepSizeUnderflow {
                t: self.t.as_f64(),
                rejections,
            }));
        }
        Ok(())
    }

    // Convergence-class failures are retried with a smaller step; anything
    // else (stale operators, invalid states) is a programming error and
    // aborts the run.
    fn recoverable(err: &SlabsolError) -> bool {
        matches!(
            err,
            SlabsolError::NonLinearSolverError(_) | SlabsolError::LinearSolverError(_)
        )
    }

    // Deliver interpolated samples on the uniform grid inside (t, b], in
    // strictly increasing time order, always including the horizon.
    fn emit_samples(&mut self, b: T, at_end: bool) {
        let eps = T::from(100.0) * T::EPSILON * self.end_time.max(T::one());
        while self.sample_spacing > T::zero() && self.next_sample <= b + eps {
            let t = self.next_sample.min(b);
            self.save_sample(t, eps);
            self.next_sample += self.sample_spacing;
        }
        if at_end {
            self.save_sample(b, eps);
        }
    }

    fn save_sample(&mut self, t: T, eps: T) {
        if let Some(last) = self.last_sample {
            if t <= last + eps {
                return;
            }
        }
        let sample = self.timeslab.sample(&*self.ode, t);
        self.ode.save(&sample);
        self.last_sample = Some(t);
    }

    fn save_initial_sample(&mut self) {
        let n = self.ode.size();
        let k = match self.options.adaptivity {
            AdaptivityKind::Mono => {
                let k0 = self
                    .ode
                    .timestep(T::zero(), self.options.initial_step)
                    .max(self.options.k_min)
                    .min(self.options.k_max);
                DVector::from_element(n, k0)
            }
            AdaptivityKind::Multi => DVector::from_fn(n, |i, _| {
                self.ode
                    .timestep_component(T::zero(), i, self.options.initial_step)
                    .max(self.options.k_min)
                    .min(self.options.k_max)
            }),
        };
        let sample = Sample::new(T::zero(), self.state.u.clone(), k, DVector::zeros(n));
        self.ode.save(&sample);
        self.last_sample = Some(T::zero());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::MethodKind;
    use crate::ode::test_models::{ExponentialDecay, HarmonicOscillator, MassDecay, StiffDecay};
    use crate::ode::{AdaptivityKind, SolverKind};
    use crate::IndexType;

    // Wrap a problem to record the delivered samples
    struct Recording<O> {
        inner: O,
        times: Vec<f64>,
        values: Vec<DVector<f64>>,
        steps: Vec<DVector<f64>>,
    }

    impl<O> Recording<O> {
        fn new(inner: O) -> Self {
            Self {
                inner,
                times: Vec::new(),
                values: Vec::new(),
                steps: Vec::new(),
            }
        }
    }

    impl<O: OdeSystem<f64>> OdeSystem<f64> for Recording<O> {
        fn size(&self) -> IndexType {
            self.inner.size()
        }
        fn endtime(&self) -> f64 {
            self.inner.endtime()
        }
        fn u0(&self, u: &mut DVector<f64>) {
            self.inner.u0(u)
        }
        fn f(&self, u: &DVector<f64>, t: f64, y: &mut DVector<f64>) {
            self.inner.f(u, t, y)
        }
        fn f_component(&self, u: &DVector<f64>, t: f64, i: IndexType) -> f64 {
            self.inner.f_component(u, t, i)
        }
        fn has_mass(&self) -> bool {
            self.inner.has_mass()
        }
        fn mass(&self, x: &DVector<f64>, y: &mut DVector<f64>, u: &DVector<f64>, t: f64) {
            self.inner.mass(x, y, u, t)
        }
        fn jacobian_mul(&self, x: &DVector<f64>, y: &mut DVector<f64>, u: &DVector<f64>, t: f64) {
            self.inner.jacobian_mul(x, y, u, t)
        }
        fn dfdu(&self, u: &DVector<f64>, t: f64, i: IndexType, j: IndexType) -> f64 {
            self.inner.dfdu(u, t, i, j)
        }
        fn save(&mut self, sample: &Sample<f64>) {
            self.times.push(sample.t());
            self.values.push(sample.u().clone());
            self.steps.push(sample.k().clone());
        }
    }

    #[test]
    fn test_mono_adaptive_decay() {
        let mut ode = Recording::new(ExponentialDecay::new(1.0, 1.0));
        let stats =
            TimeStepper::solve(&mut ode, OdeOptions::new().tol(1e-7).num_samples(10)).unwrap();
        assert!(stats.number_of_timeslabs >= 10);
        let last = ode.values.last().unwrap();
        assert!((ode.times.last().unwrap() - 1.0).abs() < 1e-12);
        assert!((last[0] - (-1.0f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn test_samples_strictly_increasing() {
        let mut ode = Recording::new(ExponentialDecay::new(1.0, 1.0));
        TimeStepper::solve(&mut ode, OdeOptions::new().num_samples(25)).unwrap();
        assert!(ode.times.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ode.times.first().copied().unwrap(), 0.0);
        assert!((ode.times.last().unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_newton_mono_decay() {
        let mut ode = Recording::new(ExponentialDecay::new(1.0, 1.0));
        let options = OdeOptions::new().tol(1e-7).solver(SolverKind::NewtonKrylov);
        TimeStepper::solve(&mut ode, options).unwrap();
        let last = ode.values.last().unwrap();
        assert!((last[0] - (-1.0f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn test_mass_matrix_requires_newton() {
        let mut ode = MassDecay::new(1.0);
        let err = TimeStepper::solve(&mut ode, OdeOptions::new().solver(SolverKind::FixedPoint));
        assert!(matches!(
            err,
            Err(SlabsolError::OdeSolverError(
                OdeSolverError::MassRequiresNewton
            ))
        ));
    }

    #[test]
    fn test_mass_matrix_decay() {
        let mut ode = Recording::new(MassDecay::new(1.0));
        TimeStepper::solve(&mut ode, OdeOptions::new().tol(1e-7)).unwrap();
        let last = ode.values.last().unwrap();
        assert!((last[0] - (-1.0f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn test_dg_harmonic_oscillator() {
        let mut ode = Recording::new(HarmonicOscillator::new(1.0));
        let options = OdeOptions::new()
            .tol(1e-7)
            .method(MethodKind::DiscontinuousGalerkin)
            .degree(1);
        TimeStepper::solve(&mut ode, options).unwrap();
        let last = ode.values.last().unwrap();
        assert!((last[0] - 1.0f64.sin()).abs() < 1e-4);
        assert!((last[1] - 1.0f64.cos()).abs() < 1e-4);
    }

    #[test]
    fn test_early_termination_from_update_hook() {
        struct Stopper {
            inner: ExponentialDecay<f64>,
        }
        impl OdeSystem<f64> for Stopper {
            fn size(&self) -> IndexType {
                1
            }
            fn endtime(&self) -> f64 {
                1.0
            }
            fn u0(&self, u: &mut DVector<f64>) {
                self.inner.u0(u)
            }
            fn f(&self, u: &DVector<f64>, t: f64, y: &mut DVector<f64>) {
                self.inner.f(u, t, y)
            }
            fn update(&mut self, _u: &DVector<f64>, t: f64, _end: bool) -> bool {
                t < 0.25
            }
        }
        let mut ode = Stopper {
            inner: ExponentialDecay::new(1.0, 1.0),
        };
        let mut stepper = TimeStepper::new(&mut ode, OdeOptions::new()).unwrap();
        while !stepper.finished() {
            stepper.step().unwrap();
        }
        assert!(stepper.stopped());
        assert!(stepper.state().t < 1.0);
    }

    #[test]
    fn test_step_size_underflow_reported() {
        // a right-hand side that never produces usable values: every slab
        // attempt fails to converge, the step is halved down to the floor,
        // and the bounded retry count converts the failures into a hard
        // error
        struct Hostile;
        impl OdeSystem<f64> for Hostile {
            fn size(&self) -> IndexType {
                1
            }
            fn endtime(&self) -> f64 {
                1.0
            }
            fn u0(&self, u: &mut DVector<f64>) {
                u[0] = 1.0;
            }
            fn f(&self, _u: &DVector<f64>, _t: f64, y: &mut DVector<f64>) {
                y[0] = f64::NAN;
            }
        }
        let mut ode = Hostile;
        let err = TimeStepper::solve(&mut ode, OdeOptions::<f64>::new());
        assert!(matches!(
            err,
            Err(SlabsolError::OdeSolverError(
                OdeSolverError::StepSizeUnderflow { .. }
            ))
        ));
    }

    #[test]
    fn test_multi_adaptive_two_rate_decay() {
        // u0' = -u0, u1' = -1000 u1: the fast component must be refined
        // locally without dragging the slow one down to its step
        let mut ode = Recording::new(StiffDecay::new(1.0, 1000.0));
        let options = OdeOptions::new()
            .tol(1e-6)
            .adaptivity(AdaptivityKind::Multi)
            .initial_step(1e-4)
            .num_samples(2000);
        TimeStepper::solve(&mut ode, options).unwrap();

        let last = ode.values.last().unwrap();
        assert!((ode.times.last().unwrap() - 1.0).abs() < 1e-12);
        assert!((last[0] - (-1.0f64).exp()).abs() < 1e-5);
        assert!((last[1] - (-1000.0f64).exp()).abs() < 1e-5);

        // During the fast transient the partition must separate the
        // components by orders of magnitude
        let early = ode
            .times
            .iter()
            .position(|&t| t > 0.0)
            .unwrap();
        let k_slow = ode.steps[early][0];
        let k_fast = ode.steps[early][1];
        assert!(
            k_slow > 20.0 * k_fast,
            "expected separated steps, got k0 = {}, k1 = {}",
            k_slow,
            k_fast
        );
    }

    #[test]
    fn test_multi_adaptive_newton_two_rate_decay() {
        let mut ode = Recording::new(StiffDecay::new(1.0, 1000.0));
        let options = OdeOptions::new()
            .tol(1e-6)
            .adaptivity(AdaptivityKind::Multi)
            .solver(SolverKind::NewtonKrylov)
            .initial_step(1e-4)
            .detect_sparsity(true);
        TimeStepper::solve(&mut ode, options).unwrap();
        let last = ode.values.last().unwrap();
        assert!((last[0] - (-1.0f64).exp()).abs() < 1e-5);
        assert!((last[1] - (-1000.0f64).exp()).abs() < 1e-5);
    }
}
