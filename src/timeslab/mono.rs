use nalgebra::DVector;
use tracing::warn;

use crate::adaptivity::MonoAdaptivity;
use crate::error::SlabsolError;
use crate::method::{Method, MethodKind};
use crate::nonlinear_solver;
use crate::ode::{OdeOptions, OdeSystem, Sample, SolverKind};
use crate::timeslab::{require_state, PreviousState, SlabState};
use crate::{Dependencies, IndexType, Scalar};

/// A time slab advancing every component with one common step. The unknown
/// buffer holds the nodal values for all components at all nodes, stored
/// node-major: entry `n * N + i` is nodal value `n` of component `i`.
pub struct MonoAdaptiveTimeSlab<T: Scalar> {
    pub(crate) n: IndexType,
    pub(crate) a: T,
    pub(crate) b: T,
    pub(crate) method: Method<T>,
    pub(crate) options: OdeOptions<T>,
    pub(crate) dependencies: Dependencies,
    pub(crate) adaptivity: MonoAdaptivity<T>,
    /// Degrees of freedom, `nsize * N`.
    pub(crate) x: DVector<T>,
    /// Right-hand side at the quadrature points, `qsize * N`.
    pub(crate) fq: DVector<T>,
    /// Start values at `a` (copied from the previous state on build).
    pub(crate) u0: DVector<T>,
    // Scratch for state and right-hand side evaluations
    pub(crate) u: DVector<T>,
    pub(crate) f: DVector<T>,
    pub(crate) rmax: T,
    pub(crate) state: SlabState,
    /// Incremented on every build; operators built against an older epoch
    /// are stale.
    pub(crate) epoch: u64,
}

impl<T: Scalar> MonoAdaptiveTimeSlab<T> {
    pub fn new(
        ode: &impl OdeSystem<T>,
        options: OdeOptions<T>,
        dependencies: Dependencies,
    ) -> Result<Self, SlabsolError> {
        let n = ode.size();
        let method = Method::new(options.method, options.degree)?;
        let adaptivity = MonoAdaptivity::new(ode, &options);
        let nj = method.nsize() * n;
        let nf = method.qsize() * n;
        Ok(Self {
            n,
            a: T::zero(),
            b: T::zero(),
            method,
            options,
            dependencies,
            adaptivity,
            x: DVector::zeros(nj),
            fq: DVector::zeros(nf),
            u0: DVector::zeros(n),
            u: DVector::zeros(n),
            f: DVector::zeros(n),
            rmax: T::zero(),
            state: SlabState::Empty,
            epoch: 0,
        })
    }

    pub(crate) fn build(
        &mut self,
        state: &PreviousState<T>,
        a: T,
        b: T,
        ode: &impl OdeSystem<T>,
    ) -> Result<T, SlabsolError> {
        require_state(
            "Empty or Rejected",
            self.state,
            matches!(self.state, SlabState::Empty | SlabState::Rejected),
        )?;

        self.u0.copy_from(&state.u);

        // Initial guess: constant in time
        for n in 0..self.method.nsize() {
            self.x.rows_mut(n * self.n, self.n).copy_from(&self.u0);
        }

        // Choose the slab length: cut at the target step unless the
        // requested end time is already within reach
        let k = self.adaptivity.timestep();
        let b = if k < self.options.interval_threshold * (b - a) {
            a + k
        } else {
            b
        };
        self.a = a;
        self.b = b;
        self.rmax = T::zero();
        self.epoch += 1;

        // For cG the first quadrature point is the left end point
        if self.method.kind() == MethodKind::ContinuousGalerkin {
            ode.f(&self.u0, a, &mut self.f);
            self.fq.rows_mut(0, self.n).copy_from(&self.f);
        }

        self.state = SlabState::Built;
        Ok(b)
    }

    pub(crate) fn solve(&mut self, ode: &impl OdeSystem<T>) -> Result<IndexType, SlabsolError> {
        require_state("Built", self.state, self.state == SlabState::Built)?;
        let result = match self.options.solver {
            SolverKind::FixedPoint => nonlinear_solver::mono_fixed_point(self, ode),
            SolverKind::NewtonKrylov => nonlinear_solver::mono_newton(self, ode),
            SolverKind::Auto => {
                if ode.has_mass() {
                    nonlinear_solver::mono_newton(self, ode)
                } else {
                    nonlinear_solver::mono_fixed_point(self, ode).or_else(|err| {
                        warn!("Fixed-point iteration failed ({}), retrying with Newton.", err);
                        nonlinear_solver::mono_newton(self, ode)
                    })
                }
            }
        };
        match result {
            Ok(iterations) => {
                self.state = SlabState::Solved;
                Ok(iterations)
            }
            Err(err) => {
                // the failed attempt is discarded; a rebuild is allowed
                self.state = SlabState::Rejected;
                Err(err)
            }
        }
    }

    pub(crate) fn check(
        &mut self,
        ode: &impl OdeSystem<T>,
        first: bool,
    ) -> Result<bool, SlabsolError> {
        require_state("Solved", self.state, self.state == SlabState::Solved)?;

        // Right-hand side at the end point
        self.feval(ode, self.method.qsize() - 1);

        let k = self.length();
        let foffset = (self.method.qsize() - 1) * self.n;
        let mut rmax = T::zero();
        let mut dofs = vec![T::zero(); self.method.nsize()];
        for i in 0..self.n {
            self.gather_dofs(i, &mut dofs);
            let r = self
                .method
                .residual(self.u0[i], &dofs, self.fq[foffset + i], k)
                .abs();
            if r > rmax {
                rmax = r;
            }
        }
        self.rmax = rmax;

        let accepted =
            self.options.fixed || self.method.error(k, rmax) <= self.adaptivity.tol();
        self.adaptivity.update(k, rmax, &self.method, first);
        self.state = if accepted {
            SlabState::Accepted
        } else {
            SlabState::Rejected
        };
        Ok(accepted)
    }

    pub(crate) fn shift(
        &mut self,
        state: &mut PreviousState<T>,
        ode: &mut impl OdeSystem<T>,
        end: bool,
    ) -> Result<bool, SlabsolError> {
        require_state("Accepted", self.state, self.state == SlabState::Accepted)?;

        let xoffset = (self.method.nsize() - 1) * self.n;
        state.u.copy_from(&self.x.rows(xoffset, self.n));
        state.t = self.b;

        let proceed = ode.update(&state.u, self.b, end);
        self.state = SlabState::Empty;
        Ok(proceed)
    }

    pub(crate) fn length(&self) -> T {
        self.b - self.a
    }

    /// Evaluate the right-hand side at quadrature point `m` into `fq`. For
    /// cG, point 0 holds the value at the left end point, set at build.
    pub(crate) fn feval(&mut self, ode: &impl OdeSystem<T>, m: IndexType) {
        let cg = self.method.kind() == MethodKind::ContinuousGalerkin;
        if cg && m == 0 {
            return;
        }
        let t = self.a + self.method.qpoint(m) * self.length();
        let xoffset = if cg { (m - 1) * self.n } else { m * self.n };
        self.u.copy_from(&self.x.rows(xoffset, self.n));
        ode.f(&self.u, t, &mut self.f);
        self.fq.rows_mut(m * self.n, self.n).copy_from(&self.f);
    }

    pub(crate) fn gather_dofs(&self, i: IndexType, dofs: &mut [T]) {
        for n in 0..self.method.nsize() {
            dofs[n] = self.x[n * self.n + i];
        }
    }

    pub(crate) fn usample(&self, i: IndexType, t: T) -> T {
        let tau = (t - self.a) / self.length();
        let mut dofs = vec![T::zero(); self.method.nsize()];
        self.gather_dofs(i, &mut dofs);
        self.method.ueval(self.u0[i], &dofs, tau)
    }

    pub(crate) fn ksample(&self, _i: IndexType, _t: T) -> T {
        self.length()
    }

    pub(crate) fn rsample(&self, i: IndexType, _t: T, ode: &impl OdeSystem<T>) -> T {
        // End-point residual of component i against a fresh evaluation of
        // the right-hand side
        let xoffset = (self.method.nsize() - 1) * self.n;
        let uend = self.x.rows(xoffset, self.n).into_owned();
        let fi = ode.f_component(&uend, self.b, i);
        let mut dofs = vec![T::zero(); self.method.nsize()];
        self.gather_dofs(i, &mut dofs);
        self.method.residual(self.u0[i], &dofs, fi, self.length())
    }

    pub(crate) fn sample(&self, ode: &impl OdeSystem<T>, t: T) -> Sample<T> {
        let n = self.n;
        let u = DVector::from_fn(n, |i, _| self.usample(i, t));
        let k = DVector::from_element(n, self.length());
        let r = DVector::from_fn(n, |i, _| self.rsample(i, t, ode));
        Sample::new(t, u, k, r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::test_models::ExponentialDecay;
    use crate::ode::AdaptivityKind;

    fn build_slab(
        options: OdeOptions<f64>,
    ) -> (
        ExponentialDecay<f64>,
        MonoAdaptiveTimeSlab<f64>,
        PreviousState<f64>,
    ) {
        assert_eq!(options.adaptivity, AdaptivityKind::Mono);
        let ode = ExponentialDecay::new(1.0, 1.0);
        let deps = Dependencies::new(1);
        let slab = MonoAdaptiveTimeSlab::new(&ode, options, deps).unwrap();
        let state = PreviousState::new(&ode);
        (ode, slab, state)
    }

    #[test]
    fn test_build_cuts_interval() {
        let (ode, mut slab, state) = build_slab(OdeOptions::new().initial_step(0.01));
        let b = slab.build(&state, 0.0, 1.0, &ode).unwrap();
        assert!((b - 0.01).abs() < 1e-12);
        assert_eq!(slab.state, SlabState::Built);
    }

    #[test]
    fn test_build_stretches_to_horizon() {
        let (ode, mut slab, state) = build_slab(OdeOptions::new().initial_step(0.01));
        // requested window is within the interval threshold of the step
        let b = slab.build(&state, 0.0, 0.0105, &ode).unwrap();
        assert!((b - 0.0105).abs() < 1e-12);
    }

    #[test]
    fn test_shift_unreachable_without_check() {
        let (mut ode, mut slab, mut state) = build_slab(OdeOptions::new());
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        slab.solve(&ode).unwrap();
        // no check() yet: shift must refuse
        assert!(slab.shift(&mut state, &mut ode, false).is_err());
        // after a passing check it commits
        assert!(slab.check(&ode, true).unwrap());
        assert!(slab.shift(&mut state, &mut ode, false).unwrap());
        assert_eq!(slab.state, SlabState::Empty);
    }

    #[test]
    fn test_rejected_build_leaves_previous_state_untouched() {
        let (ode, mut slab, state) = build_slab(OdeOptions::new());
        let before = state.u.clone();
        let b = slab.build(&state, 0.0, 1.0, &ode).unwrap();
        slab.solve(&ode).unwrap();
        slab.check(&ode, true).unwrap();
        // regardless of the verdict, discard and rebuild over a smaller
        // interval: the previous state must be bit-for-bit unchanged
        slab.state = SlabState::Rejected;
        slab.build(&state, 0.0, 0.5 * b, &ode).unwrap();
        assert_eq!(state.u, before);
        assert_eq!(state.t, 0.0);
    }

    #[test]
    fn test_usample_reproduces_nodal_values() {
        let (ode, mut slab, state) = build_slab(OdeOptions::new());
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        slab.solve(&ode).unwrap();
        let k = slab.length();
        for n in 0..slab.method.nsize() {
            let t = slab.a + slab.method.npoint(n) * k;
            let stored = slab.x[n * slab.n];
            assert!((slab.usample(0, t) - stored).abs() < 1e-14);
        }
    }

    #[test]
    fn test_solve_converges_linear_problem() {
        let (ode, mut slab, state) = build_slab(OdeOptions::new());
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        let iterations = slab.solve(&ode).unwrap();
        assert!(iterations > 0);
        // cG(1) on u' = -u: x1 = (1 - k/2) / (1 + k/2)
        let k = slab.length();
        let expected = (1.0 - 0.5 * k) / (1.0 + 0.5 * k);
        assert!((slab.x[0] - expected).abs() < 1e-10);
    }
}
