//! # Slabsol
//!
//! Slabsol is a library for integrating large systems of ordinary
//! differential equations `u' = f(u, t)` (optionally `M u' = f(u, t)`)
//! whose components evolve on very different time scales. Instead of
//! forcing one global step, the solution is advanced one *time slab* at a
//! time: over each slab `[a, b)` every component carries its own
//! error-controlled step, so fast components are refined locally without
//! dragging slow components down to the same resolution.
//!
//! ## Defining a problem
//!
//! Implement the [OdeSystem] trait for your problem: its size, the end
//! time, the initial values and the right-hand side. Everything else
//! (component-wise evaluation, Jacobian action, explicit Jacobian entries,
//! step hints, the `update` and `save` hooks) has working defaults that
//! can be overridden for efficiency or control.
//!
//! ## Solving
//!
//! Configure the run with [OdeOptions] — the collocation family
//! ([MethodKind]: cG(q) or dG(q)), mono- or multi-adaptive stepping
//! ([AdaptivityKind]), the nonlinear solver ([SolverKind]: damped
//! fixed-point iteration or matrix-free Newton-Krylov), the tolerance and
//! the step bounds — and call [TimeStepper::solve], which steps to the
//! horizon and delivers interpolated [Sample]s to the problem's `save`
//! hook. For manual control, create a [TimeStepper] and call
//! [TimeStepper::step] repeatedly.
//!
//! ## Sparsity
//!
//! For large systems with local coupling, declare the dependency pattern
//! of `f` through [OdeSystem::sparsity] or let [Dependencies::detect]
//! probe it. A sparse pattern switches the Newton solver to explicit-entry
//! Jacobian assembly and tightens the block preconditioner.

pub mod adaptivity;
pub mod dependencies;
pub mod error;
pub mod jacobian;
pub mod linear_solver;
pub mod method;
pub mod nonlinear_solver;
pub mod ode;
pub mod partition;
pub mod scalar;
pub mod stepper;
pub mod timeslab;

pub use adaptivity::{MonoAdaptivity, MultiAdaptivity};
pub use dependencies::Dependencies;
pub use error::SlabsolError;
pub use jacobian::{JacobianOperator, SlabPreconditioner};
pub use method::{Method, MethodKind};
pub use ode::{AdaptivityKind, OdeOptions, OdeSystem, Sample, SolverKind, SolverStatistics};
pub use partition::Partition;
pub use scalar::{IndexType, Scalar};
pub use stepper::TimeStepper;
pub use timeslab::{PreviousState, SlabState, TimeSlab};

#[cfg(test)]
mod tests {
    use crate::ode::test_models::ExponentialDecay;
    use crate::{MethodKind, OdeOptions, OdeSystem, Sample, TimeStepper};

    // WARNING: if this test fails and you make a change to the code, you
    // should update the README.md file as well!!!
    #[test]
    fn test_readme() {
        struct Decay {
            last: f64,
        }
        impl OdeSystem<f64> for Decay {
            fn size(&self) -> usize {
                1
            }
            fn endtime(&self) -> f64 {
                1.0
            }
            fn u0(&self, u: &mut nalgebra::DVector<f64>) {
                u[0] = 1.0;
            }
            fn f(&self, u: &nalgebra::DVector<f64>, _t: f64, y: &mut nalgebra::DVector<f64>) {
                y[0] = -u[0];
            }
            fn save(&mut self, sample: &Sample<f64>) {
                self.last = sample.u()[0];
            }
        }

        let mut ode = Decay { last: 0.0 };
        let options = OdeOptions::new().tol(1e-7);
        let statistics = TimeStepper::solve(&mut ode, options).unwrap();

        assert!(statistics.number_of_timeslabs > 0);
        assert!((ode.last - (-1.0f64).exp()).abs() < 1e-5);
    }

    // Empirical convergence order of the scalar linear test equation under
    // step halving (Richardson), which must be at least q + 1 for both
    // families.
    fn convergence_order(method: MethodKind, degree: usize) -> f64 {
        fn final_error(method: MethodKind, degree: usize, k: f64) -> f64 {
            let mut ode = ExponentialDecay::new(1.0, 1.0);
            let exact = ode.exact(1.0);
            let options = OdeOptions::new()
                .method(method)
                .degree(degree)
                .fixed(true)
                .initial_step(k)
                .k_max(k)
                .num_samples(0);
            let mut stepper = TimeStepper::new(&mut ode, options).unwrap();
            while !stepper.finished() {
                stepper.step().unwrap();
            }
            (stepper.state().u[0] - exact).abs()
        }

        let e1 = final_error(method, degree, 0.05);
        let e2 = final_error(method, degree, 0.025);
        (e1 / e2).log2()
    }

    #[test]
    fn test_cg1_convergence_order() {
        let p = convergence_order(MethodKind::ContinuousGalerkin, 1);
        assert!(p > 1.7, "observed order {}", p);
    }

    #[test]
    fn test_cg2_convergence_order() {
        let p = convergence_order(MethodKind::ContinuousGalerkin, 2);
        assert!(p > 2.7, "observed order {}", p);
    }

    #[test]
    fn test_dg0_convergence_order() {
        let p = convergence_order(MethodKind::DiscontinuousGalerkin, 0);
        assert!(p > 0.7, "observed order {}", p);
    }

    #[test]
    fn test_dg1_convergence_order() {
        let p = convergence_order(MethodKind::DiscontinuousGalerkin, 1);
        assert!(p > 1.7, "observed order {}", p);
    }
}
