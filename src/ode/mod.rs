use nalgebra::DVector;
use serde::Serialize;

use crate::method::MethodKind;
use crate::{IndexType, Scalar};

pub mod test_models;

/// An initial value problem
///
///     u'(t) = f(u(t), t) on (0, T],  u(0) = u0,
///
/// where `u(t)` is a vector of length N, or the implicit form
///
///     M(u(t), t) u'(t) = f(u(t), t)
///
/// when [OdeSystem::has_mass] is overridden to return true.
///
/// The right-hand side can be supplied either for the whole system
/// ([OdeSystem::f]) or component-wise ([OdeSystem::f_component]); the
/// multi-adaptive solvers only ever ask for single components, so
/// overriding the component version avoids evaluating the full system at
/// every local quadrature point.
pub trait OdeSystem<T: Scalar> {
    /// Number of components N.
    fn size(&self) -> IndexType;

    /// Final time T.
    fn endtime(&self) -> T;

    /// Set initial values.
    fn u0(&self, u: &mut DVector<T>);

    /// Evaluate the right-hand side y = f(u, t).
    fn f(&self, u: &DVector<T>, t: T, y: &mut DVector<T>);

    /// Evaluate a single component f_i(u, t).
    fn f_component(&self, u: &DVector<T>, t: T, i: IndexType) -> T {
        let mut y = DVector::zeros(self.size());
        self.f(u, t, &mut y);
        y[i]
    }

    /// True if the system has a (non-identity) mass matrix.
    fn has_mass(&self) -> bool {
        false
    }

    /// Compute the product y = M x for the implicit form.
    fn mass(&self, x: &DVector<T>, y: &mut DVector<T>, _u: &DVector<T>, _t: T) {
        y.copy_from(x);
    }

    /// Compute the product y = J x for the Jacobian of f at (u, t). The
    /// default is a forward-difference approximation of the directional
    /// derivative.
    fn jacobian_mul(&self, x: &DVector<T>, y: &mut DVector<T>, u: &DVector<T>, t: T) {
        let norm = x.amax();
        if norm < T::EPSILON {
            y.fill(T::zero());
            return;
        }
        let eps = T::EPSILON.sqrt() * (T::one() + u.amax()) / norm;
        let up = u + x * eps;
        let mut f0 = DVector::zeros(self.size());
        self.f(u, t, &mut f0);
        self.f(&up, t, y);
        *y -= &f0;
        *y /= eps;
    }

    /// A single entry of the Jacobian, df_i/du_j at (u, t). Used for the
    /// explicit-entry strategy when the dependency pattern is sparse, and
    /// by the block preconditioner. The default is a forward difference on
    /// [OdeSystem::f_component].
    fn dfdu(&self, u: &DVector<T>, t: T, i: IndexType, j: IndexType) -> T {
        let eps = T::EPSILON.sqrt() * (T::one() + u[j].abs());
        let mut up = u.clone();
        up[j] += eps;
        (self.f_component(&up, t, i) - self.f_component(u, t, i)) / eps
    }

    /// Declare the dependency pattern of f (which u_j each f_i may read).
    /// The default leaves the pattern dense; probing is available through
    /// [crate::Dependencies::detect].
    fn sparsity(&self, _dependencies: &mut crate::Dependencies) {}

    /// Step hint for the whole system at time t, given the default step k0.
    fn timestep(&self, _t: T, k0: T) -> T {
        k0
    }

    /// Step hint for component i at time t.
    fn timestep_component(&self, t: T, _i: IndexType, k0: T) -> T {
        self.timestep(t, k0)
    }

    /// Called after each accepted slab with the end-time solution; return
    /// false to request termination. Also called once at t = 0.
    fn update(&mut self, _u: &DVector<T>, _t: T, _end: bool) -> bool {
        true
    }

    /// Receive an interpolated sample of the solution.
    fn save(&mut self, _sample: &Sample<T>) {}
}

/// A read-only snapshot of the solution at a single time, interpolated from
/// the current slab. Never stored by the solver beyond the `save` call.
pub struct Sample<T: Scalar> {
    t: T,
    u: DVector<T>,
    k: DVector<T>,
    r: DVector<T>,
}

impl<T: Scalar> Sample<T> {
    pub(crate) fn new(t: T, u: DVector<T>, k: DVector<T>, r: DVector<T>) -> Self {
        Self { t, u, k, r }
    }

    /// Sample time.
    pub fn t(&self) -> T {
        self.t
    }

    /// Solution values.
    pub fn u(&self) -> &DVector<T> {
        &self.u
    }

    /// Time step used for each component at this time.
    pub fn k(&self) -> &DVector<T> {
        &self.k
    }

    /// Residual for each component at this time.
    pub fn r(&self) -> &DVector<T> {
        &self.r
    }
}

/// Mono-adaptive (one step for the whole system) or multi-adaptive
/// (individual steps per component) time stepping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AdaptivityKind {
    Mono,
    Multi,
}

/// Strategy for converging each slab's discrete system.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SolverKind {
    /// Fixed-point iteration, falling back to Newton when it fails.
    Auto,
    /// Damped Picard iteration only.
    FixedPoint,
    /// Newton iteration with a matrix-free Krylov linear solve.
    NewtonKrylov,
}

/// Configuration for the time stepping, with defaults suited to smooth
/// problems at moderate tolerances; all setters are chainable.
#[derive(Clone, Debug, Serialize)]
pub struct OdeOptions<T: Scalar> {
    /// Tolerance for the local error estimate.
    pub tol: T,
    /// Smallest admissible time step.
    pub k_min: T,
    /// Largest admissible time step.
    pub k_max: T,
    /// Default initial time step (also passed to the problem's step hints).
    pub initial_step: T,
    /// Collocation family.
    pub method: MethodKind,
    /// Polynomial degree q.
    pub degree: IndexType,
    /// Mono- or multi-adaptive stepping.
    pub adaptivity: AdaptivityKind,
    /// Nonlinear solver strategy.
    pub solver: SolverKind,
    /// Keep the time step fixed (no error control; every slab accepted).
    pub fixed: bool,
    /// Probe the right-hand side to detect its dependency pattern.
    pub detect_sparsity: bool,
    /// Components within this fraction of the largest remaining step share
    /// a partition group.
    pub partitioning_threshold: T,
    /// A slab stretches to a requested end time closer than k / threshold.
    pub interval_threshold: T,
    /// Discrete tolerance for the nonlinear iteration, as a fraction of
    /// `tol`.
    pub discrete_tolerance_factor: T,
    /// Krylov tolerance, as a fraction of the discrete tolerance.
    pub krylov_tolerance_factor: T,
    /// Damping for the fixed-point iteration, in (0, 1].
    pub fixed_point_damping: T,
    /// Maximum number of nonlinear iterations per slab.
    pub max_iterations: IndexType,
    /// Maximum number of rejected attempts per step before giving up.
    pub max_rejections: IndexType,
    /// Increment used when probing the dependency pattern.
    pub sparsity_check_increment: T,
    /// Number of samples delivered to `save` over [0, T].
    pub num_samples: IndexType,
    /// Log each nonlinear iteration.
    pub monitor_convergence: bool,
}

impl<T: Scalar> Default for OdeOptions<T> {
    fn default() -> Self {
        Self {
            tol: T::from(1e-5),
            k_min: T::from(1e-12),
            k_max: T::from(0.1),
            initial_step: T::from(0.01),
            method: MethodKind::ContinuousGalerkin,
            degree: 1,
            adaptivity: AdaptivityKind::Mono,
            solver: SolverKind::Auto,
            fixed: false,
            detect_sparsity: false,
            partitioning_threshold: T::from(0.1),
            interval_threshold: T::from(0.9),
            discrete_tolerance_factor: T::from(0.001),
            krylov_tolerance_factor: T::from(0.01),
            fixed_point_damping: T::one(),
            max_iterations: 100,
            max_rejections: 40,
            sparsity_check_increment: T::from(1e-4),
            num_samples: 100,
            monitor_convergence: false,
        }
    }
}

impl<T: Scalar> OdeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tol(mut self, tol: T) -> Self {
        self.tol = tol;
        self
    }

    pub fn k_max(mut self, k_max: T) -> Self {
        self.k_max = k_max;
        self
    }

    pub fn initial_step(mut self, k: T) -> Self {
        self.initial_step = k;
        self
    }

    pub fn method(mut self, method: MethodKind) -> Self {
        self.method = method;
        self
    }

    pub fn degree(mut self, q: IndexType) -> Self {
        self.degree = q;
        self
    }

    pub fn adaptivity(mut self, adaptivity: AdaptivityKind) -> Self {
        self.adaptivity = adaptivity;
        self
    }

    pub fn solver(mut self, solver: SolverKind) -> Self {
        self.solver = solver;
        self
    }

    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    pub fn detect_sparsity(mut self, detect: bool) -> Self {
        self.detect_sparsity = detect;
        self
    }

    pub fn num_samples(mut self, n: IndexType) -> Self {
        self.num_samples = n;
        self
    }

    pub fn monitor_convergence(mut self, monitor: bool) -> Self {
        self.monitor_convergence = monitor;
        self
    }
}

/// Counters accumulated over a run.
#[derive(Default, Clone, Debug, Serialize)]
pub struct SolverStatistics {
    /// Accepted (macro) time slabs.
    pub number_of_timeslabs: usize,
    /// Rejected attempts (accuracy or convergence failures).
    pub number_of_rejections: usize,
    /// Total nonlinear iterations over all accepted slabs.
    pub number_of_iterations: usize,
}

impl SolverStatistics {
    pub fn new() -> Self {
        Self::default()
    }
}
