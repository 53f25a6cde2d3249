//! Analytic problems shared by the unit tests and benches.

use nalgebra::DVector;

use crate::ode::OdeSystem;
use crate::{Dependencies, IndexType, Scalar};

/// Scalar linear test equation u' = -lambda u, u(0) = u0.
pub struct ExponentialDecay<T: Scalar> {
    lambda: T,
    initial: T,
    end: T,
}

impl<T: Scalar> ExponentialDecay<T> {
    pub fn new(lambda: T, end: T) -> Self {
        Self {
            lambda,
            initial: T::one(),
            end,
        }
    }

    pub fn exact(&self, t: T) -> T {
        self.initial * (-self.lambda * t).exp()
    }
}

impl<T: Scalar> OdeSystem<T> for ExponentialDecay<T> {
    fn size(&self) -> IndexType {
        1
    }
    fn endtime(&self) -> T {
        self.end
    }
    fn u0(&self, u: &mut DVector<T>) {
        u[0] = self.initial;
    }
    fn f(&self, u: &DVector<T>, _t: T, y: &mut DVector<T>) {
        y[0] = -self.lambda * u[0];
    }
    fn f_component(&self, u: &DVector<T>, _t: T, _i: IndexType) -> T {
        -self.lambda * u[0]
    }
    fn jacobian_mul(&self, x: &DVector<T>, y: &mut DVector<T>, _u: &DVector<T>, _t: T) {
        y[0] = -self.lambda * x[0];
    }
    fn dfdu(&self, _u: &DVector<T>, _t: T, _i: IndexType, _j: IndexType) -> T {
        -self.lambda
    }
}

/// Two decoupled decay equations with well separated rates:
///
///     u0' = -lambda0 u0,  u1' = -lambda1 u1,  u(0) = (1, 1).
///
/// The classical motivating example for multi-rate stepping.
pub struct StiffDecay<T: Scalar> {
    lambda: [T; 2],
}

impl<T: Scalar> StiffDecay<T> {
    pub fn new(lambda0: T, lambda1: T) -> Self {
        Self {
            lambda: [lambda0, lambda1],
        }
    }

    pub fn exact(&self, t: T) -> DVector<T> {
        DVector::from_vec(vec![(-self.lambda[0] * t).exp(), (-self.lambda[1] * t).exp()])
    }
}

impl<T: Scalar> OdeSystem<T> for StiffDecay<T> {
    fn size(&self) -> IndexType {
        2
    }
    fn endtime(&self) -> T {
        T::one()
    }
    fn u0(&self, u: &mut DVector<T>) {
        u.fill(T::one());
    }
    fn f(&self, u: &DVector<T>, _t: T, y: &mut DVector<T>) {
        y[0] = -self.lambda[0] * u[0];
        y[1] = -self.lambda[1] * u[1];
    }
    fn f_component(&self, u: &DVector<T>, _t: T, i: IndexType) -> T {
        -self.lambda[i] * u[i]
    }
    fn jacobian_mul(&self, x: &DVector<T>, y: &mut DVector<T>, _u: &DVector<T>, _t: T) {
        y[0] = -self.lambda[0] * x[0];
        y[1] = -self.lambda[1] * x[1];
    }
    fn dfdu(&self, _u: &DVector<T>, _t: T, i: IndexType, j: IndexType) -> T {
        if i == j {
            -self.lambda[i]
        } else {
            T::zero()
        }
    }
    fn sparsity(&self, dependencies: &mut Dependencies) {
        dependencies.set(0, 0, false);
        dependencies.set(1, 1, false);
    }
}

/// Harmonic oscillator u0' = u1, u1' = -omega^2 u0, u(0) = (0, 1)
/// (for omega = 1: u0 = sin t, u1 = cos t). Each component depends only on
/// the other, with no self-dependency.
pub struct HarmonicOscillator<T: Scalar> {
    omega: T,
}

impl<T: Scalar> HarmonicOscillator<T> {
    pub fn new(omega: T) -> Self {
        Self { omega }
    }

    pub fn exact(&self, t: T) -> DVector<T> {
        let w = self.omega;
        DVector::from_vec(vec![(w * t).sin() / w, (w * t).cos()])
    }
}

impl<T: Scalar> OdeSystem<T> for HarmonicOscillator<T> {
    fn size(&self) -> IndexType {
        2
    }
    fn endtime(&self) -> T {
        T::one()
    }
    fn u0(&self, u: &mut DVector<T>) {
        u[0] = T::zero();
        u[1] = T::one();
    }
    fn f(&self, u: &DVector<T>, _t: T, y: &mut DVector<T>) {
        y[0] = u[1];
        y[1] = -self.omega * self.omega * u[0];
    }
    fn f_component(&self, u: &DVector<T>, _t: T, i: IndexType) -> T {
        if i == 0 {
            u[1]
        } else {
            -self.omega * self.omega * u[0]
        }
    }
    fn jacobian_mul(&self, x: &DVector<T>, y: &mut DVector<T>, _u: &DVector<T>, _t: T) {
        y[0] = x[1];
        y[1] = -self.omega * self.omega * x[0];
    }
    fn dfdu(&self, _u: &DVector<T>, _t: T, i: IndexType, j: IndexType) -> T {
        match (i, j) {
            (0, 1) => T::one(),
            (1, 0) => -self.omega * self.omega,
            _ => T::zero(),
        }
    }
}

/// Implicit form 2 u' = -2 lambda u: same solution as [ExponentialDecay]
/// but exercised through the mass-matrix path.
pub struct MassDecay<T: Scalar> {
    lambda: T,
}

impl<T: Scalar> MassDecay<T> {
    pub fn new(lambda: T) -> Self {
        Self { lambda }
    }

    pub fn exact(&self, t: T) -> T {
        (-self.lambda * t).exp()
    }
}

impl<T: Scalar> OdeSystem<T> for MassDecay<T> {
    fn size(&self) -> IndexType {
        1
    }
    fn endtime(&self) -> T {
        T::one()
    }
    fn u0(&self, u: &mut DVector<T>) {
        u[0] = T::one();
    }
    fn f(&self, u: &DVector<T>, _t: T, y: &mut DVector<T>) {
        y[0] = -T::from(2.0) * self.lambda * u[0];
    }
    fn has_mass(&self) -> bool {
        true
    }
    fn mass(&self, x: &DVector<T>, y: &mut DVector<T>, _u: &DVector<T>, _t: T) {
        y[0] = T::from(2.0) * x[0];
    }
    fn jacobian_mul(&self, x: &DVector<T>, y: &mut DVector<T>, _u: &DVector<T>, _t: T) {
        y[0] = -T::from(2.0) * self.lambda * x[0];
    }
    fn dfdu(&self, _u: &DVector<T>, _t: T, _i: IndexType, _j: IndexType) -> T {
        -T::from(2.0) * self.lambda
    }
}
