use nalgebra::DVector;

use crate::method::Method;
use crate::ode::{OdeOptions, OdeSystem};
use crate::{IndexType, Scalar};

// Regulate a step from the method's suggestion: smooth against the previous
// accepted step (harmonic mean, skipped on the very first step where there
// is no history) and clamp to the admissible interval.
fn regulate<T: Scalar>(knew: T, kprev: T, first: bool, k_min: T, k_max: T) -> T {
    let k = if first {
        knew
    } else {
        T::from(2.0) * kprev * knew / (kprev + knew)
    };
    k.max(k_min).min(k_max)
}

/// Step-size regulation with a single scalar step for the whole system.
pub struct MonoAdaptivity<T: Scalar> {
    k: T,
    r: T,
    tol: T,
    k_min: T,
    k_max: T,
    fixed: bool,
}

impl<T: Scalar> MonoAdaptivity<T> {
    pub fn new(ode: &impl OdeSystem<T>, options: &OdeOptions<T>) -> Self {
        let k = ode
            .timestep(T::zero(), options.initial_step)
            .max(options.k_min)
            .min(options.k_max);
        Self {
            k,
            r: T::zero(),
            tol: options.tol,
            k_min: options.k_min,
            k_max: options.k_max,
            fixed: options.fixed,
        }
    }

    /// The currently accepted step.
    pub fn timestep(&self) -> T {
        self.k
    }

    /// The most recent maximum residual.
    pub fn residual(&self) -> T {
        self.r
    }

    pub fn tol(&self) -> T {
        self.tol
    }

    /// Recompute the next target step from the residual observed on a slab
    /// of length `k0`.
    pub fn update(&mut self, k0: T, r: T, method: &Method<T>, first: bool) {
        self.r = r;
        if self.fixed {
            return;
        }
        let knew = method.timestep(r, self.tol, k0, self.k_max);
        self.k = regulate(knew, self.k, first, self.k_min, self.k_max);
    }

    /// Forced reduction after a convergence failure.
    pub fn shrink(&mut self, factor: T) {
        self.k = (self.k * factor).max(self.k_min);
    }

    pub fn at_minimum(&self) -> bool {
        self.k <= self.k_min
    }
}

/// Step-size regulation with an individual step and residual history per
/// component. Queries for a component that was not touched by the most
/// recent update return its last known values.
pub struct MultiAdaptivity<T: Scalar> {
    k: Vec<T>,
    r: Vec<T>,
    tol: T,
    k_min: T,
    k_max: T,
    fixed: bool,
}

impl<T: Scalar> MultiAdaptivity<T> {
    pub fn new(ode: &impl OdeSystem<T>, options: &OdeOptions<T>) -> Self {
        let n = ode.size();
        let k: Vec<T> = (0..n)
            .map(|i| {
                ode.timestep_component(T::zero(), i, options.initial_step)
                    .max(options.k_min)
                    .min(options.k_max)
            })
            .collect();
        Self {
            k,
            r: vec![T::zero(); n],
            tol: options.tol,
            k_min: options.k_min,
            k_max: options.k_max,
            fixed: options.fixed,
        }
    }

    pub fn size(&self) -> IndexType {
        self.k.len()
    }

    /// The currently accepted step for component i.
    pub fn timestep(&self, i: IndexType) -> T {
        self.k[i]
    }

    /// The most recent residual for component i.
    pub fn residual(&self, i: IndexType) -> T {
        self.r[i]
    }

    pub fn tol(&self) -> T {
        self.tol
    }

    /// Recompute the target step of component i from the residual observed
    /// on its element of length `k0`, independently of all other
    /// components.
    pub fn update_component(&mut self, i: IndexType, k0: T, r: T, method: &Method<T>, first: bool) {
        self.r[i] = r;
        if self.fixed {
            return;
        }
        let knew = method.timestep(r, self.tol, k0, self.k_max);
        self.k[i] = regulate(knew, self.k[i], first, self.k_min, self.k_max);
    }

    /// Forced reduction of every component after a convergence failure.
    pub fn shrink(&mut self, factor: T) {
        for k in self.k.iter_mut() {
            *k = (*k * factor).max(self.k_min);
        }
    }

    pub fn at_minimum(&self) -> bool {
        self.k.iter().all(|&k| k <= self.k_min)
    }

    /// Current steps as a vector, for sampling.
    pub fn timesteps(&self) -> DVector<T> {
        DVector::from_iterator(self.k.len(), self.k.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;
    use crate::ode::test_models::{ExponentialDecay, StiffDecay};

    fn options() -> OdeOptions<f64> {
        OdeOptions::new().tol(1e-6)
    }

    #[test]
    fn test_steps_stay_in_bounds() {
        let ode = ExponentialDecay::new(1.0, 1.0);
        let options = options();
        let method = Method::continuous(1).unwrap();
        let mut adaptivity = MonoAdaptivity::new(&ode, &options);
        // huge residual drives the step to the lower bound, never below
        for _ in 0..200 {
            adaptivity.update(adaptivity.timestep(), 1e12, &method, false);
        }
        assert!(adaptivity.timestep() >= options.k_min);
        // vanishing residual saturates at the upper bound
        for _ in 0..200 {
            adaptivity.update(adaptivity.timestep(), 0.0, &method, false);
        }
        assert!(adaptivity.timestep() <= options.k_max);
    }

    #[test]
    fn test_fixed_mode_keeps_step() {
        let ode = ExponentialDecay::new(1.0, 1.0);
        let options = options().fixed(true).initial_step(0.025);
        let method = Method::continuous(1).unwrap();
        let mut adaptivity = MonoAdaptivity::new(&ode, &options);
        adaptivity.update(0.025, 1e3, &method, true);
        assert_eq!(adaptivity.timestep(), 0.025);
    }

    #[test]
    fn test_inactive_component_keeps_history() {
        let ode = StiffDecay::new(1.0, 1000.0);
        let options = options();
        let method = Method::continuous(1).unwrap();
        let mut adaptivity = MultiAdaptivity::new(&ode, &options);
        adaptivity.update_component(0, 0.01, 1e-3, &method, true);
        let k0 = adaptivity.timestep(0);
        let r0 = adaptivity.residual(0);
        // updating the other component leaves component 0 untouched
        adaptivity.update_component(1, 0.001, 1e2, &method, true);
        assert_eq!(adaptivity.timestep(0), k0);
        assert_eq!(adaptivity.residual(0), r0);
    }
}
