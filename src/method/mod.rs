use nalgebra::{DMatrix, DVector};
use tracing::info;

use crate::error::{MethodError, SlabsolError};
use crate::{IndexType, Scalar};

pub mod lagrange;
pub mod quadrature;

use lagrange::Lagrange;
use quadrature::{LobattoQuadrature, RadauQuadrature};

/// The two collocation families. The set is closed and the choice is made
/// once at configuration time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum MethodKind {
    /// cG(q): the trial space is continuous across slab boundaries, so the
    /// start value of a slab is the end value of the previous slab and not
    /// a separate unknown.
    ContinuousGalerkin,
    /// dG(q): the start value is an independent unknown and the jump
    /// `[[u]] = u(a+) - u(a-)` enters the residual.
    DiscontinuousGalerkin,
}

/// Safety factor applied when regulating the time step from a residual.
const SAFETY: f64 = 0.8;

/// A collocation method cG(q) or dG(q) on the reference interval [0, 1]:
/// nodal points, the nodal weight matrix mapping quadrature samples of the
/// right-hand side to nodal values, a matching quadrature rule, and the
/// derivative weights at the right end point.
///
/// Immutable once constructed; all operations are pure functions over
/// buffers supplied by the caller.
pub struct Method<T: Scalar> {
    kind: MethodKind,
    q: IndexType,
    nn: IndexType,
    nq: IndexType,
    qpoints: Vec<T>,
    qweights: Vec<T>,
    npoints: Vec<T>,
    nweights: DMatrix<T>,
    derivatives: Vec<T>,
    trial: Lagrange<T>,
}

impl<T: Scalar> Method<T> {
    pub fn new(kind: MethodKind, q: IndexType) -> Result<Self, SlabsolError> {
        match kind {
            MethodKind::ContinuousGalerkin => Self::continuous(q),
            MethodKind::DiscontinuousGalerkin => Self::discontinuous(q),
        }
    }

    /// Construct cG(q). The minimal degree is q = 1.
    pub fn continuous(q: IndexType) -> Result<Self, SlabsolError> {
        if q < 1 {
            return Err(SlabsolError::from(MethodError::InvalidDegree {
                method: "continuous Galerkin",
                q,
                min: 1,
            }));
        }
        info!("Initializing continuous Galerkin method cG({}).", q);

        let nn = q;
        let nq = q + 1;

        // Lobatto quadrature, rescaled from [-1, 1] to [0, 1]
        let quadrature = LobattoQuadrature::new(nq)?;
        let half = T::from(0.5);
        let qpoints: Vec<T> = (0..nq)
            .map(|i| (quadrature.point(i) + T::one()) * half)
            .collect();
        let qweights: Vec<T> = (0..nq).map(|i| half * quadrature.weight(i)).collect();

        // Nodal points are the quadrature points without the left end point
        let npoints: Vec<T> = qpoints[1..].to_vec();

        // Trial space of degree q on all quadrature points, test space of
        // degree q - 1 on the Lobatto points for q - 1
        let trial = Lagrange::from_points(qpoints.clone());
        let test = if q > 1 {
            let lobatto: LobattoQuadrature<T> = LobattoQuadrature::new(q)?;
            Lagrange::from_points(
                (0..q)
                    .map(|i| (lobatto.point(i) + T::one()) * half)
                    .collect(),
            )
        } else {
            Lagrange::from_points(vec![T::one()])
        };

        // Variational matrix: integrals of trial derivatives against test
        // functions, computed with the quadrature rule (exact for 2q - 1)
        let mut a = DMatrix::<T>::zeros(nn, nn);
        for i in 0..nn {
            for j in 0..nn {
                let mut integral = T::zero();
                for k in 0..nq {
                    integral += qweights[k] * trial.ddx(j + 1, qpoints[k]) * test.eval(i, qpoints[k]);
                }
                a[(i, j)] = integral;
            }
        }
        let nweights = Self::solve_weights(&a, &test, &qpoints, &qweights, nn, nq);

        let derivatives = (0..nq).map(|i| trial.ddx(i, T::one())).collect();

        Ok(Self {
            kind: MethodKind::ContinuousGalerkin,
            q,
            nn,
            nq,
            qpoints,
            qweights,
            npoints,
            nweights,
            derivatives,
            trial,
        })
    }

    /// Construct dG(q). Any degree q >= 0 is valid.
    pub fn discontinuous(q: IndexType) -> Result<Self, SlabsolError> {
        info!("Initializing discontinuous Galerkin method dG({}).", q);

        let nn = q + 1;
        let nq = q + 1;

        // Radau quadrature, rescaled from [-1, 1] to [0, 1] and reversed so
        // that the fixed point sits at the right end point
        let quadrature = RadauQuadrature::new(nq)?;
        let half = T::from(0.5);
        let qpoints: Vec<T> = (0..nq)
            .map(|i| T::one() - (quadrature.point(nq - 1 - i) + T::one()) * half)
            .collect();
        let qweights: Vec<T> = (0..nq)
            .map(|i| half * quadrature.weight(nq - 1 - i))
            .collect();
        let npoints = qpoints.clone();

        // Trial and test spaces coincide
        let trial = Lagrange::from_points(qpoints.clone());

        // Variational matrix with the jump contribution at the left end point
        let mut a = DMatrix::<T>::zeros(nn, nn);
        for i in 0..nn {
            for j in 0..nn {
                let mut integral = T::zero();
                for k in 0..nq {
                    integral += qweights[k] * trial.ddx(j, qpoints[k]) * trial.eval(i, qpoints[k]);
                }
                a[(i, j)] = integral + trial.eval(j, T::zero()) * trial.eval(i, T::zero());
            }
        }
        let nweights = Self::solve_weights(&a, &trial, &qpoints, &qweights, nn, nq);

        let derivatives = (0..nn).map(|i| trial.ddx(i, T::one())).collect();

        Ok(Self {
            kind: MethodKind::DiscontinuousGalerkin,
            q,
            nn,
            nq,
            qpoints,
            qweights,
            npoints,
            nweights,
            derivatives,
            trial,
        })
    }

    // Nodal weights for each degree of freedom: solve for the weight
    // functions at every quadrature point and fold in the quadrature weight.
    fn solve_weights(
        a: &DMatrix<T>,
        test: &Lagrange<T>,
        qpoints: &[T],
        qweights: &[T],
        nn: IndexType,
        nq: IndexType,
    ) -> DMatrix<T> {
        let lu = a.clone().lu();
        let mut nweights = DMatrix::<T>::zeros(nn, nq);
        for m in 0..nq {
            let b = DVector::<T>::from_fn(nn, |j, _| test.eval(j, qpoints[m]));
            let w = lu.solve(&b).expect("variational matrix is nonsingular");
            for n in 0..nn {
                nweights[(n, m)] = qweights[m] * w[n];
            }
        }
        nweights
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn degree(&self) -> IndexType {
        self.q
    }

    /// Number of nodal values (degrees of freedom per component).
    pub fn nsize(&self) -> IndexType {
        self.nn
    }

    /// Number of quadrature points.
    pub fn qsize(&self) -> IndexType {
        self.nq
    }

    pub fn qpoint(&self, m: IndexType) -> T {
        self.qpoints[m]
    }

    pub fn qweight(&self, m: IndexType) -> T {
        self.qweights[m]
    }

    pub fn npoint(&self, n: IndexType) -> T {
        self.npoints[n]
    }

    pub fn nweight(&self, n: IndexType, m: IndexType) -> T {
        self.nweights[(n, m)]
    }

    /// Evaluate trial basis function `i` at local time `tau` in [0, 1].
    pub fn eval(&self, i: IndexType, tau: T) -> T {
        self.trial.eval(i, tau)
    }

    /// Derivative weight of nodal value `i` at the right end point.
    pub fn derivative(&self, i: IndexType) -> T {
        self.derivatives[i]
    }

    /// The nn x nn map from nodal perturbations to the collocation update,
    /// used by the block preconditioner: column n' is the effect of nodal
    /// value n' through the quadrature samples it controls.
    pub fn stage_weights(&self) -> DMatrix<T> {
        match self.kind {
            // For cG the first quadrature point is controlled by the start
            // value, not by a nodal unknown
            MethodKind::ContinuousGalerkin => self.nweights.columns(1, self.nn).into_owned(),
            MethodKind::DiscontinuousGalerkin => self.nweights.clone(),
        }
    }

    /// Compute the next nodal values from the previous end point `x0`, the
    /// quadrature samples `f` of the right-hand side and the step `k`,
    /// relaxed by `alpha` in (0, 1]. Returns the end-point increment.
    pub fn update(&self, x0: T, f: &[T], k: T, values: &mut [T], alpha: T) -> T {
        let x1 = values[self.nn - 1];
        for n in 0..self.nn {
            let mut sum = T::zero();
            for m in 0..self.nq {
                sum += self.nweights[(n, m)] * f[m];
            }
            let next = x0 + k * sum;
            values[n] = alpha * next + (T::one() - alpha) * values[n];
        }
        values[self.nn - 1] - x1
    }

    /// Evaluate the solution at local time `tau` in [0, 1] from the nodal
    /// values (dense output).
    pub fn ueval(&self, x0: T, values: &[T], tau: T) -> T {
        match self.kind {
            MethodKind::ContinuousGalerkin => {
                let mut sum = x0 * self.trial.eval(0, tau);
                for i in 0..self.nn {
                    sum += values[i] * self.trial.eval(i + 1, tau);
                }
                sum
            }
            MethodKind::DiscontinuousGalerkin => {
                let mut sum = T::zero();
                for i in 0..self.nn {
                    sum += values[i] * self.trial.eval(i, tau);
                }
                sum
            }
        }
    }

    /// Local discretization residual at the right end point, given the
    /// right-hand side value `f` there. The discontinuous variant adds the
    /// jump contribution `[[u]] / k`.
    pub fn residual(&self, x0: T, values: &[T], f: T, k: T) -> T {
        match self.kind {
            MethodKind::ContinuousGalerkin => {
                let mut sum = x0 * self.derivatives[0];
                for i in 0..self.nn {
                    sum += values[i] * self.derivatives[i + 1];
                }
                sum / k - f
            }
            MethodKind::DiscontinuousGalerkin => {
                let mut sum = T::zero();
                for i in 0..self.nn {
                    sum += values[i] * self.derivatives[i];
                }
                let jump = self.ueval(x0, values, T::zero()) - x0;
                (sum + jump) / k - f
            }
        }
    }

    /// Regulate the time step from the residual `r` observed at step `k0`:
    /// the error estimate is driven to `tol` at rate 1 / (q + 1), scaled by
    /// the safety factor and capped at `kmax`.
    pub fn timestep(&self, r: T, tol: T, k0: T, kmax: T) -> T {
        let e = self.error(k0, r);
        if e < T::EPSILON {
            return kmax;
        }
        let p = T::from_usize(self.q + 1).unwrap();
        let k = T::from(SAFETY) * k0 * (tol / e).powf(T::one() / p);
        if k < kmax {
            k
        } else {
            kmax
        }
    }

    /// Local error estimate `C k^(q+1) |r|`.
    pub fn error(&self, k: T, r: T) -> T {
        let p = i32::try_from(self.q + 1).unwrap();
        k.powi(p) * r.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_degree() {
        assert!(Method::<f64>::continuous(0).is_err());
        assert!(Method::<f64>::continuous(1).is_ok());
        assert!(Method::<f64>::discontinuous(0).is_ok());
    }

    #[test]
    fn test_cg1_is_trapezoid() {
        // cG(1) has a single nodal value updated with the trapezoid rule
        let method = Method::<f64>::continuous(1).unwrap();
        assert_eq!(method.nsize(), 1);
        assert_eq!(method.qsize(), 2);
        assert!((method.nweight(0, 0) - 0.5).abs() < 1e-13);
        assert!((method.nweight(0, 1) - 0.5).abs() < 1e-13);
    }

    #[test]
    fn test_dg0_is_backward_euler() {
        let method = Method::<f64>::discontinuous(0).unwrap();
        assert_eq!(method.nsize(), 1);
        assert!((method.qpoint(0) - 1.0).abs() < 1e-13);
        assert!((method.nweight(0, 0) - 1.0).abs() < 1e-13);

        // residual of x = x0 + k f is zero for the linear test equation
        let x0 = 1.0;
        let k = 0.1;
        let lambda = 2.0;
        // solve x = x0 - k lambda x
        let x = x0 / (1.0 + k * lambda);
        let r = method.residual(x0, &[x], -lambda * x, k);
        assert!(r.abs() < 1e-13);
    }

    #[test]
    fn test_dg1_radau_points() {
        let method = Method::<f64>::discontinuous(1).unwrap();
        assert!((method.qpoint(0) - 1.0 / 3.0).abs() < 1e-12);
        assert!((method.qpoint(1) - 1.0).abs() < 1e-12);
        assert!((method.qweight(0) - 0.75).abs() < 1e-12);
        assert!((method.qweight(1) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_update_reproduces_polynomials() {
        // cG(2) integrates f(t) = t^2 exactly: x(1) = x0 + k/3 for k = 1
        let method = Method::<f64>::continuous(2).unwrap();
        let f: Vec<f64> = (0..method.qsize())
            .map(|m| method.qpoint(m) * method.qpoint(m))
            .collect();
        let mut values = vec![0.0; method.nsize()];
        method.update(1.0, &f, 1.0, &mut values, 1.0);
        assert!((values[method.nsize() - 1] - (1.0 + 1.0 / 3.0)).abs() < 1e-12);
    }

    #[test]
    fn test_ueval_at_nodes() {
        let method = Method::<f64>::continuous(2).unwrap();
        let values = vec![1.5, 2.5];
        for n in 0..method.nsize() {
            let v = method.ueval(1.0, &values, method.npoint(n));
            assert!((v - values[n]).abs() < 1e-12);
        }
        // continuity at the left end point
        assert!((method.ueval(1.0, &values, 0.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_timestep_monotone_in_residual() {
        let method = Method::<f64>::continuous(1).unwrap();
        let k_small = method.timestep(1.0, 1e-6, 0.01, 1.0);
        let k_large = method.timestep(1e-4, 1e-6, 0.01, 1.0);
        assert!(k_small < k_large);
        // tiny residual saturates at kmax
        assert_eq!(method.timestep(0.0, 1e-6, 0.01, 1.0), 1.0);
    }
}
