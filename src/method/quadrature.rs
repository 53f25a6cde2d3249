use nalgebra::{DMatrix, DVector};

use crate::error::{MethodError, SlabsolError};
use crate::{IndexType, Scalar};

/// Legendre polynomial P_n evaluated by the three-term recurrence.
fn legendre<T: Scalar>(n: IndexType, x: T) -> T {
    if n == 0 {
        return T::one();
    }
    let mut p0 = T::one();
    let mut p1 = x;
    for k in 1..n {
        let kk = T::from_usize(k).unwrap();
        let p2 = ((T::from(2.0) * kk + T::one()) * x * p1 - kk * p0) / (kk + T::one());
        p0 = p1;
        p1 = p2;
    }
    p1
}

/// Derivative of the Legendre polynomial P_n, valid away from x = +-1.
fn legendre_ddx<T: Scalar>(n: IndexType, x: T) -> T {
    if n == 0 {
        return T::zero();
    }
    let nn = T::from_usize(n).unwrap();
    nn / (x * x - T::one()) * (x * legendre(n, x) - legendre(n - 1, x))
}

/// Second derivative of P_n from the Legendre differential equation.
fn legendre_d2dx<T: Scalar>(n: IndexType, x: T) -> T {
    let nn = T::from_usize(n).unwrap();
    (T::from(2.0) * x * legendre_ddx(n, x) - nn * (nn + T::one()) * legendre(n, x))
        / (T::one() - x * x)
}

/// Find the roots of `f` in (-1, 1) by stepping to a sign change and
/// polishing with Newton's method, the way the original Radau rule is
/// computed when no good initial approximation is known.
fn scan_roots<T: Scalar>(
    count: IndexType,
    step0: T,
    f: impl Fn(T) -> T,
    dfdx: impl Fn(T) -> T,
) -> Vec<T> {
    let mut roots = Vec::with_capacity(count);
    let mut step = step0;
    let mut x = -T::one() + step;
    let mut sign = if f(x) > T::zero() { T::one() } else { -T::one() };
    for i in 0..count {
        // Step to a sign change
        while f(x) * sign > T::zero() {
            x += step;
        }
        // Newton's method
        for _ in 0..100 {
            let dx = -f(x) / dfdx(x);
            x += dx;
            if dx.abs() <= T::from(10.0) * T::EPSILON {
                break;
            }
        }
        roots.push(x);
        // Keep the step below the root separation seen so far
        if i > 0 && step > (roots[i] - roots[i - 1]) / T::from(10.0) {
            step = (roots[i] - roots[i - 1]) / T::from(10.0);
        }
        sign = -sign;
        x += step;
    }
    roots
}

/// Compute quadrature weights for the given points on [-1, 1] by solving
/// the Legendre moment system: the rule must integrate P_0, ..., P_{n-1}
/// exactly, and all those integrals vanish except for P_0.
fn moment_weights<T: Scalar>(points: &[T]) -> Vec<T> {
    let n = points.len();
    let mut a = DMatrix::<T>::zeros(n, n);
    let mut b = DVector::<T>::zeros(n);
    for i in 0..n {
        for j in 0..n {
            a[(i, j)] = legendre(i, points[j]);
        }
    }
    b[0] = T::from(2.0);
    let lu = a.lu();
    let w = lu.solve(&b).expect("Legendre moment system is nonsingular");
    w.iter().copied().collect()
}

/// Check that the rule integrates the Legendre polynomial of degree `q`
/// exactly (2 for q = 0, zero otherwise).
fn check<T: Scalar>(points: &[T], weights: &[T], q: IndexType) -> bool {
    let mut sum = T::zero();
    for (x, w) in points.iter().zip(weights.iter()) {
        sum += *w * legendre(q, *x);
    }
    let expected = if q == 0 { T::from(2.0) } else { T::zero() };
    (sum - expected).abs() < T::from(100.0) * T::EPSILON
}

/// Lobatto quadrature on [-1, 1]: the end points plus the zeros of
/// P'_{n-1}. Exact for polynomials of degree 2n - 3.
pub struct LobattoQuadrature<T: Scalar> {
    pub points: Vec<T>,
    pub weights: Vec<T>,
}

impl<T: Scalar> LobattoQuadrature<T> {
    pub fn new(n: IndexType) -> Result<Self, SlabsolError> {
        assert!(n >= 2);
        let mut points = Vec::with_capacity(n);
        points.push(-T::one());
        if n > 2 {
            let step = T::from(2.0) / (T::from_usize((n - 2) * 10).unwrap());
            let interior = scan_roots(
                n - 2,
                step,
                |x| legendre_ddx(n - 1, x),
                |x| legendre_d2dx(n - 1, x),
            );
            points.extend(interior);
        }
        points.push(T::one());
        let weights = moment_weights(&points);
        if n > 2 && !check(&points, &weights, 2 * n - 3) {
            return Err(SlabsolError::from(MethodError::QuadratureCheckFailed { n }));
        }
        Ok(Self { points, weights })
    }

    pub fn size(&self) -> IndexType {
        self.points.len()
    }

    pub fn point(&self, i: IndexType) -> T {
        self.points[i]
    }

    pub fn weight(&self, i: IndexType) -> T {
        self.weights[i]
    }
}

/// Radau quadrature on [-1, 1]: the left end point plus the zeros of
/// (P_{n-1} + P_n) / (1 + x). Exact for polynomials of degree 2n - 2.
pub struct RadauQuadrature<T: Scalar> {
    pub points: Vec<T>,
    pub weights: Vec<T>,
}

impl<T: Scalar> RadauQuadrature<T> {
    pub fn new(n: IndexType) -> Result<Self, SlabsolError> {
        assert!(n >= 1);
        let mut points = Vec::with_capacity(n);
        points.push(-T::one());
        if n > 1 {
            let step = T::from(2.0) / (T::from_usize((n - 1) * 10).unwrap());
            let interior = scan_roots(
                n - 1,
                step,
                |x| legendre(n - 1, x) + legendre(n, x),
                |x| legendre_ddx(n - 1, x) + legendre_ddx(n, x),
            );
            points.extend(interior);
        }
        let weights = moment_weights(&points);
        if n > 1 && !check(&points, &weights, 2 * n - 2) {
            return Err(SlabsolError::from(MethodError::QuadratureCheckFailed { n }));
        }
        Ok(Self { points, weights })
    }

    pub fn size(&self) -> IndexType {
        self.points.len()
    }

    pub fn point(&self, i: IndexType) -> T {
        self.points[i]
    }

    pub fn weight(&self, i: IndexType) -> T {
        self.weights[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lobatto_two_points() {
        let quad = LobattoQuadrature::<f64>::new(2).unwrap();
        assert_eq!(quad.points, vec![-1.0, 1.0]);
        assert!((quad.weights[0] - 1.0).abs() < 1e-14);
        assert!((quad.weights[1] - 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_lobatto_three_points() {
        let quad = LobattoQuadrature::<f64>::new(3).unwrap();
        assert!((quad.points[1]).abs() < 1e-13);
        assert!((quad.weights[0] - 1.0 / 3.0).abs() < 1e-13);
        assert!((quad.weights[1] - 4.0 / 3.0).abs() < 1e-13);
        assert!((quad.weights[2] - 1.0 / 3.0).abs() < 1e-13);
    }

    #[test]
    fn test_radau_one_point() {
        let quad = RadauQuadrature::<f64>::new(1).unwrap();
        assert_eq!(quad.points, vec![-1.0]);
        assert!((quad.weights[0] - 2.0).abs() < 1e-14);
    }

    #[test]
    fn test_radau_two_points() {
        let quad = RadauQuadrature::<f64>::new(2).unwrap();
        assert!((quad.points[1] - 1.0 / 3.0).abs() < 1e-13);
        assert!((quad.weights[0] - 0.5).abs() < 1e-13);
        assert!((quad.weights[1] - 1.5).abs() < 1e-13);
    }

    #[test]
    fn test_exactness() {
        // 4-point Lobatto integrates degree 5 exactly: int_{-1}^{1} x^4 = 2/5
        let quad = LobattoQuadrature::<f64>::new(4).unwrap();
        let integral: f64 = quad
            .points
            .iter()
            .zip(quad.weights.iter())
            .map(|(x, w)| w * x.powi(4))
            .sum();
        assert!((integral - 0.4).abs() < 1e-13);
    }
}
