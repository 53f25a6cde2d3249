use crate::{IndexType, Scalar};

/// Lagrange basis on a fixed set of interpolation points.
///
/// Basis function `i` is one at point `i` and zero at all other points.
#[derive(Clone, Debug)]
pub struct Lagrange<T: Scalar> {
    points: Vec<T>,
    constants: Vec<T>,
}

impl<T: Scalar> Lagrange<T> {
    pub fn from_points(points: Vec<T>) -> Self {
        let n = points.len();
        let mut constants = vec![T::one(); n];
        for i in 0..n {
            let mut product = T::one();
            for j in 0..n {
                if j != i {
                    product *= points[i] - points[j];
                }
            }
            constants[i] = T::one() / product;
        }
        Self { points, constants }
    }

    pub fn degree(&self) -> IndexType {
        self.points.len() - 1
    }

    pub fn point(&self, i: IndexType) -> T {
        self.points[i]
    }

    /// Evaluate basis function `i` at `x`.
    pub fn eval(&self, i: IndexType, x: T) -> T {
        let mut product = self.constants[i];
        for j in 0..self.points.len() {
            if j != i {
                product *= x - self.points[j];
            }
        }
        product
    }

    /// Evaluate the derivative of basis function `i` at `x`.
    pub fn ddx(&self, i: IndexType, x: T) -> T {
        let mut sum = T::zero();
        for k in 0..self.points.len() {
            if k == i {
                continue;
            }
            let mut product = T::one();
            for j in 0..self.points.len() {
                if j != i && j != k {
                    product *= x - self.points[j];
                }
            }
            sum += product;
        }
        self.constants[i] * sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_of_unity() {
        let basis = Lagrange::from_points(vec![0.0, 0.5, 1.0]);
        for &x in &[0.0, 0.1, 0.33, 0.9, 1.0] {
            let sum: f64 = (0..3).map(|i| basis.eval(i, x)).sum();
            assert!((sum - 1.0).abs() < 1e-14);
        }
    }

    #[test]
    fn test_nodal_property() {
        let basis = Lagrange::from_points(vec![0.0, 0.5, 1.0]);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((basis.eval(i, basis.point(j)) - expected).abs() < 1e-14);
            }
        }
    }

    #[test]
    fn test_linear_derivative() {
        // basis on {0, 1}: dphi_0/dx = -1, dphi_1/dx = 1
        let basis = Lagrange::from_points(vec![0.0, 1.0]);
        assert!((basis.ddx(0, 0.3) + 1.0).abs() < 1e-14);
        assert!((basis.ddx(1, 0.3) - 1.0).abs() < 1e-14);
    }
}
