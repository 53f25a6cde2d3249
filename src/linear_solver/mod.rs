use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{LinearSolverError, SlabsolError};
use crate::jacobian::{JacobianOperator, SlabPreconditioner};
use crate::linear_solver_error;
use crate::{IndexType, Scalar};

/// Restarted GMRES with right preconditioning: solves `A M^-1 z = b` and
/// returns `x = M^-1 z`, touching `A` only through [JacobianOperator::mult]
/// and `M` only through [SlabPreconditioner::solve].
///
/// `x` holds the initial guess on entry and the solution on exit. Returns
/// the number of operator applications.
pub fn gmres<T: Scalar>(
    op: &dyn JacobianOperator<T>,
    pc: &SlabPreconditioner<T>,
    b: &DVector<T>,
    x: &mut DVector<T>,
    tol: T,
    max_iter: IndexType,
) -> Result<IndexType, SlabsolError> {
    let size = op.size();
    let restart = size.min(30);

    let mut w = DVector::<T>::zeros(size);
    let mut z = DVector::<T>::zeros(size);
    let mut total = 0;

    loop {
        // Residual of the current iterate
        op.mult(x, &mut w)?;
        let r = b - &w;
        let beta = r.norm();
        if beta <= tol {
            return Ok(total);
        }

        let mut basis: Vec<DVector<T>> = Vec::with_capacity(restart + 1);
        basis.push(r / beta);

        let mut h = DMatrix::<T>::zeros(restart + 1, restart);
        let mut cs = vec![T::zero(); restart];
        let mut sn = vec![T::zero(); restart];
        let mut g = DVector::<T>::zeros(restart + 1);
        g[0] = beta;

        let mut j = 0;
        let mut residual = beta;
        while j < restart {
            // Arnoldi step with modified Gram-Schmidt: w = A M^-1 v_j
            pc.solve(&mut z, &basis[j])?;
            op.mult(&z, &mut w)?;
            total += 1;
            for i in 0..=j {
                let hij = w.dot(&basis[i]);
                h[(i, j)] = hij;
                w.axpy(-hij, &basis[i], T::one());
            }
            let hnext = w.norm();
            h[(j + 1, j)] = hnext;

            // Apply the accumulated Givens rotations to the new column,
            // then zero its subdiagonal with one more
            for i in 0..j {
                let t1 = cs[i] * h[(i, j)] + sn[i] * h[(i + 1, j)];
                let t2 = -sn[i] * h[(i, j)] + cs[i] * h[(i + 1, j)];
                h[(i, j)] = t1;
                h[(i + 1, j)] = t2;
            }
            let denom = (h[(j, j)] * h[(j, j)] + hnext * hnext).sqrt();
            if denom > T::zero() {
                cs[j] = h[(j, j)] / denom;
                sn[j] = hnext / denom;
            } else {
                cs[j] = T::one();
                sn[j] = T::zero();
            }
            h[(j, j)] = cs[j] * h[(j, j)] + sn[j] * hnext;
            h[(j + 1, j)] = T::zero();
            g[j + 1] = -sn[j] * g[j];
            g[j] = cs[j] * g[j];

            residual = g[j + 1].abs();
            j += 1;

            if residual <= tol || hnext <= T::EPSILON * beta {
                break;
            }
            basis.push(&w / hnext);
        }

        // Solve the triangular least-squares system and expand the
        // correction back through the preconditioner
        let mut y = vec![T::zero(); j];
        for i in (0..j).rev() {
            let mut sum = g[i];
            for l in (i + 1)..j {
                sum -= h[(i, l)] * y[l];
            }
            if h[(i, i)].abs() > T::EPSILON {
                y[i] = sum / h[(i, i)];
            }
        }
        w.fill(T::zero());
        for (i, yi) in y.iter().enumerate() {
            w.axpy(*yi, &basis[i], T::one());
        }
        pc.solve(&mut z, &w)?;
        *x += &z;

        debug!("GMRES cycle finished: {} iterations, residual {:.3e}.", total, residual.as_f64());

        if residual <= tol {
            return Ok(total);
        }
        if total >= max_iter {
            return Err(linear_solver_error!(KrylovDidNotConverge, {
                iterations: total,
                residual: residual.as_f64(),
            }));
        }
    }
}
