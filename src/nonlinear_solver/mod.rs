use nalgebra::DVector;
use tracing::{debug, warn};

use crate::error::{NonLinearSolverError, SlabsolError};
use crate::jacobian::{assemble_entries, MonoSlabJacobian, MultiSlabJacobian, SlabPreconditioner};
use crate::linear_solver::gmres;
use crate::non_linear_solver_error;
use crate::ode::OdeSystem;
use crate::timeslab::{MonoAdaptiveTimeSlab, MultiAdaptiveTimeSlab};
use crate::{IndexType, Scalar};

// The shared iteration driver: run `iteration` until the increment drops
// below the discrete tolerance, the iteration count is exhausted, or the
// increments grow by a large factor (divergence).
fn iterate<T: Scalar>(
    label: &str,
    tol: T,
    maxiter: IndexType,
    monitor: bool,
    mut iteration: impl FnMut(IndexType) -> Result<T, SlabsolError>,
) -> Result<IndexType, SlabsolError> {
    let mut d0 = T::zero();
    for iter in 0..maxiter {
        let d1 = iteration(iter)?;
        if monitor {
            debug!("--- {} iter = {}: increment = {:.3e}", label, iter, d1.as_f64());
        }
        if d1 < tol {
            return Ok(iter + 1);
        }
        if (iter > 0 && d1 > T::from(1000.0) * d0) || !d1.is_finite() {
            warn!("Time slab system seems to be diverging.");
            return Err(non_linear_solver_error!(Diverged, { iteration: iter }));
        }
        d0 = d1;
    }
    warn!("Time slab system did not converge.");
    Err(non_linear_solver_error!(NoConvergence, { iterations: maxiter }))
}

fn discrete_tolerance<T: Scalar>(ts_tol: T, factor: T) -> T {
    factor * ts_tol
}

/// Damped Picard iteration on the mono-adaptive slab: all stages are
/// re-evaluated from the current iterate, then every nodal block is pulled
/// towards the collocation update.
pub(crate) fn mono_fixed_point<T: Scalar>(
    ts: &mut MonoAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
) -> Result<IndexType, SlabsolError> {
    let tol = discrete_tolerance(ts.adaptivity.tol(), ts.options.discrete_tolerance_factor);
    let maxiter = ts.options.max_iterations;
    let monitor = ts.options.monitor_convergence;
    let mut alpha = ts.options.fixed_point_damping;

    for attempt in 0..2 {
        let result = iterate(
            "fixed-point",
            tol,
            maxiter,
            monitor,
            |_| Ok(mono_sweep(ts, ode, alpha)),
        );
        match result {
            Err(SlabsolError::NonLinearSolverError(NonLinearSolverError::Diverged { .. }))
                if attempt == 0 =>
            {
                // One retry with stronger relaxation, from the flat guess
                alpha *= T::from(0.5);
                warn!(
                    "Restarting diverging fixed-point iteration with damping {}.",
                    alpha.as_f64()
                );
                let u0 = ts.u0.clone();
                for n in 0..ts.method.nsize() {
                    ts.x.rows_mut(n * ts.n, ts.n).copy_from(&u0);
                }
            }
            other => return other,
        }
    }
    Err(non_linear_solver_error!(NoConvergence, { iterations: maxiter }))
}

fn mono_sweep<T: Scalar>(
    ts: &mut MonoAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
    alpha: T,
) -> T {
    let n = ts.n;
    let nn = ts.method.nsize();
    let nq = ts.method.qsize();
    let k = ts.length();

    for m in 0..nq {
        ts.feval(ode, m);
    }

    let mut dmax = T::zero();
    let mut target = DVector::<T>::zeros(n);
    for nd in 0..nn {
        target.copy_from(&ts.u0);
        for m in 0..nq {
            let w = k * ts.method.nweight(nd, m);
            target.axpy(w, &ts.fq.rows(m * n, n).into_owned(), T::one());
        }
        let offset = nd * n;
        for i in 0..n {
            let delta = target[i] - ts.x[offset + i];
            ts.x[offset + i] += alpha * delta;
            if delta.abs() > dmax {
                dmax = delta.abs();
            }
        }
    }
    dmax
}

/// Newton iteration on the mono-adaptive slab with a matrix-free GMRES
/// linear solve. The Jacobian is linearized at the slab start and reused
/// for every iteration of the slab. Supports the implicit form through the
/// mass matrix.
pub(crate) fn mono_newton<T: Scalar>(
    ts: &mut MonoAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
) -> Result<IndexType, SlabsolError> {
    let tol = discrete_tolerance(ts.adaptivity.tol(), ts.options.discrete_tolerance_factor);
    let ktol_factor = ts.options.krylov_tolerance_factor;
    let maxiter = ts.options.max_iterations;
    let monitor = ts.options.monitor_convergence;

    let entries = {
        let u0 = ts.u0.clone();
        assemble_entries(&ts.dependencies, ode, &u0, ts.a)
    };
    let pc = SlabPreconditioner::mono(ts, ode)?;

    // Precompute M u0 for the implicit form
    let mu0 = if ode.has_mass() {
        let u0 = ts.u0.clone();
        let mut out = DVector::zeros(ts.n);
        ode.mass(&u0, &mut out, &u0, ts.a);
        Some(out)
    } else {
        None
    };

    let gmres_max = 2 * ts.x.len() + 100;
    let mut dx = DVector::<T>::zeros(ts.x.len());

    iterate("newton", tol, maxiter, monitor, |_| {
        let b = mono_residual(ts, ode, mu0.as_ref());
        let bnorm = b.norm();
        if bnorm < tol * T::from(0.01) {
            // already converged up to roundoff; skip the linear solve
            ts.x += &b;
            return Ok(b.amax());
        }
        dx.fill(T::zero());
        {
            let jac = MonoSlabJacobian::new(&*ts, ode, entries.as_ref());
            gmres(&jac, &pc, &b, &mut dx, ktol_factor * tol * bnorm.max(T::one()), gmres_max)?;
        }
        ts.x += &dx;
        Ok(dx.amax())
    })
}

// Fixed-point form of the residual, b = Phi(x) - x (or the mass-matrix
// version M u0 + k W f - M x).
fn mono_residual<T: Scalar>(
    ts: &mut MonoAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
    mu0: Option<&DVector<T>>,
) -> DVector<T> {
    let n = ts.n;
    let nn = ts.method.nsize();
    let nq = ts.method.qsize();
    let k = ts.length();

    for m in 0..nq {
        ts.feval(ode, m);
    }

    let mut b = DVector::<T>::zeros(nn * n);
    for nd in 0..nn {
        let offset = nd * n;
        match mu0 {
            Some(mu0) => b.rows_mut(offset, n).copy_from(mu0),
            None => b.rows_mut(offset, n).copy_from(&ts.u0),
        }
        for m in 0..nq {
            let w = k * ts.method.nweight(nd, m);
            let fm = ts.fq.rows(m * n, n).into_owned();
            b.rows_mut(offset, n).axpy(w, &fm, T::one());
        }
    }
    match mu0 {
        Some(_) => {
            // subtract M x_n, with M frozen at the slab start
            let mut z = DVector::zeros(n);
            for nd in 0..nn {
                let offset = nd * n;
                let xn = ts.x.rows(offset, n).into_owned();
                ode.mass(&xn, &mut z, &ts.u0, ts.a);
                b.rows_mut(offset, n).axpy(-T::one(), &z, T::one());
            }
        }
        None => b -= &ts.x,
    }
    b
}

/// Damped Picard sweeps over the multi-adaptive element arena, fine
/// elements first; each element pulls its start value from its
/// predecessor's current end value and samples the other components
/// through dense output.
pub(crate) fn multi_fixed_point<T: Scalar>(
    ts: &mut MultiAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
) -> Result<IndexType, SlabsolError> {
    let tol = discrete_tolerance(ts.adaptivity.tol(), ts.options.discrete_tolerance_factor);
    let maxiter = ts.options.max_iterations;
    let monitor = ts.options.monitor_convergence;
    let mut alpha = ts.options.fixed_point_damping;

    for attempt in 0..2 {
        let result = iterate(
            "fixed-point",
            tol,
            maxiter,
            monitor,
            |_| Ok(multi_sweep(ts, ode, alpha)),
        );
        match result {
            Err(SlabsolError::NonLinearSolverError(NonLinearSolverError::Diverged { .. }))
                if attempt == 0 =>
            {
                alpha *= T::from(0.5);
                warn!(
                    "Restarting diverging fixed-point iteration with damping {}.",
                    alpha.as_f64()
                );
                for eid in 0..ts.elements.len() {
                    let x0 = ts.start_value(eid);
                    let el = &mut ts.elements[eid];
                    el.x0 = x0;
                    el.dofs.fill(x0);
                }
            }
            other => return other,
        }
    }
    Err(non_linear_solver_error!(NoConvergence, { iterations: maxiter }))
}

fn multi_sweep<T: Scalar>(
    ts: &mut MultiAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
    alpha: T,
) -> T {
    let nq = ts.method.qsize();
    let mut fbuf = vec![T::zero(); nq];
    let mut u = DVector::<T>::zeros(ts.n);

    let mut dmax = T::zero();
    for eid in 0..ts.elements.len() {
        let x0 = ts.start_value(eid);
        ts.elements[eid].x0 = x0;
        ts.feval_element(eid, ode, &mut fbuf, &mut u);

        let method = &ts.method;
        let el = &mut ts.elements[eid];
        let k = el.length();
        let increment = method.update(x0, &fbuf, k, &mut el.dofs, alpha);
        if increment.abs() > dmax {
            dmax = increment.abs();
        }
    }
    dmax
}

/// Newton iteration on the multi-adaptive slab: the unknown buffer is the
/// concatenation of all element dofs, the Jacobian acts matrix-free
/// through the dense-output interpolation, and the linear systems are
/// solved by GMRES with the element-block preconditioner.
pub(crate) fn multi_newton<T: Scalar>(
    ts: &mut MultiAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
) -> Result<IndexType, SlabsolError> {
    let tol = discrete_tolerance(ts.adaptivity.tol(), ts.options.discrete_tolerance_factor);
    let ktol_factor = ts.options.krylov_tolerance_factor;
    let maxiter = ts.options.max_iterations;
    let monitor = ts.options.monitor_convergence;

    let entries = {
        let u0 = ts.u0.clone();
        assemble_entries(&ts.dependencies, ode, &u0, ts.a)
    };
    let pc = SlabPreconditioner::multi(ts, ode)?;

    let nn = ts.method.nsize();
    let size = nn * ts.elements.len();
    let gmres_max = 2 * size + 100;
    let mut dx = DVector::<T>::zeros(size);

    iterate("newton", tol, maxiter, monitor, |_| {
        ts.refresh_start_values();
        let b = multi_residual(ts, ode);
        let bnorm = b.norm();
        dx.fill(T::zero());
        {
            let jac = MultiSlabJacobian::new(&*ts, ode, entries.as_ref());
            gmres(&jac, &pc, &b, &mut dx, ktol_factor * tol * bnorm.max(T::one()), gmres_max)?;
        }
        for (eid, el) in ts.elements.iter_mut().enumerate() {
            for nd in 0..nn {
                el.dofs[nd] += dx[eid * nn + nd];
            }
        }
        Ok(dx.amax())
    })
}

fn multi_residual<T: Scalar>(
    ts: &MultiAdaptiveTimeSlab<T>,
    ode: &impl OdeSystem<T>,
) -> DVector<T> {
    let nn = ts.method.nsize();
    let nq = ts.method.qsize();
    let mut fbuf = vec![T::zero(); nq];
    let mut u = DVector::<T>::zeros(ts.n);

    let mut b = DVector::<T>::zeros(nn * ts.elements.len());
    for eid in 0..ts.elements.len() {
        ts.feval_element(eid, ode, &mut fbuf, &mut u);
        let el = &ts.elements[eid];
        let k = el.length();
        for nd in 0..nn {
            let mut sum = el.x0;
            for m in 0..nq {
                sum += k * ts.method.nweight(nd, m) * fbuf[m];
            }
            b[eid * nn + nd] = sum - el.dofs[nd];
        }
    }
    b
}
