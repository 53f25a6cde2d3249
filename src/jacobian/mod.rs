use nalgebra::{DMatrix, DVector, Dyn};
use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::error::{LinearSolverError, SlabsolError, TimeSlabError};
use crate::method::MethodKind;
use crate::ode::OdeSystem;
use crate::timeslab::{MonoAdaptiveTimeSlab, MultiAdaptiveTimeSlab};
use crate::{Dependencies, IndexType, Scalar};

/// A matrix-free linear operator: the directional derivative of a slab's
/// discrete residual with respect to its unknown buffer. Only its action on
/// a vector is ever available; the matrix is never materialized.
pub trait JacobianOperator<T: Scalar> {
    /// Dimension of the (square) operator.
    fn size(&self) -> IndexType;

    /// Compute `y = J x`. Fails with `StructuralMismatch` when `x` does
    /// not match the unknown layout the operator was built for.
    fn mult(&self, x: &DVector<T>, y: &mut DVector<T>) -> Result<(), SlabsolError>;
}

fn check_layout<T: Scalar>(op: &impl JacobianOperator<T>, x: &DVector<T>) -> Result<(), SlabsolError> {
    if x.len() != op.size() {
        return Err(SlabsolError::from(TimeSlabError::StructuralMismatch {
            expected: op.size(),
            found: x.len(),
        }));
    }
    Ok(())
}

/// Assemble the declared-nonzero Jacobian entries at `(u, t)` into a CSR
/// matrix, or nothing when the dependency pattern is dense (the matrix-free
/// callback is used instead).
pub(crate) fn assemble_entries<T: Scalar>(
    dependencies: &Dependencies,
    ode: &impl OdeSystem<T>,
    u: &DVector<T>,
    t: T,
) -> Option<CsrMatrix<T>> {
    if !dependencies.sparse() {
        return None;
    }
    let n = dependencies.size();
    let mut coo = CooMatrix::new(n, n);
    for i in 0..n {
        for j in dependencies.row(i) {
            coo.push(i, j, ode.dfdu(u, t, i, j));
        }
    }
    Some(CsrMatrix::from(&coo))
}

fn csr_row_dot<T: Scalar>(entries: &CsrMatrix<T>, i: IndexType, x: impl Fn(IndexType) -> T) -> T {
    let row = entries.row(i);
    let mut sum = T::zero();
    for (&j, &v) in row.col_indices().iter().zip(row.values()) {
        sum += v * x(j);
    }
    sum
}

/// Jacobian of the mono-adaptive slab system, linearized at the slab start
/// (piecewise constant in time over the slab): for nodal block n,
///
///     (J v)_n = M v_n - k sum_m w_nm J_f vtilde_m
///
/// where `vtilde_m` is the stage perturbation controlled by the nodal
/// unknowns (zero for the cG start stage) and `M` is the identity for
/// explicit systems.
pub struct MonoSlabJacobian<'a, T: Scalar, O: OdeSystem<T>> {
    ts: &'a MonoAdaptiveTimeSlab<T>,
    ode: &'a O,
    entries: Option<&'a CsrMatrix<T>>,
    epoch: u64,
}

impl<'a, T: Scalar, O: OdeSystem<T>> MonoSlabJacobian<'a, T, O> {
    pub fn new(
        ts: &'a MonoAdaptiveTimeSlab<T>,
        ode: &'a O,
        entries: Option<&'a CsrMatrix<T>>,
    ) -> Self {
        let epoch = ts.epoch;
        Self {
            ts,
            ode,
            entries,
            epoch,
        }
    }

    fn jac_mul(&self, v: &DVector<T>, y: &mut DVector<T>) {
        match self.entries {
            Some(entries) => {
                for i in 0..self.ts.n {
                    y[i] = csr_row_dot(entries, i, |j| v[j]);
                }
            }
            None => self.ode.jacobian_mul(v, y, &self.ts.u0, self.ts.a),
        }
    }
}

impl<T: Scalar, O: OdeSystem<T>> JacobianOperator<T> for MonoSlabJacobian<'_, T, O> {
    fn size(&self) -> IndexType {
        self.ts.method.nsize() * self.ts.n
    }

    fn mult(&self, x: &DVector<T>, y: &mut DVector<T>) -> Result<(), SlabsolError> {
        check_layout(self, x)?;
        debug_assert_eq!(self.epoch, self.ts.epoch);

        let ts = self.ts;
        let n = ts.n;
        let nn = ts.method.nsize();
        let nq = ts.method.qsize();
        let k = ts.length();
        let cg = ts.method.kind() == MethodKind::ContinuousGalerkin;
        let mass = self.ode.has_mass();

        // Directional derivative of the right-hand side at every stage
        let mut jv = vec![DVector::<T>::zeros(n); nq];
        let mut vtilde = DVector::<T>::zeros(n);
        for (m, jvm) in jv.iter_mut().enumerate() {
            if cg && m == 0 {
                continue; // the start stage is controlled by x0, not a dof
            }
            let offset = if cg { (m - 1) * n } else { m * n };
            vtilde.copy_from(&x.rows(offset, n));
            self.jac_mul(&vtilde, jvm);
        }

        let mut yn = DVector::<T>::zeros(n);
        for nd in 0..nn {
            let offset = nd * n;
            if mass {
                vtilde.copy_from(&x.rows(offset, n));
                self.ode.mass(&vtilde, &mut yn, &ts.u0, ts.a);
            } else {
                yn.copy_from(&x.rows(offset, n));
            }
            for (m, jvm) in jv.iter().enumerate() {
                if cg && m == 0 {
                    continue;
                }
                let w = k * ts.method.nweight(nd, m);
                yn.axpy(-w, jvm, T::one());
            }
            y.rows_mut(offset, n).copy_from(&yn);
        }
        Ok(())
    }
}

/// Jacobian of the multi-adaptive slab system, linearized at the slab
/// start. The unknown buffer is the concatenation of all element dofs in
/// arena order; a perturbation propagates between elements through the
/// dense-output interpolation, exactly like the values themselves.
pub struct MultiSlabJacobian<'a, T: Scalar, O: OdeSystem<T>> {
    ts: &'a MultiAdaptiveTimeSlab<T>,
    ode: &'a O,
    entries: Option<&'a CsrMatrix<T>>,
    epoch: u64,
}

impl<'a, T: Scalar, O: OdeSystem<T>> MultiSlabJacobian<'a, T, O> {
    pub fn new(
        ts: &'a MultiAdaptiveTimeSlab<T>,
        ode: &'a O,
        entries: Option<&'a CsrMatrix<T>>,
    ) -> Self {
        let epoch = ts.epoch;
        Self {
            ts,
            ode,
            entries,
            epoch,
        }
    }

    /// Interpolate the perturbation of component `j` at time `t` from the
    /// perturbation dofs in `x` and the chained start-value perturbations.
    fn perturbation(&self, j: IndexType, t: T, x: &DVector<T>, vx0: &[T]) -> T {
        let ts = self.ts;
        let nn = ts.method.nsize();
        let eid = ts.element_at(j, t);
        let el = &ts.elements[eid];
        let tau = (t - el.a) / el.length();
        let dofs = x.as_slice();
        ts.method
            .ueval(vx0[eid], &dofs[eid * nn..(eid + 1) * nn], tau)
    }
}

impl<T: Scalar, O: OdeSystem<T>> JacobianOperator<T> for MultiSlabJacobian<'_, T, O> {
    fn size(&self) -> IndexType {
        self.ts.method.nsize() * self.ts.elements.len()
    }

    fn mult(&self, x: &DVector<T>, y: &mut DVector<T>) -> Result<(), SlabsolError> {
        check_layout(self, x)?;
        debug_assert_eq!(self.epoch, self.ts.epoch);

        let ts = self.ts;
        let nn = ts.method.nsize();
        let nq = ts.method.qsize();

        // Start-value perturbation of every element: the end-point
        // perturbation of its predecessor, zero at the slab start
        let vx0: Vec<T> = ts
            .elements
            .iter()
            .map(|el| match el.prev {
                Some(p) => x[p * nn + nn - 1],
                None => T::zero(),
            })
            .collect();

        let mut jvq = vec![T::zero(); nq];
        let mut pert = DVector::<T>::zeros(ts.n);
        let mut jfull = DVector::<T>::zeros(ts.n);
        for (eid, el) in ts.elements.iter().enumerate() {
            let i = el.index;
            let k = el.length();
            for (m, jv) in jvq.iter_mut().enumerate() {
                let tm = el.a + ts.method.qpoint(m) * k;
                *jv = match self.entries {
                    Some(entries) => {
                        csr_row_dot(entries, i, |j| self.perturbation(j, tm, x, &vx0))
                    }
                    None => {
                        for j in 0..ts.n {
                            pert[j] = self.perturbation(j, tm, x, &vx0);
                        }
                        self.ode.jacobian_mul(&pert, &mut jfull, &ts.u0, ts.a);
                        jfull[i]
                    }
                };
            }
            for nd in 0..nn {
                let mut sum = vx0[eid];
                for (m, jv) in jvq.iter().enumerate() {
                    sum += k * ts.method.nweight(nd, m) * *jv;
                }
                // derivative of (x0 + k sum w f) - dof
                y[eid * nn + nd] = x[eid * nn + nd] - sum;
            }
        }
        Ok(())
    }
}

struct Block<T: Scalar> {
    indices: Vec<IndexType>,
    lu: nalgebra::LU<T, Dyn, Dyn>,
}

/// Approximate inverse of a slab Jacobian built from its block-diagonal
/// part: one small dense block per component (mono) or per element
/// (multi). Coupling between blocks is lagged to the outer Krylov
/// iteration, which is what keeps Newton tractable on multi-rate systems
/// without a global factorization.
pub struct SlabPreconditioner<T: Scalar> {
    size: IndexType,
    blocks: Vec<Block<T>>,
}

impl<T: Scalar> SlabPreconditioner<T> {
    /// No preconditioning.
    pub fn identity(size: IndexType) -> Self {
        Self {
            size,
            blocks: Vec::new(),
        }
    }

    /// Block preconditioner for the mono-adaptive slab: for component i
    /// the block is `m_ii I - k d_ii B`, with `B` the method's stage
    /// weight map and the diagonal entries frozen at the slab start.
    pub fn mono<O: OdeSystem<T>>(
        ts: &MonoAdaptiveTimeSlab<T>,
        ode: &O,
    ) -> Result<Self, SlabsolError> {
        let n = ts.n;
        let nn = ts.method.nsize();
        let k = ts.length();
        let bmat = ts.method.stage_weights();
        let mass = ode.has_mass();

        let mut unit = DVector::<T>::zeros(n);
        let mut me = DVector::<T>::zeros(n);
        let mut blocks = Vec::with_capacity(n);
        for i in 0..n {
            let d = ode.dfdu(&ts.u0, ts.a, i, i);
            let m = if mass {
                unit[i] = T::one();
                ode.mass(&unit, &mut me, &ts.u0, ts.a);
                unit[i] = T::zero();
                me[i]
            } else {
                T::one()
            };
            let mut a = DMatrix::<T>::from_diagonal_element(nn, nn, m);
            a -= &bmat * (k * d);
            let lu = a.lu();
            if !lu.is_invertible() {
                return Err(SlabsolError::from(LinearSolverError::PreconditionerSingular {
                    index: i,
                }));
            }
            blocks.push(Block {
                indices: (0..nn).map(|nd| nd * n + i).collect(),
                lu,
            });
        }
        Ok(Self {
            size: nn * n,
            blocks,
        })
    }

    /// Block preconditioner for the multi-adaptive slab: one block per
    /// element, `I - k_e d_ii B`, the block-diagonal induced by the
    /// partition groups.
    pub fn multi<O: OdeSystem<T>>(
        ts: &MultiAdaptiveTimeSlab<T>,
        ode: &O,
    ) -> Result<Self, SlabsolError> {
        let nn = ts.method.nsize();
        let bmat = ts.method.stage_weights();

        let mut blocks = Vec::with_capacity(ts.elements.len());
        for (eid, el) in ts.elements.iter().enumerate() {
            let d = ode.dfdu(&ts.u0, ts.a, el.index, el.index);
            let mut a = DMatrix::<T>::identity(nn, nn);
            a -= &bmat * (el.length() * d);
            let lu = a.lu();
            if !lu.is_invertible() {
                return Err(SlabsolError::from(LinearSolverError::PreconditionerSingular {
                    index: el.index,
                }));
            }
            blocks.push(Block {
                indices: (0..nn).map(|nd| eid * nn + nd).collect(),
                lu,
            });
        }
        Ok(Self {
            size: nn * ts.elements.len(),
            blocks,
        })
    }

    pub fn size(&self) -> IndexType {
        self.size
    }

    /// Solve `M x = b` approximately, block by block.
    pub fn solve(&self, x: &mut DVector<T>, b: &DVector<T>) -> Result<(), SlabsolError> {
        x.copy_from(b);
        for block in &self.blocks {
            let nb = block.indices.len();
            let rhs = DVector::from_fn(nb, |r, _| b[block.indices[r]]);
            let sol = block
                .lu
                .solve(&rhs)
                .expect("preconditioner blocks checked invertible at assembly");
            for (r, &idx) in block.indices.iter().enumerate() {
                x[idx] = sol[r];
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::test_models::{ExponentialDecay, StiffDecay};
    use crate::ode::{AdaptivityKind, OdeOptions};
    use crate::timeslab::PreviousState;

    #[test]
    fn test_mono_jacobian_action_on_linear_decay() {
        // dG(0) on u' = -lambda u: J = 1 + k lambda exactly
        let ode = ExponentialDecay::new(2.0, 1.0);
        let options = OdeOptions::new()
            .method(crate::method::MethodKind::DiscontinuousGalerkin)
            .degree(0);
        let mut ts =
            MonoAdaptiveTimeSlab::new(&ode, options, Dependencies::new(1)).unwrap();
        let state = PreviousState::new(&ode);
        ts.build(&state, 0.0, 1.0, &ode).unwrap();
        let k = ts.length();

        let jac = MonoSlabJacobian::new(&ts, &ode, None);
        let x = DVector::from_vec(vec![1.0]);
        let mut y = DVector::zeros(1);
        jac.mult(&x, &mut y).unwrap();
        assert!((y[0] - (1.0 + 2.0 * k)).abs() < 1e-7);
    }

    #[test]
    fn test_stale_operator_is_rejected() {
        let ode = ExponentialDecay::new(1.0, 1.0);
        let mut ts =
            MonoAdaptiveTimeSlab::new(&ode, OdeOptions::new(), Dependencies::new(1)).unwrap();
        let state = PreviousState::new(&ode);
        ts.build(&state, 0.0, 1.0, &ode).unwrap();
        let jac = MonoSlabJacobian::new(&ts, &ode, None);
        // a vector from a different layout must be refused
        let x = DVector::zeros(ts.method.nsize() + 3);
        let mut y = DVector::zeros(ts.method.nsize() + 3);
        assert!(matches!(
            jac.mult(&x, &mut y),
            Err(SlabsolError::TimeSlabError(
                TimeSlabError::StructuralMismatch { .. }
            ))
        ));
    }

    #[test]
    fn test_sparse_assembly_uses_declared_entries() {
        let ode = StiffDecay::new(1.0, 1000.0);
        let mut deps = Dependencies::new(2);
        ode.sparsity(&mut deps);
        let u = DVector::from_vec(vec![1.0, 1.0]);
        let entries = assemble_entries(&deps, &ode, &u, 0.0).unwrap();
        assert_eq!(entries.nnz(), 2);
        assert!((csr_row_dot(&entries, 0, |_| 1.0) + 1.0).abs() < 1e-12);
        assert!((csr_row_dot(&entries, 1, |_| 1.0) + 1000.0).abs() < 1e-12);
    }

    #[test]
    fn test_multi_preconditioner_inverts_decoupled_system() {
        let ode = StiffDecay::new(1.0, 1000.0);
        let options = OdeOptions::new().adaptivity(AdaptivityKind::Multi);
        let mut ts =
            MultiAdaptiveTimeSlab::new(&ode, options, Dependencies::new(2)).unwrap();
        let state = PreviousState::new(&ode);
        ts.build(&state, 0.0, 1.0, &ode).unwrap();

        // the system is diagonal, so the block preconditioner is the exact
        // inverse of the Jacobian
        let pc = SlabPreconditioner::multi(&ts, &ode).unwrap();
        let jac = MultiSlabJacobian::new(&ts, &ode, None);
        let n = jac.size();
        let b = DVector::from_element(n, 1.0);
        let mut x = DVector::zeros(n);
        pc.solve(&mut x, &b).unwrap();
        let mut back = DVector::zeros(n);
        jac.mult(&x, &mut back).unwrap();
        for r in 0..n {
            assert!((back[r] - 1.0).abs() < 1e-6, "row {}: {}", r, back[r]);
        }
    }
}
