use nalgebra::DVector;
use tracing::{debug, warn};

use crate::adaptivity::MultiAdaptivity;
use crate::error::SlabsolError;
use crate::method::Method;
use crate::nonlinear_solver;
use crate::ode::{OdeOptions, OdeSystem, Sample, SolverKind};
use crate::partition::Partition;
use crate::timeslab::{require_state, PreviousState, SlabState};
use crate::{Dependencies, IndexType, Scalar};

/// One element: the nodal values of a single component over one local
/// interval `[a, b)`.
pub(crate) struct Element<T: Scalar> {
    /// Component index.
    pub index: IndexType,
    pub a: T,
    pub b: T,
    /// Start value, the end value of `prev` (or the slab start value).
    pub x0: T,
    /// Nodal values, `nsize` of them.
    pub dofs: Vec<T>,
    /// Previous element of the same component within this slab.
    pub prev: Option<IndexType>,
    /// End-point residual from the last `check`.
    pub r: T,
}

impl<T: Scalar> Element<T> {
    pub fn length(&self) -> T {
        self.b - self.a
    }

    pub fn endval(&self) -> T {
        self.dofs[self.dofs.len() - 1]
    }
}

/// One level of the recursive discretization: a group of components
/// advancing together over `[a, b)`, plus a sequence of child slabs
/// covering the same interval for the components deferred to finer steps.
pub(crate) struct SubSlab<T: Scalar> {
    pub a: T,
    pub b: T,
    /// Positions `[offset, end)` in the partition ordering held at this
    /// level.
    pub offset: IndexType,
    pub end: IndexType,
    /// Arena ids of this level's elements.
    pub elements: Vec<IndexType>,
    pub children: Vec<SubSlab<T>>,
}

/// A time slab with individual steps per component: a tree of nested
/// sub-slabs where depth corresponds to step-size level, flattened into an
/// element arena ordered children-first (fine elements before the coarse
/// elements that span them).
pub struct MultiAdaptiveTimeSlab<T: Scalar> {
    pub(crate) n: IndexType,
    pub(crate) a: T,
    pub(crate) b: T,
    pub(crate) method: Method<T>,
    pub(crate) options: OdeOptions<T>,
    pub(crate) dependencies: Dependencies,
    pub(crate) adaptivity: MultiAdaptivity<T>,
    pub(crate) partition: Partition<T>,
    pub(crate) elements: Vec<Element<T>>,
    pub(crate) root: Option<SubSlab<T>>,
    /// Per component: its elements in time order.
    pub(crate) elist: Vec<Vec<IndexType>>,
    pub(crate) u0: DVector<T>,
    pub(crate) rmax: T,
    pub(crate) state: SlabState,
    pub(crate) epoch: u64,
    /// Depth of the slab tree from the last build.
    pub(crate) depth: IndexType,
}

impl<T: Scalar> MultiAdaptiveTimeSlab<T> {
    pub fn new(
        ode: &impl OdeSystem<T>,
        options: OdeOptions<T>,
        dependencies: Dependencies,
    ) -> Result<Self, SlabsolError> {
        let n = ode.size();
        let method = Method::new(options.method, options.degree)?;
        let adaptivity = MultiAdaptivity::new(ode, &options);
        let partition = Partition::new(n, options.partitioning_threshold);
        Ok(Self {
            n,
            a: T::zero(),
            b: T::zero(),
            method,
            options,
            dependencies,
            adaptivity,
            partition,
            elements: Vec::new(),
            root: None,
            elist: vec![Vec::new(); n],
            u0: DVector::zeros(n),
            rmax: T::zero(),
            state: SlabState::Empty,
            epoch: 0,
            depth: 0,
        })
    }

    pub(crate) fn build(
        &mut self,
        state: &PreviousState<T>,
        a: T,
        b: T,
        _ode: &impl OdeSystem<T>,
    ) -> Result<T, SlabsolError> {
        require_state(
            "Empty or Rejected",
            self.state,
            matches!(self.state, SlabState::Empty | SlabState::Rejected),
        )?;

        self.u0.copy_from(&state.u);
        self.elements.clear();
        for list in self.elist.iter_mut() {
            list.clear();
        }
        self.epoch += 1;
        self.rmax = T::zero();
        self.depth = 0;

        let root = self.create_slab(a, b, 0, 1);
        self.a = root.a;
        self.b = root.b;
        let b = root.b;
        self.root = Some(root);

        debug!(
            "Built multi-adaptive time slab on [{}, {}]: {} elements, depth {}.",
            self.a.as_f64(),
            self.b.as_f64(),
            self.elements.len(),
            self.depth
        );

        self.state = SlabState::Built;
        Ok(b)
    }

    // Create the sub-slab for partition positions [offset, N) over the
    // requested interval: partition off the coarse group, recursively cover
    // the interval with child slabs for the finer remainder, then span the
    // interval with one element per coarse component.
    fn create_slab(&mut self, a: T, b: T, offset: IndexType, depth: IndexType) -> SubSlab<T> {
        if depth > self.depth {
            self.depth = depth;
        }

        let (end, k) = self.partition.update(offset, b - a, &self.adaptivity);

        // Shorten the slab to the group step unless the requested end time
        // is within reach
        let b = if k < self.options.interval_threshold * (b - a) {
            a + k
        } else {
            b
        };

        // Cover [a, b) for the components with smaller time steps
        let mut children = Vec::new();
        if end < self.partition.size() {
            let mut t = a;
            loop {
                let child = self.create_slab(t, b, end, depth + 1);
                t = child.b;
                children.push(child);
                if t >= b {
                    break;
                }
            }
        }

        // Create the elements for the components with large time steps
        let mut elements = Vec::with_capacity(end - offset);
        for pos in offset..end {
            let i = self.partition.index(pos);
            let prev = self.elist[i].last().copied();
            let x0 = match prev {
                Some(p) => self.elements[p].endval(),
                None => self.u0[i],
            };
            let id = self.elements.len();
            self.elements.push(Element {
                index: i,
                a,
                b,
                x0,
                dofs: vec![x0; self.method.nsize()],
                prev,
                r: T::zero(),
            });
            self.elist[i].push(id);
            elements.push(id);
        }

        SubSlab {
            a,
            b,
            offset,
            end,
            elements,
            children,
        }
    }

    pub(crate) fn solve(&mut self, ode: &impl OdeSystem<T>) -> Result<IndexType, SlabsolError> {
        require_state("Built", self.state, self.state == SlabState::Built)?;
        let result = match self.options.solver {
            SolverKind::FixedPoint => nonlinear_solver::multi_fixed_point(self, ode),
            SolverKind::NewtonKrylov => nonlinear_solver::multi_newton(self, ode),
            SolverKind::Auto => {
                nonlinear_solver::multi_fixed_point(self, ode).or_else(|err| {
                    warn!("Fixed-point iteration failed ({}), retrying with Newton.", err);
                    nonlinear_solver::multi_newton(self, ode)
                })
            }
        };
        match result {
            Ok(iterations) => {
                self.refresh_start_values();
                self.state = SlabState::Solved;
                Ok(iterations)
            }
            Err(err) => {
                // the failed attempt is discarded; a rebuild is allowed
                self.state = SlabState::Rejected;
                Err(err)
            }
        }
    }

    pub(crate) fn check(
        &mut self,
        ode: &impl OdeSystem<T>,
        first: bool,
    ) -> Result<bool, SlabsolError> {
        require_state("Solved", self.state, self.state == SlabState::Solved)?;

        self.refresh_start_values();

        // End-point residual of every element in the tree
        let mut u = DVector::zeros(self.n);
        for eid in 0..self.elements.len() {
            let (i, b0, k) = {
                let el = &self.elements[eid];
                (el.index, el.b, el.length())
            };
            self.interpolate_state(b0, &mut u);
            let fi = ode.f_component(&u, b0, i);
            let el = &self.elements[eid];
            let r = self.method.residual(el.x0, &el.dofs, fi, k);
            self.elements[eid].r = r;
        }

        // Per component: the worst element drives both the verdict and the
        // next target step
        let mut accepted = true;
        let mut rmax = T::zero();
        for i in 0..self.n {
            let mut worst: Option<(T, T, T)> = None; // (error, k, r)
            for &eid in &self.elist[i] {
                let el = &self.elements[eid];
                let e = self.method.error(el.length(), el.r);
                if worst.map(|(w, _, _)| e > w).unwrap_or(true) {
                    worst = Some((e, el.length(), el.r));
                }
            }
            let (e, k, r) = worst.expect("every component is covered by the slab tree");
            let r = r.abs();
            if r > rmax {
                rmax = r;
            }
            if !self.options.fixed && e > self.adaptivity.tol() {
                accepted = false;
            }
            self.adaptivity
                .update_component(i, k, r, &self.method, first);
        }
        self.rmax = rmax;

        self.state = if accepted {
            SlabState::Accepted
        } else {
            SlabState::Rejected
        };
        Ok(accepted)
    }

    pub(crate) fn shift(
        &mut self,
        state: &mut PreviousState<T>,
        ode: &mut impl OdeSystem<T>,
        end: bool,
    ) -> Result<bool, SlabsolError> {
        require_state("Accepted", self.state, self.state == SlabState::Accepted)?;

        // End values of the last element of every component become the
        // start values of the next slab. The construction covers [a, b)
        // for every component; anything else is a truncated discretization.
        let eps = T::from(100.0) * T::EPSILON * self.length();
        for i in 0..self.n {
            let last = *self.elist[i].last().expect("component covered");
            let el = &self.elements[last];
            if (el.b - self.b).abs() > eps {
                warn!(
                    "Component {} was truncated at t = {} before the slab end time {}.",
                    i,
                    el.b.as_f64(),
                    self.b.as_f64()
                );
            }
            state.u[i] = el.endval();
        }
        state.t = self.b;

        let proceed = ode.update(&state.u, self.b, end);
        self.state = SlabState::Empty;
        Ok(proceed)
    }

    pub(crate) fn length(&self) -> T {
        self.b - self.a
    }

    /// Recompute every element's start value from its predecessor's
    /// current end value.
    pub(crate) fn refresh_start_values(&mut self) {
        for eid in 0..self.elements.len() {
            let x0 = self.start_value(eid);
            self.elements[eid].x0 = x0;
        }
    }

    pub(crate) fn start_value(&self, eid: IndexType) -> T {
        match self.elements[eid].prev {
            Some(p) => self.elements[p].endval(),
            None => self.u0[self.elements[eid].index],
        }
    }

    /// The element of component `i` covering time `t`.
    pub(crate) fn element_at(&self, i: IndexType, t: T) -> IndexType {
        let ids = &self.elist[i];
        let pos = ids.partition_point(|&e| self.elements[e].b < t);
        ids[pos.min(ids.len() - 1)]
    }

    /// Dense output for a single component: components at different rates
    /// sample each other's state through this without sharing a grid.
    pub(crate) fn usample(&self, i: IndexType, t: T) -> T {
        let el = &self.elements[self.element_at(i, t)];
        let tau = (t - el.a) / el.length();
        self.method.ueval(el.x0, &el.dofs, tau)
    }

    pub(crate) fn ksample(&self, i: IndexType, t: T) -> T {
        self.elements[self.element_at(i, t)].length()
    }

    pub(crate) fn rsample(&self, i: IndexType, t: T) -> T {
        self.elements[self.element_at(i, t)].r
    }

    /// Interpolate the full state vector at time `t`.
    pub(crate) fn interpolate_state(&self, t: T, u: &mut DVector<T>) {
        for i in 0..self.n {
            u[i] = self.usample(i, t);
        }
    }

    /// Evaluate the right-hand side of element `eid` at its quadrature
    /// points, sampling all other components at the local quadrature times.
    pub(crate) fn feval_element(
        &self,
        eid: IndexType,
        ode: &impl OdeSystem<T>,
        fbuf: &mut [T],
        u: &mut DVector<T>,
    ) {
        let (i, a0, k) = {
            let el = &self.elements[eid];
            (el.index, el.a, el.length())
        };
        for m in 0..self.method.qsize() {
            let tm = a0 + self.method.qpoint(m) * k;
            self.interpolate_state(tm, u);
            fbuf[m] = ode.f_component(u, tm, i);
        }
    }

    pub(crate) fn sample(&self, _ode: &impl OdeSystem<T>, t: T) -> Sample<T> {
        let n = self.n;
        let u = DVector::from_fn(n, |i, _| self.usample(i, t));
        let k = DVector::from_fn(n, |i, _| self.ksample(i, t));
        let r = DVector::from_fn(n, |i, _| self.rsample(i, t));
        Sample::new(t, u, k, r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::test_models::StiffDecay;
    use crate::ode::AdaptivityKind;

    fn build_slab(
        options: OdeOptions<f64>,
    ) -> (
        StiffDecay<f64>,
        MultiAdaptiveTimeSlab<f64>,
        PreviousState<f64>,
    ) {
        let ode = StiffDecay::new(1.0, 1000.0);
        let deps = Dependencies::new(2);
        let slab = MultiAdaptiveTimeSlab::new(&ode, options, deps).unwrap();
        let state = PreviousState::new(&ode);
        (ode, slab, state)
    }

    fn options() -> OdeOptions<f64> {
        OdeOptions::new().adaptivity(AdaptivityKind::Multi)
    }

    #[test]
    fn test_uniform_hints_build_flat_tree() {
        let ode = StiffDecay::new(1.0, 1.0);
        let deps = Dependencies::new(2);
        let mut slab =
            MultiAdaptiveTimeSlab::new(&ode, options().initial_step(0.01), deps).unwrap();
        let state = PreviousState::new(&ode);
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        assert_eq!(slab.depth, 1);
        assert_eq!(slab.elements.len(), 2);
        assert!(slab.root.as_ref().unwrap().children.is_empty());
    }

    #[test]
    fn test_separated_hints_build_nested_tree() {
        struct TwoRates;
        impl crate::ode::OdeSystem<f64> for TwoRates {
            fn size(&self) -> usize {
                2
            }
            fn endtime(&self) -> f64 {
                1.0
            }
            fn u0(&self, u: &mut DVector<f64>) {
                u.fill(1.0);
            }
            fn f(&self, _u: &DVector<f64>, _t: f64, y: &mut DVector<f64>) {
                y.fill(0.0);
            }
            fn timestep_component(&self, _t: f64, i: usize, _k0: f64) -> f64 {
                if i == 0 {
                    0.08
                } else {
                    0.001
                }
            }
        }
        let ode = TwoRates;
        let deps = Dependencies::new(2);
        let mut slab = MultiAdaptiveTimeSlab::new(&ode, options(), deps).unwrap();
        let state = PreviousState::new(&ode);
        let b = slab.build(&state, 0.0, 1.0, &ode).unwrap();
        assert!((b - 0.08).abs() < 1e-12);
        assert_eq!(slab.depth, 2);
        // component 0 spans the slab with one element, component 1 is
        // refined roughly 80-fold
        assert_eq!(slab.elist[0].len(), 1);
        assert!(slab.elist[1].len() >= 50);
        let root = slab.root.as_ref().unwrap();
        assert_eq!(root.children.len(), slab.elist[1].len());
        // child steps never exceed the parent step
        for child in &root.children {
            assert!(child.b - child.a <= 0.08 + 1e-12);
        }
    }

    #[test]
    fn test_usample_at_nodes_and_continuity() {
        let (ode, mut slab, state) = build_slab(options().initial_step(0.01));
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        slab.solve(&ode).unwrap();
        for i in 0..2 {
            for &eid in &slab.elist[i] {
                let el = &slab.elements[eid];
                for n in 0..slab.method.nsize() {
                    let t = el.a + slab.method.npoint(n) * el.length();
                    assert!((slab.usample(i, t) - el.dofs[n]).abs() < 1e-13);
                }
            }
        }
    }

    #[test]
    fn test_shift_requires_passing_check() {
        let (mut ode, mut slab, mut state) = build_slab(options());
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        slab.solve(&ode).unwrap();
        assert!(slab.shift(&mut state, &mut ode, false).is_err());
    }

    #[test]
    fn test_rejection_roundtrip_preserves_state() {
        let (ode, mut slab, state) = build_slab(options());
        let before = state.u.clone();
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        slab.solve(&ode).unwrap();
        let _ = slab.check(&ode, true).unwrap();
        slab.state = SlabState::Rejected;
        slab.adaptivity.shrink(0.5);
        slab.build(&state, 0.0, 1.0, &ode).unwrap();
        assert_eq!(state.u, before);
    }
}
