use nalgebra::DVector;

use crate::error::{SlabsolError, TimeSlabError};
use crate::ode::{OdeOptions, OdeSystem, Sample};
use crate::{Dependencies, IndexType, Scalar};

pub mod mono;
pub mod multi;

pub use mono::MonoAdaptiveTimeSlab;
pub use multi::MultiAdaptiveTimeSlab;

/// Lifecycle of a slab between two rebuilds:
/// Empty -> Built -> Solved -> Accepted | Rejected.
///
/// `shift` is only reachable from Accepted; a rejected slab must be rebuilt
/// from scratch over the same start time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabState {
    Empty,
    Built,
    Solved,
    Accepted,
    Rejected,
}

impl SlabState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            SlabState::Empty => "Empty",
            SlabState::Built => "Built",
            SlabState::Solved => "Solved",
            SlabState::Accepted => "Accepted",
            SlabState::Rejected => "Rejected",
        }
    }
}

pub(crate) fn require_state(expected: &'static str, found: SlabState, ok: bool) -> Result<(), SlabsolError> {
    if ok {
        Ok(())
    } else {
        Err(SlabsolError::from(TimeSlabError::InvalidState {
            expected,
            found: found.name(),
        }))
    }
}

/// The committed end state of the last accepted slab: the start value for
/// the next one. Exclusively owned by the time stepper and passed by
/// reference into `build` and `shift`; `shift` is the only operation that
/// writes it.
pub struct PreviousState<T: Scalar> {
    pub t: T,
    pub u: DVector<T>,
}

impl<T: Scalar> PreviousState<T> {
    pub fn new(ode: &impl OdeSystem<T>) -> Self {
        let mut u = DVector::zeros(ode.size());
        ode.u0(&mut u);
        Self { t: T::zero(), u }
    }
}

/// A time slab: the discretized solution over one interval `[a, b)`. The
/// mono-adaptive variant advances every component with one common step; the
/// multi-adaptive variant holds a recursive tree of sub-slabs, each level
/// advancing a group of components with its own step.
pub enum TimeSlab<T: Scalar> {
    Mono(MonoAdaptiveTimeSlab<T>),
    Multi(MultiAdaptiveTimeSlab<T>),
}

impl<T: Scalar> TimeSlab<T> {
    pub fn new(
        ode: &impl OdeSystem<T>,
        options: OdeOptions<T>,
        dependencies: Dependencies,
    ) -> Result<Self, SlabsolError> {
        match options.adaptivity {
            crate::ode::AdaptivityKind::Mono => Ok(TimeSlab::Mono(MonoAdaptiveTimeSlab::new(
                ode,
                options,
                dependencies,
            )?)),
            crate::ode::AdaptivityKind::Multi => Ok(TimeSlab::Multi(MultiAdaptiveTimeSlab::new(
                ode,
                options,
                dependencies,
            )?)),
        }
    }

    /// Stage the slab over `[a, b)`, possibly shortening the interval to
    /// respect the target steps; returns the realized end time. The
    /// previous state is only read.
    pub fn build(
        &mut self,
        state: &PreviousState<T>,
        a: T,
        b: T,
        ode: &impl OdeSystem<T>,
    ) -> Result<T, SlabsolError> {
        match self {
            TimeSlab::Mono(ts) => ts.build(state, a, b, ode),
            TimeSlab::Multi(ts) => ts.build(state, a, b, ode),
        }
    }

    /// Converge the slab's discrete system; returns the number of
    /// nonlinear iterations.
    pub fn solve(&mut self, ode: &impl OdeSystem<T>) -> Result<IndexType, SlabsolError> {
        match self {
            TimeSlab::Mono(ts) => ts.solve(ode),
            TimeSlab::Multi(ts) => ts.solve(ode),
        }
    }

    /// Evaluate the residual bound for every active component; true if the
    /// slab can be accepted. Purely diagnostic for the discretization: the
    /// solution buffers are not touched.
    pub fn check(&mut self, ode: &impl OdeSystem<T>, first: bool) -> Result<bool, SlabsolError> {
        match self {
            TimeSlab::Mono(ts) => ts.check(ode, first),
            TimeSlab::Multi(ts) => ts.check(ode, first),
        }
    }

    /// Commit the slab: copy its end values into the previous state and
    /// run the problem's `update` hook. Only reachable after a passing
    /// `check`. Returns false if the hook requested termination.
    pub fn shift(
        &mut self,
        state: &mut PreviousState<T>,
        ode: &mut impl OdeSystem<T>,
        end: bool,
    ) -> Result<bool, SlabsolError> {
        match self {
            TimeSlab::Mono(ts) => ts.shift(state, ode, end),
            TimeSlab::Multi(ts) => ts.shift(state, ode, end),
        }
    }

    /// Forced step reduction after a convergence failure.
    pub fn shrink(&mut self, factor: T) {
        match self {
            TimeSlab::Mono(ts) => ts.adaptivity.shrink(factor),
            TimeSlab::Multi(ts) => ts.adaptivity.shrink(factor),
        }
    }

    /// True once the step regulation has hit the lower bound everywhere.
    pub fn at_minimum(&self) -> bool {
        match self {
            TimeSlab::Mono(ts) => ts.adaptivity.at_minimum(),
            TimeSlab::Multi(ts) => ts.adaptivity.at_minimum(),
        }
    }

    pub fn state(&self) -> SlabState {
        match self {
            TimeSlab::Mono(ts) => ts.state,
            TimeSlab::Multi(ts) => ts.state,
        }
    }

    pub fn starttime(&self) -> T {
        match self {
            TimeSlab::Mono(ts) => ts.a,
            TimeSlab::Multi(ts) => ts.a,
        }
    }

    pub fn endtime(&self) -> T {
        match self {
            TimeSlab::Mono(ts) => ts.b,
            TimeSlab::Multi(ts) => ts.b,
        }
    }

    pub fn length(&self) -> T {
        self.endtime() - self.starttime()
    }

    /// Dense-output sample at `t` inside the slab (valid once solved).
    pub fn sample(&self, ode: &impl OdeSystem<T>, t: T) -> Sample<T> {
        match self {
            TimeSlab::Mono(ts) => ts.sample(ode, t),
            TimeSlab::Multi(ts) => ts.sample(ode, t),
        }
    }

    /// Sample the solution value of component `i` at time `t`.
    pub fn usample(&self, i: IndexType, t: T) -> T {
        match self {
            TimeSlab::Mono(ts) => ts.usample(i, t),
            TimeSlab::Multi(ts) => ts.usample(i, t),
        }
    }

    /// Sample the local step size of component `i` at time `t`.
    pub fn ksample(&self, i: IndexType, t: T) -> T {
        match self {
            TimeSlab::Mono(ts) => ts.ksample(i, t),
            TimeSlab::Multi(ts) => ts.ksample(i, t),
        }
    }

    /// Sample the residual of component `i` at time `t`.
    pub fn rsample(&self, i: IndexType, t: T, ode: &impl OdeSystem<T>) -> T {
        match self {
            TimeSlab::Mono(ts) => ts.rsample(i, t, ode),
            TimeSlab::Multi(ts) => ts.rsample(i, t),
        }
    }
}
