use thiserror::Error;

/// Custom error type for Slabsol
///
/// This error type is used to wrap all possible errors that can occur when using Slabsol
#[derive(Error, Debug)]
pub enum SlabsolError {
    #[error("Method error: {0}")]
    MethodError(#[from] MethodError),
    #[error("Linear solver error: {0}")]
    LinearSolverError(#[from] LinearSolverError),
    #[error("Non-linear solver error: {0}")]
    NonLinearSolverError(#[from] NonLinearSolverError),
    #[error("Time slab error: {0}")]
    TimeSlabError(#[from] TimeSlabError),
    #[error("ODE solver error: {0}")]
    OdeSolverError(#[from] OdeSolverError),
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors when constructing a collocation method
#[derive(Error, Debug)]
pub enum MethodError {
    #[error("Invalid degree q = {q} for {method} (minimal degree is {min})")]
    InvalidDegree {
        method: &'static str,
        q: usize,
        min: usize,
    },
    #[error("Quadrature check failed for {n}-point rule")]
    QuadratureCheckFailed { n: usize },
}

/// Possible errors when solving the linearised slab system
#[derive(Error, Debug)]
pub enum LinearSolverError {
    #[error("GMRES did not converge after {iterations} iterations (residual {residual:.3e})")]
    KrylovDidNotConverge { iterations: usize, residual: f64 },
    #[error("Preconditioner block for component {index} is singular")]
    PreconditionerSingular { index: usize },
    #[error("Error: {0}")]
    Other(String),
}

/// Possible errors when converging a time slab system
#[derive(Error, Debug)]
pub enum NonLinearSolverError {
    #[error("Time slab system did not converge after {iterations} iterations")]
    NoConvergence { iterations: usize },
    #[error("Time slab system diverged at iteration {iteration}")]
    Diverged { iteration: usize },
}

/// Possible errors in the time slab state machine and its operators
#[derive(Error, Debug)]
pub enum TimeSlabError {
    #[error("Invalid slab state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Jacobian operator is stale: slab layout has {expected} degrees of freedom, operator was built for {found}")]
    StructuralMismatch { expected: usize, found: usize },
}

/// Possible errors when driving the time stepping to the horizon
#[derive(Debug, Error)]
pub enum OdeSolverError {
    #[error("Step size underflow at time t = {t} after {rejections} rejected attempts")]
    StepSizeUnderflow { t: f64, rejections: usize },
    #[error("The Newton solver must be used for an implicit ODE (mass matrix supplied)")]
    MassRequiresNewton,
    #[error("Maximum step size must be positive and at least the minimum step size")]
    InvalidStepBounds,
    #[error("Error: {0}")]
    Other(String),
}

#[macro_export]
macro_rules! method_error {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::SlabsolError::from($crate::error::MethodError::$variant $($arg)*)
    };
}

#[macro_export]
macro_rules! linear_solver_error {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::SlabsolError::from($crate::error::LinearSolverError::$variant $($arg)*)
    };
}

#[macro_export]
macro_rules! non_linear_solver_error {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::SlabsolError::from($crate::error::NonLinearSolverError::$variant $($arg)*)
    };
}

#[macro_export]
macro_rules! time_slab_error {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::SlabsolError::from($crate::error::TimeSlabError::$variant $($arg)*)
    };
}

#[macro_export]
macro_rules! ode_solver_error {
    ($variant:ident, $($arg:tt)*) => {
        $crate::error::SlabsolError::from($crate::error::OdeSolverError::$variant $($arg)*)
    };
}

#[macro_export]
macro_rules! other_error {
    ($msg:expr) => {
        $crate::error::SlabsolError::Other($msg.to_string())
    };
}
