use nalgebra::DVector;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::info;

use crate::ode::OdeSystem;
use crate::{IndexType, Scalar};

/// Sparsity pattern of df_i/du_j: for each component i, the set of
/// components j that f_i may read. Dense by default; rows become explicit
/// once the pattern is declared or detected. Read-only during integration.
///
/// A missing dependency is a silent under-approximation that the caller
/// must tolerate; it is not an error.
#[derive(Clone, Debug)]
pub struct Dependencies {
    n: IndexType,
    // None = dense pattern, every component depends on every component.
    // An edge i -> j means f_i depends on u_j; the transpose pattern is
    // read off the incoming edges.
    graph: Option<DiGraph<(), ()>>,
}

impl Dependencies {
    /// Create a dense dependency pattern for N components.
    pub fn new(n: IndexType) -> Self {
        Self { n, graph: None }
    }

    pub fn size(&self) -> IndexType {
        self.n
    }

    /// True once the pattern has been made explicit.
    pub fn sparse(&self) -> bool {
        self.graph.is_some()
    }

    /// Announce the number of dependencies of component i before calling
    /// [Dependencies::set]. Switches the pattern to sparse.
    pub fn setsize(&mut self, _i: IndexType, _size: IndexType) {
        self.make_sparse();
    }

    /// Record that f_i depends on u_j. With `checknew`, a duplicate entry
    /// is silently ignored.
    pub fn set(&mut self, i: IndexType, j: IndexType, checknew: bool) {
        self.make_sparse();
        let graph = self.graph.as_mut().unwrap();
        let (a, b) = (NodeIndex::new(i), NodeIndex::new(j));
        if checknew && graph.find_edge(a, b).is_some() {
            return;
        }
        graph.add_edge(a, b, ());
    }

    /// Probe the right-hand side component-wise with finite differences to
    /// detect the dependency pattern automatically.
    pub fn detect<T: Scalar>(&mut self, ode: &impl OdeSystem<T>, increment: T) {
        self.make_sparse();
        let n = self.n;

        // Deterministic, non-degenerate probe point
        let mut u = DVector::<T>::zeros(n);
        for i in 0..n {
            let x = T::from_usize(i).unwrap();
            u[i] = T::from(0.5) + T::from(0.34) * (x + T::one()).sin();
        }

        let mut sum = 0;
        for i in 0..n {
            let f0 = ode.f_component(&u, T::zero(), i);
            for j in 0..n {
                let uj = u[j];
                u[j] += increment;
                let f1 = ode.f_component(&u, T::zero(), i);
                u[j] = uj;
                if (f1 - f0).abs() > T::EPSILON {
                    self.set(i, j, false);
                    sum += 1;
                }
            }
        }

        info!("Automatically detected {} dependencies.", sum);
    }

    /// The components that f_i depends on.
    pub fn row(&self, i: IndexType) -> DependencyIter {
        match &self.graph {
            None => DependencyIter::Dense(0..self.n),
            Some(graph) => DependencyIter::Sparse(
                graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Outgoing)
                    .map(NodeIndex::index)
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
        }
    }

    /// The components whose f_j depends on u_i (the transposed pattern,
    /// used for preconditioner and adjoint construction).
    pub fn transpose_row(&self, i: IndexType) -> DependencyIter {
        match &self.graph {
            None => DependencyIter::Dense(0..self.n),
            Some(graph) => DependencyIter::Sparse(
                graph
                    .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                    .map(NodeIndex::index)
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
        }
    }

    /// Number of dependencies of component i.
    pub fn row_len(&self, i: IndexType) -> IndexType {
        match &self.graph {
            None => self.n,
            Some(graph) => graph
                .neighbors_directed(NodeIndex::new(i), Direction::Outgoing)
                .count(),
        }
    }

    fn make_sparse(&mut self) {
        if self.graph.is_none() {
            let mut graph = DiGraph::new();
            for _ in 0..self.n {
                graph.add_node(());
            }
            self.graph = Some(graph);
        }
    }
}

pub enum DependencyIter {
    Dense(std::ops::Range<IndexType>),
    Sparse(std::vec::IntoIter<IndexType>),
}

impl Iterator for DependencyIter {
    type Item = IndexType;
    fn next(&mut self) -> Option<IndexType> {
        match self {
            DependencyIter::Dense(range) => range.next(),
            DependencyIter::Sparse(iter) => iter.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::test_models::HarmonicOscillator;

    #[test]
    fn test_dense_by_default() {
        let deps = Dependencies::new(3);
        assert!(!deps.sparse());
        assert_eq!(deps.row(1).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(deps.row_len(0), 3);
    }

    #[test]
    fn test_manual_pattern() {
        let mut deps = Dependencies::new(3);
        deps.setsize(0, 2);
        deps.set(0, 1, true);
        deps.set(0, 2, true);
        deps.set(0, 1, true); // duplicate, ignored
        assert!(deps.sparse());
        assert_eq!(deps.row_len(0), 2);
        let mut row: Vec<_> = deps.row(0).collect();
        row.sort();
        assert_eq!(row, vec![1, 2]);
        assert_eq!(deps.row_len(1), 0);
    }

    #[test]
    fn test_transpose_rows() {
        let mut deps = Dependencies::new(3);
        deps.set(0, 2, true);
        deps.set(1, 2, true);
        let mut col: Vec<_> = deps.transpose_row(2).collect();
        col.sort();
        assert_eq!(col, vec![0, 1]);
        assert_eq!(deps.transpose_row(0).count(), 0);
    }

    #[test]
    fn test_detect_harmonic_oscillator() {
        // f(u) = [u1, -u0]: each component depends exactly on the other
        let ode = HarmonicOscillator::new(1.0);
        let mut deps = Dependencies::new(2);
        deps.detect(&ode, 1e-4);
        assert!(deps.sparse());
        assert_eq!(deps.row(0).collect::<Vec<_>>(), vec![1]);
        assert_eq!(deps.row(1).collect::<Vec<_>>(), vec![0]);
    }
}
