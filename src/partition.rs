use crate::adaptivity::MultiAdaptivity;
use crate::{IndexType, Scalar};

/// A permutation of the component indices, maintained so that components
/// with comparable target steps occupy contiguous ranges. Positions before
/// the `offset` handed to [Partition::update] are frozen (they belong to
/// coarser recursion levels); the remainder is re-partitioned on every
/// call.
pub struct Partition<T: Scalar> {
    indices: Vec<IndexType>,
    threshold: T,
}

impl<T: Scalar> Partition<T> {
    pub fn new(n: IndexType, threshold: T) -> Self {
        Self {
            indices: (0..n).collect(),
            threshold,
        }
    }

    pub fn size(&self) -> IndexType {
        self.indices.len()
    }

    /// Map a position in the partitioned ordering back to the original
    /// component index.
    pub fn index(&self, pos: IndexType) -> IndexType {
        self.indices[pos]
    }

    /// Partition the unpartitioned range `[offset, N)` by target step size:
    /// components within the threshold of the largest remaining target form
    /// the next (outer) group, placed first; the finer remainder is left
    /// for the caller to partition recursively. Returns the end of the
    /// group and the common step chosen for it (the group minimum, so no
    /// member is pushed past its own target).
    ///
    /// A call with `offset == N` is a no-op returning `k` unchanged.
    pub fn update(
        &mut self,
        offset: IndexType,
        k: T,
        adaptivity: &MultiAdaptivity<T>,
    ) -> (IndexType, T) {
        let n = self.indices.len();
        if offset == n {
            return (offset, k);
        }

        // Largest target step among the remaining components
        let mut k_large = T::zero();
        for pos in offset..n {
            let ki = adaptivity.timestep(self.indices[pos]);
            if ki > k_large {
                k_large = ki;
            }
        }
        let pivot = self.threshold * k_large;

        // Stable partition: the coarse group first, both groups keeping
        // their relative order for reproducibility
        let mut coarse = Vec::with_capacity(n - offset);
        let mut fine = Vec::new();
        let mut k_group = k_large;
        for pos in offset..n {
            let i = self.indices[pos];
            let ki = adaptivity.timestep(i);
            if ki >= pivot {
                coarse.push(i);
                if ki < k_group {
                    k_group = ki;
                }
            } else {
                fine.push(i);
            }
        }
        let end = offset + coarse.len();
        self.indices[offset..end].copy_from_slice(&coarse);
        self.indices[end..n].copy_from_slice(&fine);

        (end, k_group)
    }
}
