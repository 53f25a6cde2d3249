use nalgebra::RealField;
use num_traits::{FromPrimitive, Signed};

pub trait Scalar:
    nalgebra::Scalar + RealField + Copy + From<f64> + FromPrimitive + Signed + PartialOrd
{
    const EPSILON: Self;
    const INFINITY: Self;
    const NAN: Self;
    fn is_finite(self) -> bool;
    fn as_f64(self) -> f64;
}

pub type IndexType = usize;

impl Scalar for f64 {
    const EPSILON: Self = f64::EPSILON;
    const INFINITY: Self = f64::INFINITY;
    const NAN: Self = f64::NAN;
    fn is_finite(self) -> bool {
        self.is_finite()
    }
    fn as_f64(self) -> f64 {
        self
    }
}
