use std::{fmt, ops};

use num_complex::{Complex32, Complex64};

pub trait Int: num_traits::PrimInt + fmt::Display + fmt::Debug {
    fn from_usize(i: usize) -> Self {
        match Self::from(i) {
            Some(j) => j,
            None => panic!("must be able to create Int from {}", i),
        }
    }

    fn to_index(&self) -> usize {
        match self.to_usize() {
            Some(j) => j,
            None => panic!("must be able to convert Int to usize: {}", self),
        }
    }
}

impl Int for usize {}
impl Int for u32 {}
impl Int for u64 {}

impl Int for isize {}
impl Int for i32 {}
impl Int for i64 {}

/// Element type tag carried by every tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Int,
    RealSingle,
    RealDouble,
    ComplexSingle,
    ComplexDouble,
}

impl ScalarKind {
    pub fn size_of(&self) -> usize {
        match self {
            ScalarKind::Int | ScalarKind::RealSingle => 4,
            ScalarKind::RealDouble | ScalarKind::ComplexSingle => 8,
            ScalarKind::ComplexDouble => 16,
        }
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, ScalarKind::ComplexSingle | ScalarKind::ComplexDouble)
    }
}

pub trait Scalar:
    Copy
    + Send
    + Sync
    + 'static
    + PartialEq
    + num_traits::Zero
    + num_traits::One
    + ops::Add<Output = Self>
    + ops::Sub<Output = Self>
    + ops::Mul<Output = Self>
    + ops::Neg<Output = Self>
    + ops::AddAssign
    + ops::SubAssign
    + ops::MulAssign
    + bytemuck::Pod
    + fmt::Display
    + fmt::Debug
{
    const KIND: ScalarKind;

    fn conj(self) -> Self;

    /// Real (`k == 0`) or imaginary (`k == 1`) component.
    fn part(&self, k: usize) -> Option<f64>;

    #[cfg(feature = "debug")]
    fn pretty_string(&self, _config: pretty_dtoa::FmtFloatConfig) -> String {
        format!("{}", self)
    }
}

/// Scalars the factorization kernels can divide and take square roots of.
pub trait Field: Scalar + ops::Div<Output = Self> + ops::DivAssign + Norm<f64> {
    fn from_f64(v: f64) -> Self;

    fn re(&self) -> f64;

    /// Unit roundoff of the underlying real type.
    fn epsilon() -> f64;
}

impl Scalar for i32 {
    const KIND: ScalarKind = ScalarKind::Int;

    fn conj(self) -> Self {
        self
    }

    fn part(&self, k: usize) -> Option<f64> {
        (k == 0).then_some(*self as f64)
    }
}

impl Scalar for f32 {
    const KIND: ScalarKind = ScalarKind::RealSingle;

    fn conj(self) -> Self {
        self
    }

    fn part(&self, k: usize) -> Option<f64> {
        (k == 0).then_some(*self as f64)
    }

    #[cfg(feature = "debug")]
    fn pretty_string(&self, config: pretty_dtoa::FmtFloatConfig) -> String {
        pretty_dtoa::dtoa(*self as f64, config)
    }
}

impl Scalar for f64 {
    const KIND: ScalarKind = ScalarKind::RealDouble;

    fn conj(self) -> Self {
        self
    }

    fn part(&self, k: usize) -> Option<f64> {
        (k == 0).then_some(*self)
    }

    #[cfg(feature = "debug")]
    fn pretty_string(&self, config: pretty_dtoa::FmtFloatConfig) -> String {
        pretty_dtoa::dtoa(*self, config)
    }
}

impl Scalar for Complex32 {
    const KIND: ScalarKind = ScalarKind::ComplexSingle;

    fn conj(self) -> Self {
        Complex32::conj(&self)
    }

    fn part(&self, k: usize) -> Option<f64> {
        match k {
            0 => Some(self.re as f64),
            1 => Some(self.im as f64),
            _ => None,
        }
    }

    #[cfg(feature = "debug")]
    fn pretty_string(&self, config: pretty_dtoa::FmtFloatConfig) -> String {
        format!(
            "{}{}j{}",
            pretty_dtoa::dtoa(self.re as f64, config),
            if self.im.signum() < 0.0 { "-" } else { "+" },
            pretty_dtoa::dtoa(self.im.abs() as f64, config)
        )
    }
}

impl Scalar for Complex64 {
    const KIND: ScalarKind = ScalarKind::ComplexDouble;

    fn conj(self) -> Self {
        Complex64::conj(&self)
    }

    fn part(&self, k: usize) -> Option<f64> {
        match k {
            0 => Some(self.re),
            1 => Some(self.im),
            _ => None,
        }
    }

    #[cfg(feature = "debug")]
    fn pretty_string(&self, config: pretty_dtoa::FmtFloatConfig) -> String {
        format!(
            "{}{}j{}",
            pretty_dtoa::dtoa(self.re, config),
            if self.im.signum() < 0.0 { "-" } else { "+" },
            pretty_dtoa::dtoa(self.im.abs(), config)
        )
    }
}

impl Field for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn re(&self) -> f64 {
        *self as f64
    }

    fn epsilon() -> f64 {
        f32::EPSILON as f64
    }
}

impl Field for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }

    fn re(&self) -> f64 {
        *self
    }

    fn epsilon() -> f64 {
        f64::EPSILON
    }
}

impl Field for Complex32 {
    fn from_f64(v: f64) -> Self {
        Complex32::new(v as f32, 0.0)
    }

    fn re(&self) -> f64 {
        self.re as f64
    }

    fn epsilon() -> f64 {
        f32::EPSILON as f64
    }
}

impl Field for Complex64 {
    fn from_f64(v: f64) -> Self {
        Complex64::new(v, 0.0)
    }

    fn re(&self) -> f64 {
        self.re
    }

    fn epsilon() -> f64 {
        f64::EPSILON
    }
}

pub trait Norm<F> {
    fn norm(&self) -> F;
}

impl Norm<f64> for f64 {
    fn norm(&self) -> f64 {
        f64::abs(*self)
    }
}

impl Norm<f64> for f32 {
    fn norm(&self) -> f64 {
        f32::abs(*self) as f64
    }
}

impl Norm<f64> for Complex64 {
    fn norm(&self) -> f64 {
        num_complex::Complex::norm(*self)
    }
}

impl Norm<f64> for Complex32 {
    fn norm(&self) -> f64 {
        num_complex::Complex::norm(*self) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sizes_match_types() {
        assert_eq!(ScalarKind::Int.size_of(), std::mem::size_of::<i32>());
        assert_eq!(ScalarKind::RealDouble.size_of(), std::mem::size_of::<f64>());
        assert_eq!(
            ScalarKind::ComplexSingle.size_of(),
            std::mem::size_of::<Complex32>()
        );
        assert_eq!(
            ScalarKind::ComplexDouble.size_of(),
            std::mem::size_of::<Complex64>()
        );
    }

    #[test]
    fn complex_parts() {
        let z = Complex64::new(1.5, -2.0);
        assert_eq!(z.part(0), Some(1.5));
        assert_eq!(z.part(1), Some(-2.0));
        assert_eq!(z.part(2), None);
        assert_eq!(3.0f64.part(1), None);
        assert_eq!(Scalar::conj(z), Complex64::new(1.5, 2.0));
    }
}
