//! Tensor algebra for tensor-network simulations (e.g. DMRG) over both
//! ordinary dense tensors and symmetry-block-sparse tensors whose indices
//! carry conserved quantum-number labels.
//!
//! The core of the crate is the contraction engine in [`contract`], which
//! sums two (or, for inner-product sandwiching, three) tensors over specified
//! index pairs. Dense operands are reshaped into matrix form and handed to a
//! generalized matrix-multiply kernel; block-sparse operands are first run
//! through a block matcher that pairs up only those stored blocks whose
//! quantum numbers satisfy the conservation law on the contracted indices,
//! and the kernel then runs once per matched pair. Sparsity is never
//! exploited by scanning the full symmetry-sector space -- all work is
//! proportional to the number of blocks actually stored.
//!
//! Higher layers of a DMRG code (sweep drivers, decompositions, MPS/MPO
//! containers) are expected to consume [`contract::contract`] and friends as
//! black boxes; nothing here performs I/O or retains references to operands
//! after returning.
//!
//! # Example
//!
//! ```
//! use qn_tensor::{ contract::{ self, Tensor }, dense::DenseTensor, qnum::U1 };
//!
//! // C_{ik} = A_{ij} B_{jk}, contracted over j
//! let a = DenseTensor::from_elems(&[2, 3], vec![1.0; 6]).unwrap();
//! let b = DenseTensor::from_elems(&[3, 2], vec![2.0; 6]).unwrap();
//! let a: Tensor<U1, f64> = Tensor::Dense(a);
//! let b: Tensor<U1, f64> = Tensor::Dense(b);
//! let c = contract::contract(&a, &[1], &b, &[0], None, 1.0, 0.0).unwrap();
//! assert_eq!(c.shape(), vec![2, 2]);
//! ```

use std::fmt;
use ndarray::LinalgScalar;
use num_complex::{ Complex32 as C32, Complex64 as C64 };

pub mod qnum;
pub mod dense;
pub mod blocksparse;
pub mod contract;
pub mod pool;

/// Identifies the numeric kind of a tensor element type.
///
/// The set of supported kinds is closed; all element-type promotion
/// decisions are made by [`promote`][Self::promote], a total function over
/// this set.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NumKind {
    /// Signed 64-bit integer.
    Integer,
    /// 32-bit real floating point.
    Real32,
    /// 64-bit real floating point.
    Real64,
    /// 32-bit complex floating point.
    Complex32,
    /// 64-bit complex floating point.
    Complex64,
}

impl NumKind {
    /// Return the natural kind of a product of two element kinds: complex
    /// wins over real, 64-bit floating point wins over 32-bit, and integers
    /// defer to any floating-point partner.
    pub fn promote(self, other: Self) -> Self {
        use NumKind::*;
        match (self, other) {
            (Integer,   Integer  )                          => Integer,
            (Integer,   Real32   ) | (Real32,    Integer  ) => Real32,
            (Integer,   Real64   ) | (Real64,    Integer  ) => Real64,
            (Integer,   Complex32) | (Complex32, Integer  ) => Complex32,
            (Integer,   Complex64) | (Complex64, Integer  ) => Complex64,
            (Real32,    Real32   )                          => Real32,
            (Real32,    Real64   ) | (Real64,    Real32   ) => Real64,
            (Real32,    Complex32) | (Complex32, Real32   ) => Complex32,
            (Real32,    Complex64) | (Complex64, Real32   ) => Complex64,
            (Real64,    Real64   )                          => Real64,
            (Real64,    Complex32) | (Complex32, Real64   ) => Complex64,
            (Real64,    Complex64) | (Complex64, Real64   ) => Complex64,
            (Complex32, Complex32)                          => Complex32,
            (Complex32, Complex64) | (Complex64, Complex32) => Complex64,
            (Complex64, Complex64)                          => Complex64,
        }
    }

    /// Return `true` if the kind is complex-valued.
    pub fn is_complex(self) -> bool {
        matches!(self, Self::Complex32 | Self::Complex64)
    }

    /// Return `true` if the multiply kernel has a specialized (BLAS-class)
    /// routine for the kind; integer operands fall back to a generic
    /// multiply-then-sum loop.
    pub fn has_fast_kernel(self) -> bool { !matches!(self, Self::Integer) }
}

/// Trait covering the closed set of tensor element types.
///
/// Implementors are exactly `i64`, `f32`, `f64`, [`C32`], and [`C64`]; the
/// contraction engine is generic over this set and nothing outside it.
pub trait Elem:
    LinalgScalar
    + PartialEq
    + fmt::Debug
    + fmt::Display
    + Send
    + Sync
    + 'static
{
    /// The numeric kind of the type.
    const KIND: NumKind;

    /// Elementwise complex conjugate; the identity for real and integer
    /// kinds.
    fn conj(self) -> Self;

    /// Squared modulus as an `f64`.
    fn abs_sq(self) -> f64;

    /// Embedding into [`C64`], used as the common carrier for element-type
    /// promotion.
    fn into_c64(self) -> C64;

    /// Inverse of [`into_c64`][Self::into_c64] for values representable in
    /// `Self`; promotion never converts through a kind that cannot
    /// represent the value.
    fn from_c64(x: C64) -> Self;
}

impl Elem for i64 {
    const KIND: NumKind = NumKind::Integer;

    fn conj(self) -> Self { self }

    fn abs_sq(self) -> f64 { (self * self) as f64 }

    fn into_c64(self) -> C64 { C64::new(self as f64, 0.0) }

    fn from_c64(x: C64) -> Self { x.re.round() as i64 }
}

impl Elem for f32 {
    const KIND: NumKind = NumKind::Real32;

    fn conj(self) -> Self { self }

    fn abs_sq(self) -> f64 { (self * self) as f64 }

    fn into_c64(self) -> C64 { C64::new(self as f64, 0.0) }

    fn from_c64(x: C64) -> Self { x.re as f32 }
}

impl Elem for f64 {
    const KIND: NumKind = NumKind::Real64;

    fn conj(self) -> Self { self }

    fn abs_sq(self) -> f64 { self * self }

    fn into_c64(self) -> C64 { C64::new(self, 0.0) }

    fn from_c64(x: C64) -> Self { x.re }
}

impl Elem for C32 {
    const KIND: NumKind = NumKind::Complex32;

    fn conj(self) -> Self { num_complex::Complex::conj(&self) }

    fn abs_sq(self) -> f64 { self.norm_sqr() as f64 }

    fn into_c64(self) -> C64 { C64::new(self.re as f64, self.im as f64) }

    fn from_c64(x: C64) -> Self { C32::new(x.re as f32, x.im as f32) }
}

impl Elem for C64 {
    const KIND: NumKind = NumKind::Complex64;

    fn conj(self) -> Self { num_complex::Complex::conj(&self) }

    fn abs_sq(self) -> f64 { self.norm_sqr() }

    fn into_c64(self) -> C64 { self }

    fn from_c64(x: C64) -> Self { x }
}

/// Static counterpart of [`NumKind::promote`]: selects the output element
/// type of a mixed-type contraction at compile time.
///
/// The implementations below cover the full 5 × 5 kind table and agree with
/// [`NumKind::promote`] everywhere.
pub trait Promote<B: Elem>: Elem {
    /// The promoted element type of a `Self` × `B` product.
    type Output: Elem;

    /// Embed a left-operand element into the promoted type.
    fn promote(self) -> <Self as Promote<B>>::Output {
        <Self as Promote<B>>::Output::from_c64(self.into_c64())
    }

    /// Embed a right-operand element into the promoted type.
    fn promote_rhs(b: B) -> <Self as Promote<B>>::Output {
        <Self as Promote<B>>::Output::from_c64(b.into_c64())
    }
}

macro_rules! impl_promote {
    ( $a:ty, $b:ty => $out:ty ) => {
        impl Promote<$b> for $a { type Output = $out; }
    }
}
impl_promote!(i64, i64 => i64);
impl_promote!(i64, f32 => f32);
impl_promote!(i64, f64 => f64);
impl_promote!(i64, C32 => C32);
impl_promote!(i64, C64 => C64);
impl_promote!(f32, i64 => f32);
impl_promote!(f32, f32 => f32);
impl_promote!(f32, f64 => f64);
impl_promote!(f32, C32 => C32);
impl_promote!(f32, C64 => C64);
impl_promote!(f64, i64 => f64);
impl_promote!(f64, f32 => f64);
impl_promote!(f64, f64 => f64);
impl_promote!(f64, C32 => C64);
impl_promote!(f64, C64 => C64);
impl_promote!(C32, i64 => C32);
impl_promote!(C32, f32 => C32);
impl_promote!(C32, f64 => C64);
impl_promote!(C32, C32 => C32);
impl_promote!(C32, C64 => C64);
impl_promote!(C64, i64 => C64);
impl_promote!(C64, f32 => C64);
impl_promote!(C64, f64 => C64);
impl_promote!(C64, C32 => C64);
impl_promote!(C64, C64 => C64);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn promote_table_total_and_symmetric() {
        use NumKind::*;
        let kinds = [Integer, Real32, Real64, Complex32, Complex64];
        for ka in kinds {
            for kb in kinds {
                let kc = ka.promote(kb);
                assert_eq!(kc, kb.promote(ka));
                assert_eq!(
                    kc.is_complex(),
                    ka.is_complex() || kb.is_complex(),
                );
            }
        }
        assert_eq!(Integer.promote(Integer), Integer);
        assert_eq!(Real64.promote(Complex32), Complex64);
        assert_eq!(Real32.promote(Integer), Real32);
    }

    #[test]
    fn static_promotion_agrees_with_kinds() {
        fn out_kind<A, B>() -> NumKind
        where
            A: Promote<B>,
            B: Elem,
        {
            <A as Promote<B>>::Output::KIND
        }

        assert_eq!(
            out_kind::<f64, C32>(),
            NumKind::Real64.promote(NumKind::Complex32),
        );
        assert_eq!(
            out_kind::<i64, f32>(),
            NumKind::Integer.promote(NumKind::Real32),
        );
        assert_eq!(
            out_kind::<C32, C64>(),
            NumKind::Complex32.promote(NumKind::Complex64),
        );
    }

    #[test]
    fn conj_identity_for_real_kinds() {
        assert_eq!(Elem::conj(3.5_f64), 3.5);
        assert_eq!(Elem::conj(-2_i64), -2);
        assert_eq!(Elem::conj(C64::new(1.0, 2.0)), C64::new(1.0, -2.0));
    }
}
