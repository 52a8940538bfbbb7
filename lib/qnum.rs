//! Conserved quantum-number labels attached to tensor index sectors.
//!
//! A quantum number is an element of a discrete abelian group: labels add
//! when indices are fused, and reversing an index arrow (conjugation)
//! replaces every label by its group inverse. A block of a block-sparse
//! tensor is legal exactly when its row-group and column-group totals add up
//! to the tensor's flux, so the whole sparsity structure of the crate is
//! driven by the three operations on this trait.
//!
//! Two concrete groups are provided: [`U1`], the integer charge group used
//! for particle-number conservation in DMRG, and [`Zn`], the cyclic group
//! used for e.g. parity (`Zn<2>`). The unit type implements the trivial
//! group for tensors that carry no symmetry at all.

use std::{ fmt, hash::Hash };

/// Describes an element of a discrete abelian group.
///
/// Implementations must satisfy the group laws: `add` is associative and
/// commutative with identity [`zero`][Self::zero], and
/// `q.add(q.inverse()) == Q::zero()` for every `q`.
pub trait Qnum:
    Copy
    + Eq
    + Ord
    + Hash
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
    /// The group identity.
    fn zero() -> Self;

    /// Group addition.
    fn add(self, other: Self) -> Self;

    /// Group inverse.
    fn inverse(self) -> Self;

    /// Conjugation-adjusted value: the inverse if `conj` is set, otherwise
    /// the value itself.
    fn adjusted(self, conj: bool) -> Self {
        if conj { self.inverse() } else { self }
    }
}

/// Integer (U(1)) charge, e.g. total particle number.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct U1(pub i64);

impl Qnum for U1 {
    fn zero() -> Self { Self(0) }

    fn add(self, other: Self) -> Self { Self(self.0 + other.0) }

    fn inverse(self) -> Self { Self(-self.0) }
}

impl fmt::Display for U1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

/// Cyclic (Z_N) charge, e.g. fermion parity for `N = 2`.
///
/// The stored value is always reduced modulo `N`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Zn<const N: u64>(u64);

impl<const N: u64> Zn<N> {
    /// Create a new cyclic charge, reducing modulo `N`.
    pub fn new(value: u64) -> Self { Self(value % N) }

    /// Return the reduced representative in `0..N`.
    pub fn value(self) -> u64 { self.0 }
}

impl<const N: u64> Qnum for Zn<N> {
    fn zero() -> Self { Self(0) }

    fn add(self, other: Self) -> Self { Self((self.0 + other.0) % N) }

    fn inverse(self) -> Self { Self((N - self.0) % N) }
}

impl<const N: u64> fmt::Display for Zn<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(mod {})", self.0, N)
    }
}

/// The trivial group; attaches no symmetry information to an index.
impl Qnum for () {
    fn zero() -> Self { }

    fn add(self, _other: Self) -> Self { }

    fn inverse(self) -> Self { }
}

/// Total quantum number of one fused position of an index group.
///
/// `labels` holds one label list per index in the group, `values` the index
/// values taken; both are in group order.
pub fn group_qnum<Q>(labels: &[&[Q]], values: &[usize]) -> Q
where Q: Qnum
{
    labels.iter().zip(values)
        .fold(Q::zero(), |acc, (lab, v)| acc.add(lab[*v]))
}
