//! Dense tensors backed by a flat row-major buffer, plus the matrix-form
//! adapter used by the contraction engine.
//!
//! The storage convention is fixed here once and used consistently for all
//! fused-index arithmetic in the crate: standard (C-order) layout, i.e. the
//! **last** index varies fastest. Fusing an ordered group of indices into a
//! single one therefore concatenates digit positions, with the right-most
//! index of the group as the least-significant digit; see [`encode`] and
//! [`decode`].
//!
//! The matrix-form adapter ([`DenseTensor::to_matrix`]) reshapes a tensor
//! into an equivalent 2-D matrix along a chosen index bipartition. When the
//! left group is exactly the leading indices in ascending order and the
//! right group the trailing ones, the reshape is a pure reinterpretation of
//! the buffer and no element moves; otherwise the axes are permuted and the
//! buffer is copied once into standard layout. The sorted check is an
//! optimization only -- both paths produce identical matrices.

use ndarray as nd;
use thiserror::Error;
use crate::Elem;

#[derive(Debug, Error)]
pub enum DenseError {
    /// Returned when attempting to create a new tensor from a flat buffer
    /// whose length does not match the product of the index dimensions.
    #[error("error in tensor creation: shape {0:?} wants {1} elements, got {2}")]
    IncompatibleElems(Vec<usize>, usize, usize),

    /// Returned when an index-group list names an axis outside `0..ndim`.
    #[error("axis {0} out of bounds for a rank-{1} tensor")]
    AxisOutOfBounds(usize, usize),

    /// Returned when an axis appears more than once across the index-group
    /// lists of a matrix-form request.
    #[error("duplicate axis {0} in index partition")]
    DuplicateAxis(usize),

    /// Returned when the index-group lists of a matrix-form request do not
    /// cover every axis.
    #[error("index partition covers {0} of {1} axes")]
    IncompletePartition(usize, usize),
}
use DenseError::*;
pub type DenseResult<T> = Result<T, DenseError>;

/// Matrix view of a tensor: borrowed when the adapter's no-permutation fast
/// path applies, owned otherwise.
pub(crate) type Mat<'a, A> = nd::CowArray<'a, A, nd::Ix2>;

// fused-position arithmetic, row-major: last index fastest
pub(crate) fn decode(mut p: usize, dims: &[usize], out: &mut [usize]) {
    for (v, d) in out.iter_mut().zip(dims).rev() {
        *v = p % d;
        p /= d;
    }
}

pub(crate) fn encode(values: &[usize], dims: &[usize]) -> usize {
    values.iter().zip(dims)
        .fold(0, |acc, (v, d)| acc * d + v)
}

// both scans must pass for the no-permutation reshape to be valid
pub(crate) fn sorted_partition(left: &[usize], right: &[usize]) -> bool {
    left.iter().enumerate().all(|(k, ax)| *ax == k)
        && right.iter().enumerate().all(|(k, ax)| *ax == left.len() + k)
}

/// An N-dimensional array of numeric values with positional indices.
///
/// Shapes are immutable after creation; permuting or reshaping produces a
/// new logical view through the matrix-form adapter. A rank-0 tensor (empty
/// shape, one element) represents a scalar.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseTensor<A> {
    // invariant: always standard (row-major) layout
    data: nd::ArrayD<A>,
}

impl<A> DenseTensor<A>
where A: Elem
{
    /// Create a new tensor from a flat row-major buffer.
    ///
    /// Fails if the buffer length does not equal the product of the index
    /// dimensions.
    pub fn from_elems(shape: &[usize], elems: Vec<A>) -> DenseResult<Self> {
        let len: usize = shape.iter().product();
        if len != elems.len() {
            return Err(
                IncompatibleElems(shape.to_vec(), len, elems.len()));
        }
        let data =
            nd::ArrayD::from_shape_vec(nd::IxDyn(shape), elems)
            .map_err(|_|
                IncompatibleElems(shape.to_vec(), len, 0))?;
        Ok(Self { data })
    }

    /// Create a new tensor using a function over index values.
    pub fn new<F>(shape: &[usize], mut elems: F) -> Self
    where F: FnMut(&[usize]) -> A
    {
        let len: usize = shape.iter().product();
        let mut values: Vec<usize> = vec![0; shape.len()];
        let buf: Vec<A> =
            (0..len)
            .map(|p| {
                decode(p, shape, &mut values);
                elems(&values)
            })
            .collect();
        let data = nd::ArrayD::from_shape_vec(nd::IxDyn(shape), buf)
            .unwrap(); // buf length is the shape product by construction
        Self { data }
    }

    /// Create a new tensor of all zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self { data: nd::ArrayD::zeros(nd::IxDyn(shape)) }
    }

    /// Create a new rank-0 (scalar) tensor.
    pub fn scalar(value: A) -> Self {
        Self { data: nd::ArrayD::from_elem(nd::IxDyn(&[]), value) }
    }

    /// Return the dimensions of each index.
    pub fn shape(&self) -> &[usize] { self.data.shape() }

    /// Return the rank (number of indices).
    pub fn ndim(&self) -> usize { self.data.ndim() }

    /// Return the total number of stored elements.
    pub fn len(&self) -> usize { self.data.len() }

    /// Return `true` if the tensor holds no elements.
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Return the element at a multi-index, if in bounds.
    pub fn get(&self, index: &[usize]) -> Option<&A> {
        self.data.get(nd::IxDyn(index))
    }

    /// If `self` has rank 0, extract its single element.
    pub fn as_scalar(&self) -> Option<A> {
        (self.ndim() == 0).then(|| self.data[nd::IxDyn(&[])])
    }

    /// Return a reference to the backing array.
    pub fn as_array(&self) -> &nd::ArrayD<A> { &self.data }

    /// Consume `self`, returning the backing array.
    pub fn into_array(self) -> nd::ArrayD<A> { self.data }

    /// Apply a mapping function to every element, returning a new tensor of
    /// the same shape.
    pub fn map<F, B>(&self, f: F) -> DenseTensor<B>
    where
        F: FnMut(&A) -> B,
        B: Elem,
    {
        DenseTensor { data: self.data.map(f) }
    }

    /// Return a new tensor containing the elementwise complex conjugate of
    /// `self`; a no-op copy for real and integer element types.
    pub fn conj(&self) -> Self {
        if A::KIND.is_complex() {
            Self { data: self.data.mapv(Elem::conj) }
        } else {
            self.clone()
        }
    }

    /// Return a new tensor scaled by `alpha`.
    pub fn scaled(&self, alpha: A) -> Self {
        Self { data: self.data.mapv(|a| a * alpha) }
    }

    /// Return a new tensor whose `k`-th index is `self`'s index `order[k]`.
    ///
    /// `order` must be a permutation of `0..ndim`.
    pub fn permuted(&self, order: &[usize]) -> DenseResult<Self> {
        self.check_partition(order, &[])?;
        let data =
            self.data.view()
            .permuted_axes(nd::IxDyn(order))
            .as_standard_layout()
            .into_owned();
        Ok(Self { data })
    }

    /// Return `true` if `self` and `other` have identical shapes and all
    /// corresponding elements agree to within `thresh` (squared-modulus
    /// comparison, default `1e-12`).
    pub fn approx_eq(&self, other: &Self, thresh: Option<f64>) -> bool {
        let eps = thresh.unwrap_or(1e-12);
        self.shape() == other.shape()
            && self.data.iter().zip(other.data.iter())
                .all(|(a, b)| (*a - *b).abs_sq() < eps)
    }

    /// Adapt `self` to matrix form along the bipartition `(left, right)`,
    /// optionally conjugating every element on the way.
    ///
    /// The result has `∏ left dims` rows and `∏ right dims` columns, with
    /// both groups fused in the order given. If the partition is already
    /// sorted (left group leading, right group trailing, both ascending) the
    /// buffer is reinterpreted without any data movement; otherwise the axes
    /// are permuted and copied once.
    pub(crate) fn to_matrix(
        &self,
        left: &[usize],
        right: &[usize],
        conj: bool,
    ) -> DenseResult<Mat<'_, A>>
    {
        self.check_partition(left, right)?;
        let m: usize = left.iter().map(|ax| self.shape()[*ax]).product();
        let n: usize = right.iter().map(|ax| self.shape()[*ax]).product();
        let mat: Mat<'_, A> =
            if sorted_partition(left, right) {
                // standard-layout invariant makes this reshape infallible
                self.data.view().into_shape((m, n)).unwrap().into()
            } else {
                let order: Vec<usize> =
                    left.iter().chain(right.iter()).copied().collect();
                let permuted =
                    self.data.view().permuted_axes(nd::IxDyn(&order));
                permuted.as_standard_layout()
                    .into_owned()
                    .into_shape((m, n))
                    .unwrap()
                    .into()
            };
        if conj && A::KIND.is_complex() {
            Ok(mat.mapv(Elem::conj).into())
        } else {
            Ok(mat)
        }
    }

    /// Inverse of [`to_matrix`][Self::to_matrix] for a sorted partition:
    /// reinterpret a matrix as a tensor whose shape is the concatenation of
    /// `left_dims` and `right_dims`.
    pub(crate) fn from_matrix(
        mat: nd::Array2<A>,
        left_dims: &[usize],
        right_dims: &[usize],
    ) -> Self
    {
        let shape: Vec<usize> =
            left_dims.iter().chain(right_dims.iter()).copied().collect();
        let data =
            mat.as_standard_layout()
            .into_owned()
            .into_shape(nd::IxDyn(&shape))
            .unwrap(); // matrix size equals the shape product by contract
        Self { data }
    }

    fn check_partition(&self, left: &[usize], right: &[usize])
        -> DenseResult<()>
    {
        let nd = self.ndim();
        let mut seen: Vec<bool> = vec![false; nd];
        for ax in left.iter().chain(right.iter()) {
            if *ax >= nd { return Err(AxisOutOfBounds(*ax, nd)); }
            if seen[*ax] { return Err(DuplicateAxis(*ax)); }
            seen[*ax] = true;
        }
        let covered = seen.iter().filter(|s| **s).count();
        if covered != nd { return Err(IncompletePartition(covered, nd)); }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use num_complex::Complex64 as C64;

    #[test]
    fn fused_index_roundtrip() {
        let dims = [2, 3, 4];
        let mut values = [0; 3];
        for p in 0..24 {
            decode(p, &dims, &mut values);
            assert_eq!(encode(&values, &dims), p);
        }
        // last index fastest
        decode(1, &dims, &mut values);
        assert_eq!(values, [0, 0, 1]);
        decode(4, &dims, &mut values);
        assert_eq!(values, [0, 1, 0]);
    }

    #[test]
    fn sorted_partition_detection() {
        assert!(sorted_partition(&[0, 1], &[2, 3]));
        assert!(sorted_partition(&[], &[0, 1]));
        assert!(sorted_partition(&[0], &[1]));
        assert!(!sorted_partition(&[1, 0], &[2, 3]));
        assert!(!sorted_partition(&[0, 2], &[1, 3]));
        assert!(!sorted_partition(&[1], &[0]));
    }

    #[test]
    fn matrix_form_fast_path_matches_permuted() {
        let t = DenseTensor::new(
            &[2, 3, 4],
            |ix| (100 * ix[0] + 10 * ix[1] + ix[2]) as f64,
        );
        // sorted partition: pure reshape
        let m = t.to_matrix(&[0, 1], &[2], false).unwrap();
        assert_eq!(m.shape(), [6, 4]);
        assert_eq!(m[[0, 3]], 3.0);
        assert_eq!(m[[5, 0]], 120.0);
        // permuted partition must agree with manual fusing
        let mp = t.to_matrix(&[2], &[0, 1], false).unwrap();
        assert_eq!(mp.shape(), [4, 6]);
        for i in 0..6 {
            for j in 0..4 {
                assert_eq!(m[[i, j]], mp[[j, i]]);
            }
        }
    }

    #[test]
    fn matrix_form_conjugates() {
        let t = DenseTensor::new(
            &[2, 2],
            |ix| C64::new(ix[0] as f64, ix[1] as f64),
        );
        let m = t.to_matrix(&[0], &[1], true).unwrap();
        assert_eq!(m[[1, 1]], C64::new(1.0, -1.0));
        let back = DenseTensor::from_matrix(
            m.into_owned(), &[2], &[2]);
        assert_eq!(back.get(&[1, 1]), Some(&C64::new(1.0, -1.0)));
    }

    #[test]
    fn partition_validation() {
        let t: DenseTensor<f64> = DenseTensor::zeros(&[2, 2, 2]);
        assert!(t.to_matrix(&[0, 1], &[2], false).is_ok());
        assert!(matches!(
            t.to_matrix(&[0, 1], &[1, 2], false),
            Err(DenseError::DuplicateAxis(1)),
        ));
        assert!(matches!(
            t.to_matrix(&[0], &[1], false),
            Err(DenseError::IncompletePartition(2, 3)),
        ));
        assert!(matches!(
            t.to_matrix(&[0, 1], &[5], false),
            Err(DenseError::AxisOutOfBounds(5, 3)),
        ));
    }

    #[test]
    fn scalar_tensor() {
        let s = DenseTensor::scalar(4.25_f64);
        assert_eq!(s.ndim(), 0);
        assert_eq!(s.as_scalar(), Some(4.25));
        assert_eq!(s.len(), 1);
    }
}
