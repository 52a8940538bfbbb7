//! The contraction engine: every public tensor-algebra operation of the
//! crate, uniformly over dense and block-sparse operands.
//!
//! All entry points take operands through the [`Tensor`] variant type and
//! dispatch on its runtime tag; the capability set behind the dispatch is
//! small -- matrix-form adaptation, block iteration, conjugation -- and has
//! exactly two implementations.
//!
//! The dense algorithm adapts each operand to matrix form with the
//! contracted indices fused on the inner dimension and runs one generalized
//! matrix multiply, fused with the optional accumulation tensor
//! (`C = alpha·A·B + beta·Z`). The block-sparse algorithm does the same
//! shape bookkeeping, but the multiply step is replaced by the block
//! matcher followed by one dense multiply per matched pair; the per-pair
//! multiplies are mutually independent and may be distributed over a
//! [`ContractorPool`].
//!
//! The production contraction path trusts upstream quantum-number
//! assignments and performs no label validation per call; the validating
//! path is [`checkcontract`], which is also run automatically in debug
//! builds. This cheap-and-trusting default is deliberate.
//!
//! Conjugation naming follows the usual tensor-network convention:
//! [`ccontract`] conjugates the first operand, [`contractc`] the second,
//! [`ccontractc`] both. The scalar-valued [`dot`] and [`dot3`] are instead
//! parameterized by a per-operand [`Transform`], giving a single
//! implementation behind all conjugation variants.

use log::{ debug, trace };
use ndarray as nd;
use num_traits::{ One, Zero };
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use crate::{
    Elem,
    Promote,
    blocksparse::{
        match_blocks, Block, BlockError, BlockTensor, Sector,
    },
    dense::{ decode, DenseError, DenseTensor, Mat },
    pool::{ ContractorPool, PoolError },
    qnum::Qnum,
};

#[derive(Debug, Error)]
pub enum ContractError {
    /// Returned when the two contracted-index lists have different lengths.
    #[error("error in contraction: {0} indices contracted against {1}")]
    ArityMismatch(usize, usize),

    /// Returned when a contracted pair of indices disagrees in dimension.
    #[error("error in contraction: axis {0} (dim {1}) contracted against axis {2} (dim {3})")]
    ShapeMismatch(usize, usize, usize, usize),

    /// Returned when an index list names an axis outside `0..ndim`.
    #[error("error in contraction: axis {0} out of bounds for a rank-{1} operand")]
    AxisOutOfBounds(usize, usize),

    /// Returned when an axis appears more than once in an index list.
    #[error("error in contraction: duplicate axis {0}")]
    DuplicateAxis(usize),

    /// Returned by the validation path when a contracted index pair does
    /// not carry mutually inverse quantum-number label sequences.
    #[error("error in contraction: quantum numbers on axes {0} and {1} are not mutually inverse")]
    QnumMismatch(usize, usize),

    /// Returned by the three-operand dot when a quantum-number-matched
    /// middle block's size does not equal the product of its partners'
    /// sizes; identifies the middle, left, and right blocks.
    #[error("error in dot: middle block {0} is {1}x{2} against blocks of size {3} and {4}")]
    BlockSizeInconsistency(usize, usize, usize, usize, usize),

    /// Returned when an accumulation tensor's shape does not match the
    /// contraction result.
    #[error("error in accumulation: result shape {0:?}, accumulator shape {1:?}")]
    AccShapeMismatch(Vec<usize>, Vec<usize>),

    /// Returned when a block-sparse accumulation tensor's labels or flux do
    /// not match the contraction result.
    #[error("error in accumulation: accumulator labels or flux do not match the result")]
    AccStructureMismatch,

    /// Returned by [`dot`] when two block-sparse operands do not share a
    /// sector partition.
    #[error("error in dot: operands do not share a sector partition")]
    DotStructureMismatch,

    /// Returned by the dense-tensor layer.
    #[error("dense tensor error: {0}")]
    DenseError(#[from] DenseError),

    /// Returned by the block-sparse layer.
    #[error("block tensor error: {0}")]
    BlockError(#[from] BlockError),

    /// Returned by the contractor pool.
    #[error("contractor pool error: {0}")]
    PoolError(#[from] PoolError),
}
use ContractError::*;
pub type ContractResult<T> = Result<T, ContractError>;

/// Elementwise transform applied to an operand before multiplication.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transform {
    /// Leave elements as they are.
    Id,
    /// Complex-conjugate every element (and invert quantum-number arrows).
    Conj,
}

impl Transform {
    /// Apply the transform to a single element.
    pub fn apply<A>(self, a: A) -> A
    where A: Elem
    {
        match self {
            Self::Id => a,
            Self::Conj => a.conj(),
        }
    }

    /// Return `true` if the transform conjugates.
    pub fn is_conj(self) -> bool { matches!(self, Self::Conj) }
}

/// A tensor in either dense or symmetry-block-sparse representation.
///
/// All engine entry points accept and return this type; rank-0 results are
/// always returned in the `Dense` variant.
#[derive(Clone, Debug, PartialEq)]
pub enum Tensor<Q, A> {
    /// Ordinary dense storage.
    Dense(DenseTensor<A>),
    /// Conservation-law block storage.
    Blocked(BlockTensor<Q, A>),
}

impl<Q, A> Tensor<Q, A>
where
    Q: Qnum,
    A: Elem,
{
    /// Return the dimensions of each index.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Self::Dense(t) => t.shape().to_vec(),
            Self::Blocked(t) => t.shape(),
        }
    }

    /// Return the rank (number of indices).
    pub fn ndim(&self) -> usize {
        match self {
            Self::Dense(t) => t.ndim(),
            Self::Blocked(t) => t.ndim(),
        }
    }

    /// Return `true` if the tensor is stored block-sparse.
    pub fn is_blocked(&self) -> bool { matches!(self, Self::Blocked(_)) }

    /// Return the elementwise complex conjugate of `self`; for the blocked
    /// representation this also inverts every label and the flux.
    pub fn conj(&self) -> Self {
        match self {
            Self::Dense(t) => Self::Dense(t.conj()),
            Self::Blocked(t) => Self::Blocked(t.conj()),
        }
    }

    /// Return a new tensor scaled by `alpha`.
    pub fn scaled(&self, alpha: A) -> Self {
        match self {
            Self::Dense(t) => Self::Dense(t.scaled(alpha)),
            Self::Blocked(t) => Self::Blocked(t.scaled(alpha)),
        }
    }

    /// Apply a mapping function to every stored element, preserving
    /// structure.
    pub fn map<F, B>(&self, f: F) -> Tensor<Q, B>
    where
        F: FnMut(&A) -> B,
        B: Elem,
    {
        match self {
            Self::Dense(t) => Tensor::Dense(t.map(f)),
            Self::Blocked(t) => Tensor::Blocked(t.map(f)),
        }
    }

    /// If `self` has rank 0, extract its single element.
    pub fn as_scalar(&self) -> Option<A> {
        match self {
            Self::Dense(t) => t.as_scalar(),
            Self::Blocked(t) =>
                (t.ndim() == 0)
                .then(|| t.to_dense())
                .and_then(|d| d.as_scalar()),
        }
    }

    /// Expand to a dense tensor regardless of representation.
    pub fn to_dense(&self) -> DenseTensor<A> {
        match self {
            Self::Dense(t) => t.clone(),
            Self::Blocked(t) => t.to_dense(),
        }
    }

    /// Return `true` if `self` and `other` agree in shape and numeric
    /// content to within `thresh` (default `1e-12`), regardless of
    /// representation or block order.
    pub fn approx_eq(&self, other: &Self, thresh: Option<f64>) -> bool {
        self.to_dense().approx_eq(&other.to_dense(), thresh)
    }
}

// generalized multiply kernel; ndarray's general_mat_mul runs a BLAS-class
// routine for f32/f64/c32/c64 and a generic multiply-then-sum loop for
// anything else (i.e. integers)
fn gemm<A>(
    alpha: A,
    a: &Mat<'_, A>,
    b: &Mat<'_, A>,
    beta: A,
    c: &mut nd::Array2<A>,
)
where A: Elem
{
    trace!(
        "gemm: ({} x {}) * ({} x {}), kind {:?}",
        a.nrows(), a.ncols(), b.nrows(), b.ncols(), A::KIND,
    );
    nd::linalg::general_mat_mul(alpha, a, b, beta, c);
}

fn complement(ndim: usize, taken: &[usize]) -> ContractResult<Vec<usize>> {
    let mut seen: Vec<bool> = vec![false; ndim];
    for ax in taken.iter() {
        if *ax >= ndim { return Err(AxisOutOfBounds(*ax, ndim)); }
        if seen[*ax] { return Err(DuplicateAxis(*ax)); }
        seen[*ax] = true;
    }
    Ok((0..ndim).filter(|ax| !seen[*ax]).collect())
}

fn conj_mat<'a, A>(mat: Mat<'a, A>, conj: bool) -> Mat<'a, A>
where A: Elem
{
    if conj && A::KIND.is_complex() {
        mat.mapv(Elem::conj).into()
    } else {
        mat
    }
}

/// Contract `a` and `b` over the paired index lists `ia`/`ib`, returning
/// `alpha·(a × b)`, or `alpha·(a × b) + beta·z` when an accumulation tensor
/// is given. No conjugation.
///
/// The result's indices are `a`'s free indices (in order) followed by
/// `b`'s. Empty index lists produce the outer product; contracting all
/// indices produces a rank-0 result. `beta` is ignored when `acc` is
/// `None`.
pub fn contract<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    b: &Tensor<Q, A>,
    ib: &[usize],
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    contract_inner(a, ia, false, b, ib, false, acc, alpha, beta, None)
}

/// [`contract`], conjugating the first operand.
pub fn ccontract<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    b: &Tensor<Q, A>,
    ib: &[usize],
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    contract_inner(a, ia, true, b, ib, false, acc, alpha, beta, None)
}

/// [`contract`], conjugating the second operand.
pub fn contractc<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    b: &Tensor<Q, A>,
    ib: &[usize],
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    contract_inner(a, ia, false, b, ib, true, acc, alpha, beta, None)
}

/// [`contract`], conjugating both operands.
pub fn ccontractc<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    b: &Tensor<Q, A>,
    ib: &[usize],
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    contract_inner(a, ia, true, b, ib, true, acc, alpha, beta, None)
}

/// [`contract`] with explicit conjugation flags and the per-pair block
/// multiplies distributed over a [`ContractorPool`].
///
/// The matched block pairs are mutually independent, so each worker writes
/// to its own pre-allocated output slot; the pool joins all workers before
/// result assembly. Only the block-sparse path uses the pool -- dense
/// contractions run a single fused multiply.
#[allow(clippy::too_many_arguments)]
pub fn contract_pooled<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    conj_a: bool,
    b: &Tensor<Q, A>,
    ib: &[usize],
    conj_b: bool,
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
    pool: &ContractorPool<A>,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    contract_inner(a, ia, conj_a, b, ib, conj_b, acc, alpha, beta, Some(pool))
}

/// Full self-contraction of `a` with itself (no conjugation): `Σ_i a_i²`.
pub fn contract_self<Q, A>(a: &Tensor<Q, A>) -> ContractResult<A>
where
    Q: Qnum,
    A: Elem,
{
    dot(a, a, Transform::Id, Transform::Id)
}

/// Full self-contraction with the first copy conjugated:
/// `Σ_i |a_i|²`, the squared norm.
pub fn ccontract_self<Q, A>(a: &Tensor<Q, A>) -> ContractResult<A>
where
    Q: Qnum,
    A: Elem,
{
    dot(a, a, Transform::Conj, Transform::Id)
}

/// Full self-contraction with the second copy conjugated; coincides with
/// [`ccontract_self`] because both operands are the same tensor.
pub fn contractc_self<Q, A>(a: &Tensor<Q, A>) -> ContractResult<A>
where
    Q: Qnum,
    A: Elem,
{
    dot(a, a, Transform::Id, Transform::Conj)
}

/// Full self-contraction with both copies conjugated: the conjugate of
/// [`contract_self`].
pub fn ccontractc_self<Q, A>(a: &Tensor<Q, A>) -> ContractResult<A>
where
    Q: Qnum,
    A: Elem,
{
    dot(a, a, Transform::Conj, Transform::Conj)
}

/// Euclidean norm: `sqrt(Σ_i |a_i|²)`.
///
/// A zero result is returned as-is; whether a zero norm is degenerate is
/// the caller's concern.
pub fn norm<Q, A>(a: &Tensor<Q, A>) -> ContractResult<f64>
where
    Q: Qnum,
    A: Elem,
{
    ccontract_self(a).map(|s| s.into_c64().re.sqrt())
}

/// Outer (tensor) product: [`contract`] with empty index lists.
pub fn tensor_prod<Q, A>(a: &Tensor<Q, A>, b: &Tensor<Q, A>)
    -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    contract(a, &[], b, &[], None, A::one(), A::zero())
}

/// Contract two tensors of mixed element types, promoting both operands to
/// the natural type of their product (e.g. real × complex → complex).
pub fn contract_promote<Q, A, B>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    b: &Tensor<Q, B>,
    ib: &[usize],
) -> ContractResult<Tensor<Q, <A as Promote<B>>::Output>>
where
    Q: Qnum,
    A: Promote<B>,
    B: Elem,
{
    let ap: Tensor<Q, <A as Promote<B>>::Output> = a.map(|x| x.promote());
    let bp: Tensor<Q, <A as Promote<B>>::Output> = b.map(|x| A::promote_rhs(*x));
    contract(&ap, ia, &bp, ib, None, <A as Promote<B>>::Output::one(), <A as Promote<B>>::Output::zero())
}

/// Validate a proposed contraction without performing it: contracted index
/// dimensions must agree, and for block-sparse operands the contracted
/// label sequences must be mutually inverse.
///
/// This is the diagnostic counterpart of the trusting production path; it
/// is never called from the hot path in release builds, but runs
/// automatically inside [`contract`] in debug builds.
pub fn checkcontract<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    b: &Tensor<Q, A>,
    ib: &[usize],
) -> ContractResult<()>
where
    Q: Qnum,
    A: Elem,
{
    validate(a, ia, false, b, ib, false)
}

fn validate<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    conj_a: bool,
    b: &Tensor<Q, A>,
    ib: &[usize],
    conj_b: bool,
) -> ContractResult<()>
where
    Q: Qnum,
    A: Elem,
{
    if ia.len() != ib.len() {
        return Err(ArityMismatch(ia.len(), ib.len()));
    }
    let sa = a.shape();
    let sb = b.shape();
    complement(sa.len(), ia)?;
    complement(sb.len(), ib)?;
    for (ka, kb) in ia.iter().zip(ib.iter()) {
        if sa[*ka] != sb[*kb] {
            return Err(ShapeMismatch(*ka, sa[*ka], *kb, sb[*kb]));
        }
    }
    if let (Tensor::Blocked(ta), Tensor::Blocked(tb)) = (a, b) {
        for (ka, kb) in ia.iter().zip(ib.iter()) {
            let la = &ta.qnums()[*ka];
            let lb = &tb.qnums()[*kb];
            let inverse =
                la.iter().zip(lb.iter())
                .all(|(qa, qb)| {
                    qa.adjusted(conj_a)
                        == qb.adjusted(conj_b).inverse()
                });
            if !inverse { return Err(QnumMismatch(*ka, *kb)); }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn contract_inner<Q, A>(
    a: &Tensor<Q, A>,
    ia: &[usize],
    conj_a: bool,
    b: &Tensor<Q, A>,
    ib: &[usize],
    conj_b: bool,
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
    pool: Option<&ContractorPool<A>>,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    if ia.len() != ib.len() {
        return Err(ArityMismatch(ia.len(), ib.len()));
    }
    let sa = a.shape();
    let sb = b.shape();
    let fa = complement(sa.len(), ia)?;
    let fb = complement(sb.len(), ib)?;
    for (ka, kb) in ia.iter().zip(ib.iter()) {
        if sa[*ka] != sb[*kb] {
            return Err(ShapeMismatch(*ka, sa[*ka], *kb, sb[*kb]));
        }
    }
    if cfg!(debug_assertions) {
        validate(a, ia, conj_a, b, ib, conj_b)?;
    }
    match (a, b) {
        (Tensor::Blocked(ta), Tensor::Blocked(tb)) => {
            contract_blocked(
                ta, ia, &fa, conj_a,
                tb, ib, &fb, conj_b,
                acc, alpha, beta, pool,
            )
        },
        _ => {
            // mixed representations: expand the blocked operand and take
            // the dense path
            let da = a.to_dense();
            let db = b.to_dense();
            contract_dense(
                &da, ia, &fa, conj_a,
                &db, ib, &fb, conj_b,
                acc, alpha, beta,
            )
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn contract_dense<Q, A>(
    a: &DenseTensor<A>,
    ia: &[usize],
    fa: &[usize],
    conj_a: bool,
    b: &DenseTensor<A>,
    ib: &[usize],
    fb: &[usize],
    conj_b: bool,
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    debug!(
        "contract: dense path, free {} x {}, inner {}",
        fa.len(), fb.len(), ia.len(),
    );
    let am = a.to_matrix(fa, ia, conj_a)?;
    let bm = b.to_matrix(ib, fb, conj_b)?;
    let fa_dims: Vec<usize> =
        fa.iter().map(|ax| a.shape()[*ax]).collect();
    let fb_dims: Vec<usize> =
        fb.iter().map(|ax| b.shape()[*ax]).collect();
    let out_shape: Vec<usize> =
        fa_dims.iter().chain(fb_dims.iter()).copied().collect();
    let (mut c, beta_eff): (nd::Array2<A>, A) = match acc {
        Some(z) => {
            let zd = z.to_dense();
            if zd.shape() != out_shape.as_slice() {
                return Err(AccShapeMismatch(
                    out_shape, zd.shape().to_vec()));
            }
            let left: Vec<usize> = (0..fa.len()).collect();
            let right: Vec<usize> = (fa.len()..out_shape.len()).collect();
            let zm = zd.to_matrix(&left, &right, false)?.into_owned();
            (zm, beta)
        },
        None => {
            (nd::Array2::zeros((am.nrows(), bm.ncols())), A::zero())
        },
    };
    gemm(alpha, &am, &bm, beta_eff, &mut c);
    Ok(Tensor::Dense(DenseTensor::from_matrix(c, &fa_dims, &fb_dims)))
}

#[allow(clippy::too_many_arguments)]
fn contract_blocked<Q, A>(
    a: &BlockTensor<Q, A>,
    ia: &[usize],
    fa: &[usize],
    conj_a: bool,
    b: &BlockTensor<Q, A>,
    ib: &[usize],
    fb: &[usize],
    conj_b: bool,
    acc: Option<&Tensor<Q, A>>,
    alpha: A,
    beta: A,
    pool: Option<&ContractorPool<A>>,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    let a2 = a.reblocked(fa, ia)?;
    let b2 = b.reblocked(ib, fb)?;
    let pairs = match_blocks(&a2, conj_a, &b2, conj_b);
    debug!(
        "contract: blocked path, {} matched pairs, pooled: {}",
        pairs.len(), pool.is_some(),
    );

    // per-pair dense multiplies; outputs are independent and land in
    // disjoint slots in pair order
    let products: Vec<nd::Array2<A>> = match pool {
        Some(pool) => {
            let jobs: Vec<(nd::Array2<A>, nd::Array2<A>)> =
                pairs.iter()
                .map(|(ka, kb)| {
                    let lhs = conj_mat(
                        a2.blocks()[*ka].data.view().into(), conj_a);
                    let rhs = conj_mat(
                        b2.blocks()[*kb].data.view().into(), conj_b);
                    (lhs.into_owned(), rhs.into_owned())
                })
                .collect();
            pool.run(alpha, jobs)?
        },
        None => {
            pairs.iter()
                .map(|(ka, kb)| {
                    let lhs = conj_mat(
                        a2.blocks()[*ka].data.view().into(), conj_a);
                    let rhs = conj_mat(
                        b2.blocks()[*kb].data.view().into(), conj_b);
                    let mut c: nd::Array2<A> =
                        nd::Array2::zeros((lhs.nrows(), rhs.ncols()));
                    gemm(alpha, &lhs, &rhs, A::zero(), &mut c);
                    c
                })
                .collect()
        },
    };

    // full scalar contraction: sum the 1x1 products and return dense
    if fa.is_empty() && fb.is_empty() {
        let mut total: A =
            products.iter()
            .fold(A::zero(), |acc, p| acc + p[[0, 0]]);
        if let Some(z) = acc {
            if z.ndim() != 0 {
                return Err(AccShapeMismatch(Vec::new(), z.shape()));
            }
            // rank-0 accumulator always has exactly one element
            let z0 = z.as_scalar().unwrap();
            total = total + beta * z0;
        }
        return Ok(Tensor::Dense(DenseTensor::scalar(total)));
    }

    // output structure: A free labels ++ B free labels, conjugation-
    // adjusted, with the matrix view (A free | B free)
    let out_qnums: Vec<Vec<Q>> =
        fa.iter()
        .map(|ax| adjusted_labels(&a.qnums()[*ax], conj_a))
        .chain(
            fb.iter()
            .map(|ax| adjusted_labels(&b.qnums()[*ax], conj_b)))
        .collect();
    let out_flux: Q =
        a.flux().adjusted(conj_a).add(b.flux().adjusted(conj_b));
    let out_rowidx: Vec<usize> = (0..fa.len()).collect();
    let out_colidx: Vec<usize> = (fa.len()..fa.len() + fb.len()).collect();
    let out_rows: Vec<Sector<Q>> =
        a2.row_sectors().iter().map(|s| s.adjusted(conj_a)).collect();
    let out_cols: Vec<Sector<Q>> =
        b2.col_sectors().iter().map(|s| s.adjusted(conj_b)).collect();

    let mut slots: HashMap<(usize, usize), nd::Array2<A>> =
        HashMap::default();
    for ((ka, kb), product) in pairs.iter().zip(products) {
        let key = (a2.blocks()[*ka].row, b2.blocks()[*kb].col);
        slots.entry(key)
            .and_modify(|data| { *data = &*data + &product; })
            .or_insert(product);
    }

    if let Some(z) = acc {
        let zb = match z {
            Tensor::Blocked(zb) => {
                if zb.qnums() != out_qnums.as_slice()
                    || zb.flux() != out_flux
                {
                    return Err(AccStructureMismatch);
                }
                zb.reblocked(&out_rowidx, &out_colidx)?
            },
            Tensor::Dense(zd) => {
                let out_shape: Vec<usize> =
                    out_qnums.iter().map(|l| l.len()).collect();
                if zd.shape() != out_shape.as_slice() {
                    return Err(AccShapeMismatch(
                        out_shape, zd.shape().to_vec()));
                }
                BlockTensor::from_dense(
                    zd, out_qnums.clone(), out_flux,
                    &out_rowidx, &out_colidx,
                )?
            },
        };
        // identical labels mean identical sector partitions; map the
        // accumulator's sectors onto the output's by quantum number
        let row_of: HashMap<Q, usize> =
            out_rows.iter().enumerate()
            .map(|(k, s)| (s.q, k))
            .collect();
        let col_of: HashMap<Q, usize> =
            out_cols.iter().enumerate()
            .map(|(k, s)| (s.q, k))
            .collect();
        for block in zb.blocks() {
            let qr = zb.row_sectors()[block.row].q;
            let qc = zb.col_sectors()[block.col].q;
            let (ri, ci) = match (row_of.get(&qr), col_of.get(&qc)) {
                (Some(ri), Some(ci)) => (*ri, *ci),
                _ => return Err(AccStructureMismatch),
            };
            let scaled = block.data.mapv(|x| x * beta);
            slots.entry((ri, ci))
                .and_modify(|data| { *data = &*data + &scaled; })
                .or_insert(scaled);
        }
    }

    let mut blocks: Vec<Block<A>> =
        slots.into_iter()
        .filter(|(_, data)| data.nrows() != 0 && data.ncols() != 0)
        .map(|((row, col), data)| Block { row, col, data })
        .collect();
    blocks.sort_by(|b0, b1| {
        (out_rows[b0.row].q, out_cols[b0.col].q)
            .cmp(&(out_rows[b1.row].q, out_cols[b1.col].q))
    });
    Ok(Tensor::Blocked(BlockTensor::from_parts(
        out_qnums, out_flux, out_rowidx, out_colidx,
        out_rows, out_cols, blocks,
    )))
}

fn adjusted_labels<Q>(labels: &[Q], conj: bool) -> Vec<Q>
where Q: Qnum
{
    labels.iter().map(|q| q.adjusted(conj)).collect()
}

/// Full scalar contraction `Σ_i fa(a_i)·fb(b_i)` over every index of both
/// operands, which must have identical shapes.
///
/// This single implementation sits behind all four conjugation variants of
/// the zero-index-list contractions; pass [`Transform::Conj`] for the
/// operands to be conjugated. Block-sparse operands must share a sector
/// partition (labels inducing the same position bucketing), which holds in
/// particular whenever the label lists are equal or mutually inverse.
pub fn dot<Q, A>(
    a: &Tensor<Q, A>,
    b: &Tensor<Q, A>,
    fa: Transform,
    fb: Transform,
) -> ContractResult<A>
where
    Q: Qnum,
    A: Elem,
{
    let sa = a.shape();
    let sb = b.shape();
    if sa.len() != sb.len() {
        return Err(ArityMismatch(sa.len(), sb.len()));
    }
    for (ax, (da, db)) in sa.iter().zip(sb.iter()).enumerate() {
        if da != db {
            return Err(ShapeMismatch(ax, *da, ax, *db));
        }
    }
    match (a, b) {
        (Tensor::Blocked(ta), Tensor::Blocked(tb)) => {
            let tb2 = {
                let (row, col) = ta.currblock();
                tb.reblocked(row, col)?
            };
            // match stored blocks by the positions they cover; sectors
            // that only one side stores contribute nothing
            let by_pos: HashMap<(usize, usize), usize> =
                tb2.blocks().iter().enumerate()
                .map(|(k, block)| {
                    let rows = &tb2.row_sectors()[block.row].elems;
                    let cols = &tb2.col_sectors()[block.col].elems;
                    ((rows[0], cols[0]), k)
                })
                .collect();
            let mut total = A::zero();
            for block in ta.blocks() {
                let rows = &ta.row_sectors()[block.row].elems;
                let cols = &ta.col_sectors()[block.col].elems;
                let Some(kb) = by_pos.get(&(rows[0], cols[0]))
                    else { continue; };
                let other = &tb2.blocks()[*kb];
                let orows = &tb2.row_sectors()[other.row].elems;
                let ocols = &tb2.col_sectors()[other.col].elems;
                if rows != orows || cols != ocols {
                    return Err(DotStructureMismatch);
                }
                total =
                    block.data.iter().zip(other.data.iter())
                    .fold(total, |acc, (x, y)| {
                        acc + fa.apply(*x) * fb.apply(*y)
                    });
            }
            Ok(total)
        },
        _ => {
            let da = a.to_dense();
            let db = b.to_dense();
            let total =
                da.as_array().iter().zip(db.as_array().iter())
                .fold(A::zero(), |acc, (x, y)| {
                    acc + fa.apply(*x) * fb.apply(*y)
                });
            Ok(total)
        },
    }
}

/// Three-operand scalar contraction `Σ_ij fa(a_i)·fh(h_ij)·fb(b_j)`: the
/// inner product of `a` with `h` applied to `b`, where `h`'s indices are
/// `a`'s followed by `b`'s.
///
/// For block-sparse operands, blocks are matched through the conservation
/// law; a quantum-number-matched middle block whose size does not equal
/// (left block) × (right block) is a fatal
/// [`BlockSizeInconsistency`][ContractError::BlockSizeInconsistency] --
/// the sign of an inconsistent label assignment upstream -- never a
/// silently dropped block.
pub fn dot3<Q, A>(
    a: &Tensor<Q, A>,
    h: &Tensor<Q, A>,
    b: &Tensor<Q, A>,
    fa: Transform,
    fh: Transform,
    fb: Transform,
) -> ContractResult<A>
where
    Q: Qnum,
    A: Elem,
{
    let sa = a.shape();
    let sb = b.shape();
    let sh = h.shape();
    if sh.len() != sa.len() + sb.len() {
        return Err(ArityMismatch(sh.len(), sa.len() + sb.len()));
    }
    for (ax, d) in sa.iter().chain(sb.iter()).enumerate() {
        if sh[ax] != *d {
            return Err(ShapeMismatch(ax, sh[ax], ax, *d));
        }
    }
    match (a, h, b) {
        (Tensor::Blocked(ta), Tensor::Blocked(th), Tensor::Blocked(tb)) => {
            dot3_blocked(ta, th, tb, fa, fh, fb)
        },
        _ => {
            let all_a: Vec<usize> = (0..sa.len()).collect();
            let all_b: Vec<usize> = (0..sb.len()).collect();
            let hb: Vec<usize> = (sa.len()..sh.len()).collect();
            let va = a.to_dense()
                .to_matrix(&all_a, &[], fa.is_conj())?
                .into_owned();
            let hm = h.to_dense()
                .to_matrix(&all_a, &hb, fh.is_conj())?
                .into_owned();
            let vb = b.to_dense()
                .to_matrix(&all_b, &[], fb.is_conj())?
                .into_owned();
            let hv: nd::Array2<A> = hm.dot(&vb);
            let total =
                va.iter().zip(hv.iter())
                .fold(A::zero(), |acc, (x, y)| acc + *x * *y);
            Ok(total)
        },
    }
}

fn dot3_blocked<Q, A>(
    a: &BlockTensor<Q, A>,
    h: &BlockTensor<Q, A>,
    b: &BlockTensor<Q, A>,
    fa: Transform,
    fh: Transform,
    fb: Transform,
) -> ContractResult<A>
where
    Q: Qnum,
    A: Elem,
{
    let na = a.ndim();
    let nh = h.ndim();
    let all_a: Vec<usize> = (0..na).collect();
    let all_b: Vec<usize> = (0..b.ndim()).collect();
    let h_rows: Vec<usize> = (0..na).collect();
    let h_cols: Vec<usize> = (na..nh).collect();
    let a2 = a.reblocked(&all_a, &[])?;
    let b2 = b.reblocked(&all_b, &[])?;
    let h2 = h.reblocked(&h_rows, &h_cols)?;
    // fully fused with an empty column group, each operand stores at most
    // one legal block (its flux sector)
    let Some(ablk) = a2.blocks().first() else { return Ok(A::zero()); };
    let Some(bblk) = b2.blocks().first() else { return Ok(A::zero()); };
    let qa = a2.row_sectors()[ablk.row].q.adjusted(fa.is_conj());
    let qb = b2.row_sectors()[bblk.row].q.adjusted(fb.is_conj());
    // the matched middle block must cancel both operand charges
    let qh_row = qa.inverse().adjusted(fh.is_conj());
    let qh_col = qb.inverse().adjusted(fh.is_conj());
    let matched =
        h2.blocks().iter().enumerate()
        .find(|(_, block)| {
            h2.row_sectors()[block.row].q == qh_row
                && h2.col_sectors()[block.col].q == qh_col
        });
    let Some((kh, hblk)) = matched else { return Ok(A::zero()); };
    let arows = &a2.row_sectors()[ablk.row].elems;
    let brows = &b2.row_sectors()[bblk.row].elems;
    if hblk.data.nrows() != arows.len()
        || hblk.data.ncols() != brows.len()
    {
        return Err(BlockSizeInconsistency(
            kh,
            hblk.data.nrows(), hblk.data.ncols(),
            arows.len(), brows.len(),
        ));
    }
    let mut total = A::zero();
    for (i, _) in arows.iter().enumerate() {
        let xa = fa.apply(ablk.data[[i, 0]]);
        for (j, _) in brows.iter().enumerate() {
            let xh = fh.apply(hblk.data[[i, j]]);
            let xb = fb.apply(bblk.data[[j, 0]]);
            total = total + xa * xh * xb;
        }
    }
    Ok(total)
}

/// Contract `a` with an implicit identity tensor over the given index
/// pairs, eliminating them; `pairs = None` traces the first two indices.
///
/// Each pair's two indices must have equal dimension; for block-sparse
/// operands their label sequences must additionally be mutually inverse
/// (validated in debug builds).
pub fn trace<Q, A>(
    a: &Tensor<Q, A>,
    pairs: Option<&[(usize, usize)]>,
) -> ContractResult<Tensor<Q, A>>
where
    Q: Qnum,
    A: Elem,
{
    let default_pairs = [(0, 1)];
    let pairs: &[(usize, usize)] = pairs.unwrap_or(&default_pairs);
    let shape = a.shape();
    let flat: Vec<usize> =
        pairs.iter()
        .flat_map(|(p0, p1)| [*p0, *p1])
        .collect();
    let mut seen: Vec<bool> = vec![false; shape.len()];
    for ax in flat.iter() {
        if *ax >= shape.len() {
            return Err(AxisOutOfBounds(*ax, shape.len()));
        }
        if seen[*ax] { return Err(DuplicateAxis(*ax)); }
        seen[*ax] = true;
    }
    for (p0, p1) in pairs.iter() {
        if shape[*p0] != shape[*p1] {
            return Err(ShapeMismatch(*p0, shape[*p0], *p1, shape[*p1]));
        }
    }
    let free: Vec<usize> =
        (0..shape.len()).filter(|ax| !seen[*ax]).collect();
    let pair_dims: Vec<usize> =
        flat.iter().map(|ax| shape[*ax]).collect();
    debug!(
        "trace: {} pairs over a rank-{} operand",
        pairs.len(), shape.len(),
    );
    match a {
        Tensor::Dense(t) => {
            let mat = t.to_matrix(&free, &flat, false)?;
            let free_dims: Vec<usize> =
                free.iter().map(|ax| shape[*ax]).collect();
            let m: usize = free_dims.iter().product();
            let mut out: nd::Array2<A> = nd::Array2::zeros((m, 1));
            let mut values: Vec<usize> = vec![0; flat.len()];
            for c in 0..mat.ncols() {
                decode(c, &pair_dims, &mut values);
                let diagonal =
                    values.chunks_exact(2).all(|v| v[0] == v[1]);
                if !diagonal { continue; }
                for i in 0..m {
                    out[[i, 0]] = out[[i, 0]] + mat[[i, c]];
                }
            }
            Ok(Tensor::Dense(
                DenseTensor::from_matrix(out, &free_dims, &[])))
        },
        Tensor::Blocked(t) => {
            if cfg!(debug_assertions) {
                for (p0, p1) in pairs.iter() {
                    let l0 = &t.qnums()[*p0];
                    let l1 = &t.qnums()[*p1];
                    let inverse =
                        l0.iter().zip(l1.iter())
                        .all(|(q0, q1)| *q0 == q1.inverse());
                    if !inverse { return Err(QnumMismatch(*p0, *p1)); }
                }
            }
            let t2 = t.reblocked(&free, &flat)?;
            let out_qnums: Vec<Vec<Q>> =
                free.iter().map(|ax| t.qnums()[*ax].clone()).collect();
            let out_row: Vec<usize> = (0..free.len()).collect();
            let mut out = BlockTensor::zeros(
                out_qnums, t.flux(), &out_row, &[])?;
            let row_of: HashMap<Q, usize> =
                out.row_sectors().iter().enumerate()
                .map(|(k, s)| (s.q, k))
                .collect();
            let mut values: Vec<usize> = vec![0; flat.len()];
            for block in t2.blocks() {
                let qrow = t2.row_sectors()[block.row].q;
                // diagonal positions carry zero pair charge, so only the
                // flux row sector can receive contributions
                if qrow != t.flux() { continue; }
                let target = row_of[&qrow];
                let cols = &t2.col_sectors()[block.col].elems;
                let mut column: Vec<A> =
                    vec![A::zero(); block.data.nrows()];
                for (j, c) in cols.iter().enumerate() {
                    decode(*c, &pair_dims, &mut values);
                    let diagonal =
                        values.chunks_exact(2).all(|v| v[0] == v[1]);
                    if !diagonal { continue; }
                    for (i, acc) in column.iter_mut().enumerate() {
                        *acc = *acc + block.data[[i, j]];
                    }
                }
                // the traced tensor keeps its labels, so the output block
                // with this row sector exists and covers the same positions
                let slot =
                    out.blocks_mut().iter_mut()
                    .find(|b| b.row == target)
                    .unwrap();
                for (i, x) in column.iter().enumerate() {
                    slot.data[[i, 0]] = slot.data[[i, 0]] + *x;
                }
            }
            if free.is_empty() {
                // rank-0 results are always returned dense
                let total = out.to_dense().as_scalar().unwrap();
                Ok(Tensor::Dense(DenseTensor::scalar(total)))
            } else {
                Ok(Tensor::Blocked(out))
            }
        },
    }
}

#[cfg(test)]
mod test {
    use num_complex::Complex64 as C64;
    use rand::Rng;
    use crate::{ blocksparse::BlockTensor, qnum::U1 };
    use super::*;

    fn logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn approx(a: f64, b: f64) -> bool { (a - b).abs() < 1e-10 }

    fn capprox(a: C64, b: C64) -> bool { (a - b).norm() < 1e-10 }

    fn dense<A>(shape: &[usize], elems: Vec<A>) -> Tensor<U1, A>
    where A: Elem
    {
        Tensor::Dense(DenseTensor::from_elems(shape, elems).unwrap())
    }

    fn bin() -> Vec<U1> { vec![U1(0), U1(1)] }

    fn bin_inv() -> Vec<U1> { vec![U1(0), U1(-1)] }

    // random dense tensor encoded block-sparse, together with its
    // conservation-filtered dense equivalent
    fn random_blocked(
        labels: Vec<Vec<U1>>,
        flux: U1,
        row: &[usize],
        col: &[usize],
    ) -> (BlockTensor<U1, f64>, DenseTensor<f64>)
    {
        let mut rng = rand::thread_rng();
        let shape: Vec<usize> =
            labels.iter().map(|l| l.len()).collect();
        let raw = DenseTensor::new(
            &shape, |_| rng.gen_range(-1.0..1.0_f64));
        let blocked =
            BlockTensor::from_dense(&raw, labels, flux, row, col)
            .unwrap();
        let filtered = blocked.to_dense();
        (blocked, filtered)
    }

    fn random_blocked_c64(
        labels: Vec<Vec<U1>>,
        flux: U1,
        row: &[usize],
        col: &[usize],
    ) -> (BlockTensor<U1, C64>, DenseTensor<C64>)
    {
        let mut rng = rand::thread_rng();
        let shape: Vec<usize> =
            labels.iter().map(|l| l.len()).collect();
        let raw = DenseTensor::new(
            &shape,
            |_| C64::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ),
        );
        let blocked =
            BlockTensor::from_dense(&raw, labels, flux, row, col)
            .unwrap();
        let filtered = blocked.to_dense();
        (blocked, filtered)
    }

    #[test]
    fn concrete_fused_accumulate() {
        let a = dense(&[2, 2], vec![1.0, 0.0, 0.0, -1.0]);
        let b = dense(&[2, 2], vec![-1.0, 0.0, 0.0, 1.0]);
        let z = dense(&[2, 2], vec![1.0, 0.0, 0.0, 0.0]);
        let c =
            contract(&a, &[1], &b, &[0], Some(&z), 2.0, 5.0).unwrap();
        let expected = dense(&[2, 2], vec![3.0, 0.0, 0.0, -2.0]);
        assert!(c.approx_eq(&expected, None));
    }

    #[test]
    fn concrete_trace_rank4() {
        let t: Tensor<U1, f64> =
            Tensor::Dense(DenseTensor::new(&[10, 20, 10, 20], |_| 1.0));
        let tr = trace(&t, Some(&[(0, 2), (1, 3)])).unwrap();
        assert_eq!(tr.ndim(), 0);
        assert!(approx(tr.as_scalar().unwrap(), 200.0));
    }

    #[test]
    fn default_trace_is_first_two_indices() {
        let t: Tensor<U1, f64> = Tensor::Dense(DenseTensor::new(
            &[3, 3, 2],
            |ix| if ix[0] == ix[1] { (1 + ix[2]) as f64 } else { 0.0 },
        ));
        let tr = trace(&t, None).unwrap();
        assert_eq!(tr.shape(), vec![2]);
        let td = tr.to_dense();
        assert!(approx(*td.get(&[0]).unwrap(), 3.0));
        assert!(approx(*td.get(&[1]).unwrap(), 6.0));
    }

    #[test]
    fn bilinearity_in_alpha() {
        let mut rng = rand::thread_rng();
        let a: Tensor<U1, f64> = Tensor::Dense(DenseTensor::new(
            &[2, 3], |_| rng.gen_range(-1.0..1.0)));
        let b: Tensor<U1, f64> = Tensor::Dense(DenseTensor::new(
            &[3, 4], |_| rng.gen_range(-1.0..1.0)));
        let c2 = contract(&a, &[1], &b, &[0], None, 2.0, 0.0).unwrap();
        let c1 = contract(&a, &[1], &b, &[0], None, 1.0, 0.0).unwrap();
        assert!(c2.approx_eq(&c1.scaled(2.0), None));
    }

    #[test]
    fn empty_index_lists_are_outer_product() {
        let a = dense(&[2], vec![1.0, 2.0]);
        let b = dense(&[3], vec![4.0, 5.0, 6.0]);
        let c = tensor_prod(&a, &b).unwrap();
        assert_eq!(c.shape(), vec![2, 3]);
        let cd = c.to_dense();
        assert!(approx(*cd.get(&[1, 2]).unwrap(), 12.0));
        assert!(approx(*cd.get(&[0, 0]).unwrap(), 4.0));
    }

    #[test]
    fn dense_blocked_equivalence() {
        logging();
        let (ab, da) = random_blocked(
            vec![bin(), bin(), bin()], U1(1), &[0], &[1, 2]);
        let (bb, db) = random_blocked(
            vec![bin_inv(), bin_inv(), bin()], U1(0), &[0, 1], &[2]);
        let cd = contract(
            &Tensor::Dense(da), &[1, 2],
            &Tensor::Dense(db), &[0, 1],
            None, 1.0, 0.0,
        ).unwrap();
        let cb = contract(
            &Tensor::Blocked(ab), &[1, 2],
            &Tensor::Blocked(bb), &[0, 1],
            None, 1.0, 0.0,
        ).unwrap();
        assert!(cb.approx_eq(&cd, None));
        // sparsity conservation on the result
        let Tensor::Blocked(cb) = cb else { panic!("expected blocked") };
        assert_eq!(cb.flux(), U1(1));
        for k in 0..cb.num_blocks() {
            let (_, _, (qr, qc)) = cb.block_index(k).unwrap();
            assert_eq!(qr.add(qc), cb.flux());
        }
    }

    #[test]
    fn blocked_fused_accumulate() {
        let (ab, da) = random_blocked(
            vec![bin(), bin(), bin()], U1(1), &[0], &[1, 2]);
        let (bb, db) = random_blocked(
            vec![bin_inv(), bin_inv(), bin()], U1(0), &[0, 1], &[2]);
        // accumulator with the result's labels and flux
        let (zb, zd) = random_blocked(
            vec![bin(), bin()], U1(1), &[0], &[1]);
        let expected = contract(
            &Tensor::Dense(da), &[1, 2],
            &Tensor::Dense(db), &[0, 1],
            Some(&Tensor::Dense(zd)), 2.0, 5.0,
        ).unwrap();
        let got = contract(
            &Tensor::Blocked(ab), &[1, 2],
            &Tensor::Blocked(bb), &[0, 1],
            Some(&Tensor::Blocked(zb)), 2.0, 5.0,
        ).unwrap();
        assert!(got.approx_eq(&expected, None));
    }

    #[test]
    fn self_contraction_consistency() {
        let (ab, da) = random_blocked_c64(
            vec![bin(), bin(), bin()], U1(1), &[0], &[1, 2]);
        let ta = Tensor::Blocked(ab);
        let s = ccontract_self(&ta).unwrap();
        let manual: f64 =
            da.as_array().iter().map(|x| x.norm_sqr()).sum();
        assert!(capprox(s, C64::new(manual, 0.0)));
        let via_dot =
            dot(&ta, &ta, Transform::Conj, Transform::Id).unwrap();
        assert!(capprox(s, via_dot));
        assert!(capprox(s, contractc_self(&ta).unwrap()));
        assert!(capprox(
            ccontractc_self(&ta).unwrap(),
            Elem::conj(contract_self(&ta).unwrap()),
        ));
        assert!(approx(norm(&ta).unwrap(), manual.sqrt()));
        // the zero-index-list contraction through the full engine agrees
        let full = ccontract(
            &ta, &[0, 1, 2], &ta, &[0, 1, 2],
            None, C64::one(), C64::zero(),
        ).unwrap();
        assert_eq!(full.ndim(), 0);
        assert!(capprox(full.as_scalar().unwrap(), s));
    }

    #[test]
    fn conjugate_symmetry() {
        let mut rng = rand::thread_rng();
        let mut gen = |_: &[usize]| C64::new(
            rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0));
        let a: Tensor<U1, C64> =
            Tensor::Dense(DenseTensor::new(&[2, 3], &mut gen));
        let b: Tensor<U1, C64> =
            Tensor::Dense(DenseTensor::new(&[3, 4], &mut gen));
        let one = C64::one();
        let zero = C64::zero();
        // ccontract(A, B) is the index-transposed contractc(B, A)
        let cc =
            ccontract(&a, &[1], &b, &[0], None, one, zero).unwrap()
            .to_dense();
        let dc =
            contractc(&b, &[0], &a, &[1], None, one, zero).unwrap()
            .to_dense();
        for i in 0..2 {
            for l in 0..4 {
                assert!(capprox(
                    *cc.get(&[i, l]).unwrap(),
                    *dc.get(&[l, i]).unwrap(),
                ));
            }
        }
        // conjugating both operands conjugates the plain contraction
        let ccc =
            ccontractc(&a, &[1], &b, &[0], None, one, zero).unwrap()
            .to_dense();
        let pc =
            contract(&b, &[0], &a, &[1], None, one, zero).unwrap()
            .to_dense();
        for i in 0..2 {
            for l in 0..4 {
                assert!(capprox(
                    *ccc.get(&[i, l]).unwrap(),
                    Elem::conj(*pc.get(&[l, i]).unwrap()),
                ));
            }
        }
    }

    #[test]
    fn mixed_representations_agree() {
        let (_, da) = random_blocked(
            vec![bin(), bin(), bin()], U1(1), &[0], &[1, 2]);
        let (bb, db) = random_blocked(
            vec![bin_inv(), bin_inv(), bin()], U1(0), &[0, 1], &[2]);
        let dd = contract(
            &Tensor::Dense(da.clone()), &[1, 2],
            &Tensor::Dense(db), &[0, 1],
            None, 1.0, 0.0,
        ).unwrap();
        let mixed = contract(
            &Tensor::Dense(da), &[1, 2],
            &Tensor::Blocked(bb), &[0, 1],
            None, 1.0, 0.0,
        ).unwrap();
        assert!(mixed.approx_eq(&dd, None));
    }

    #[test]
    fn pooled_matches_sequential() {
        logging();
        let pool: ContractorPool<f64> = ContractorPool::new(3);
        let (ab, _) = random_blocked(
            vec![bin(), bin(), bin()], U1(1), &[0], &[1, 2]);
        let (bb, _) = random_blocked(
            vec![bin_inv(), bin_inv(), bin()], U1(0), &[0, 1], &[2]);
        let ta = Tensor::Blocked(ab);
        let tb = Tensor::Blocked(bb);
        let seq =
            contract(&ta, &[1, 2], &tb, &[0, 1], None, 1.5, 0.0)
            .unwrap();
        let par = contract_pooled(
            &ta, &[1, 2], false,
            &tb, &[0, 1], false,
            None, 1.5, 0.0, &pool,
        ).unwrap();
        assert!(par.approx_eq(&seq, None));
    }

    #[test]
    fn promotion_real_complex() {
        let a: Tensor<U1, f64> =
            dense(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b: Tensor<U1, C64> = dense(
            &[2, 2],
            vec![
                C64::new(0.0, 1.0), C64::new(0.0, 0.0),
                C64::new(0.0, 0.0), C64::new(0.0, 1.0),
            ],
        );
        let c = contract_promote(&a, &[1], &b, &[0]).unwrap();
        let cd = c.to_dense();
        assert!(capprox(*cd.get(&[0, 0]).unwrap(), C64::new(0.0, 1.0)));
        assert!(capprox(*cd.get(&[1, 1]).unwrap(), C64::new(0.0, 4.0)));
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let a = dense(&[2, 3], vec![0.0; 6]);
        let b = dense(&[4, 2], vec![0.0; 8]);
        let res = contract(&a, &[1], &b, &[0], None, 1.0, 0.0);
        assert!(matches!(
            res,
            Err(ShapeMismatch(1, 3, 0, 4)),
        ));
        let res = contract(&a, &[0, 1], &b, &[0], None, 1.0, 0.0);
        assert!(matches!(res, Err(ArityMismatch(2, 1))));
    }

    #[test]
    fn checkcontract_validates_quantum_numbers() {
        let (ab, _) = random_blocked(
            vec![bin(), bin()], U1(1), &[0], &[1]);
        let (bb, _) = random_blocked(
            vec![bin_inv(), bin()], U1(0), &[0], &[1]);
        let ta = Tensor::Blocked(ab);
        let tb = Tensor::Blocked(bb);
        // A axis 1 labels are the inverse of B axis 0 labels
        assert!(checkcontract(&ta, &[1], &tb, &[0]).is_ok());
        // A axis 1 against B axis 1 is not mutually inverse
        assert!(matches!(
            checkcontract(&ta, &[1], &tb, &[1]),
            Err(QnumMismatch(1, 1)),
        ));
    }

    #[test]
    fn dot3_dense_matches_manual() {
        let a = dense(&[2], vec![1.0, 2.0]);
        let h = dense(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = dense(&[3], vec![1.0, 0.0, -1.0]);
        let got = dot3(
            &a, &h, &b,
            Transform::Id, Transform::Id, Transform::Id,
        ).unwrap();
        // manual: a.(H b), H b = [1-3, 4-6] = [-2, -2]
        assert!(approx(got, 1.0 * -2.0 + 2.0 * -2.0));
    }

    #[test]
    fn dot3_blocked_matches_dense() {
        let (ab, da) = random_blocked(
            vec![bin(), bin()], U1(1), &[0], &[1]);
        let (hb, dh) = random_blocked(
            vec![bin_inv(), bin_inv(), bin_inv(), bin_inv()],
            U1(-2), &[0, 1], &[2, 3]);
        let (bb, db) = random_blocked(
            vec![bin(), bin()], U1(1), &[0], &[1]);
        let got = dot3(
            &Tensor::Blocked(ab),
            &Tensor::Blocked(hb),
            &Tensor::Blocked(bb),
            Transform::Id, Transform::Id, Transform::Id,
        ).unwrap();
        let expected = dot3(
            &Tensor::<U1, f64>::Dense(da),
            &Tensor::<U1, f64>::Dense(dh),
            &Tensor::<U1, f64>::Dense(db),
            Transform::Id, Transform::Id, Transform::Id,
        ).unwrap();
        assert!(approx(got, expected));
    }

    #[test]
    fn dot3_block_size_inconsistency_is_fatal() {
        let (ab, _) = random_blocked(vec![bin()], U1(1), &[0], &[]);
        let (bb, _) = random_blocked(vec![bin()], U1(1), &[0], &[]);
        // middle operand whose -1 sectors are two positions wide, against
        // single-position operand sectors
        let two_inv = vec![U1(-1), U1(-1)];
        let (hb, _) = random_blocked(
            vec![two_inv.clone(), two_inv], U1(-2), &[0], &[1]);
        let res = dot3(
            &Tensor::Blocked(ab),
            &Tensor::Blocked(hb),
            &Tensor::Blocked(bb),
            Transform::Id, Transform::Id, Transform::Id,
        );
        assert!(matches!(
            res,
            Err(BlockSizeInconsistency(_, 2, 2, 1, 1)),
        ));
    }

    #[test]
    fn trace_blocked_matches_dense() {
        let (tb, td) = random_blocked(
            vec![bin(), bin(), bin_inv(), bin_inv()],
            U1(0), &[0, 1], &[2, 3]);
        let pairs = [(0, 2), (1, 3)];
        let got =
            trace(&Tensor::Blocked(tb.clone()), Some(&pairs)).unwrap();
        let expected =
            trace(&Tensor::<U1, f64>::Dense(td.clone()), Some(&pairs)).unwrap();
        assert_eq!(got.ndim(), 0);
        assert!(approx(
            got.as_scalar().unwrap(),
            expected.as_scalar().unwrap(),
        ));
        // partial trace keeps the untraced indices and the flux
        let got =
            trace(&Tensor::Blocked(tb), Some(&[(0, 2)])).unwrap();
        let expected =
            trace(&Tensor::Dense(td), Some(&[(0, 2)])).unwrap();
        assert_eq!(got.shape(), vec![2, 2]);
        assert!(got.approx_eq(&expected, None));
        let Tensor::Blocked(got) = got else { panic!("expected blocked") };
        assert_eq!(got.flux(), U1(0));
    }

    #[test]
    fn blocked_outer_product_adds_fluxes() {
        let (ab, da) = random_blocked(vec![bin(), bin()], U1(1), &[0], &[1]);
        let (bb, db) = random_blocked(vec![bin()], U1(1), &[0], &[]);
        let got =
            tensor_prod(&Tensor::Blocked(ab), &Tensor::Blocked(bb))
            .unwrap();
        let expected =
            tensor_prod(&Tensor::Dense(da), &Tensor::Dense(db))
            .unwrap();
        assert!(got.approx_eq(&expected, None));
        let Tensor::Blocked(got) = got else { panic!("expected blocked") };
        assert_eq!(got.flux(), U1(2));
        assert_eq!(got.shape(), vec![2, 2, 2]);
    }
}
