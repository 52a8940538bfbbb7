//! Symmetry-block-sparse tensors and the block matcher.
//!
//! A [`BlockTensor`] stores only the dense sub-blocks of a tensor that are
//! allowed by a conservation law. Every index carries an ordered list of
//! quantum-number labels, one per index value (the *QnumMat*); the indices
//! are split into an active row group and column group (the *currblock*),
//! and the fused positions of each group are bucketed into *sectors* by
//! their total quantum number. A block is the dense matrix covering one
//! (row-sector, column-sector) pair, and is legal -- and stored -- exactly
//! when
//!
//! ```text
//! rowQ + colQ = flux
//! ```
//!
//! where `flux` is the tensor's total quantum number. Everything that
//! violates this is structurally zero and never materialized, which is the
//! entire source of the representation's sparsity.
//!
//! The sector position lists tile each group's fused index space with no
//! overlap, so [`to_dense`][BlockTensor::to_dense] /
//! [`from_dense`][BlockTensor::from_dense] convert losslessly for tensors
//! that actually satisfy the conservation law. Entries of a dense tensor
//! lying outside every legal sector are discarded on conversion.
//!
//! The [`match_blocks`] join at the bottom of this module is the
//! sparsity-exploiting step of the contraction engine: it pairs up blocks of
//! two operands whose quantum numbers are compatible on the contracted
//! groups in time proportional to the number of blocks actually present.

use itertools::Itertools;
use log::trace;
use ndarray as nd;
use rustc_hash::FxHashMap as HashMap;
use thiserror::Error;
use crate::{
    Elem,
    dense::{ decode, encode, DenseError, DenseTensor },
    qnum::{ group_qnum, Qnum },
};

#[derive(Debug, Error)]
pub enum BlockError {
    /// Returned when a label list's length does not equal its index's
    /// dimension.
    #[error("index {0} has dimension {1} but {2} quantum-number labels")]
    LabelLength(usize, usize, usize),

    /// Returned when a group list names an axis outside `0..ndim`.
    #[error("axis {0} out of bounds for a rank-{1} tensor")]
    AxisOutOfBounds(usize, usize),

    /// Returned when an axis appears more than once across the group lists.
    #[error("duplicate axis {0} in index partition")]
    DuplicateAxis(usize),

    /// Returned when the group lists do not cover every axis.
    #[error("index partition covers {0} of {1} axes")]
    IncompletePartition(usize, usize),

    /// Returned by the dense-tensor layer.
    #[error("dense tensor error: {0}")]
    DenseError(#[from] DenseError),
}
use BlockError::*;
pub type BlockResult<T> = Result<T, BlockError>;

/// One charge sector of a fused index group: a total quantum number together
/// with the ascending list of fused positions that carry it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sector<Q> {
    /// Total quantum number of the sector.
    pub q: Q,
    /// Fused positions covered by the sector, ascending.
    pub elems: Vec<usize>,
}

impl<Q> Sector<Q>
where Q: Qnum
{
    /// Number of fused positions in the sector.
    pub fn len(&self) -> usize { self.elems.len() }

    /// Return `true` if the sector covers no positions.
    pub fn is_empty(&self) -> bool { self.elems.is_empty() }

    pub(crate) fn adjusted(&self, conj: bool) -> Self {
        Self { q: self.q.adjusted(conj), elems: self.elems.clone() }
    }
}

/// One stored block: the dense matrix covering a (row-sector, col-sector)
/// pair, referenced by sector indices.
#[derive(Clone, Debug, PartialEq)]
pub struct Block<A> {
    /// Row-sector index into the owner's row sector list.
    pub row: usize,
    /// Column-sector index into the owner's column sector list.
    pub col: usize,
    /// Dense data, `row sector len` × `col sector len`.
    pub data: nd::Array2<A>,
}

// bucket the fused positions of `group` by total quantum number;
// deterministic: sectors sorted by Q
fn build_sectors<Q>(qnums: &[Vec<Q>], group: &[usize]) -> Vec<Sector<Q>>
where Q: Qnum
{
    let labels: Vec<&[Q]> =
        group.iter().map(|ax| qnums[*ax].as_slice()).collect();
    let dims: Vec<usize> =
        labels.iter().map(|l| l.len()).collect();
    let total: usize = dims.iter().product();
    let mut values: Vec<usize> = vec![0; group.len()];
    let mut buckets: HashMap<Q, Vec<usize>> = HashMap::default();
    for p in 0..total {
        decode(p, &dims, &mut values);
        buckets.entry(group_qnum(&labels, &values)).or_default().push(p);
    }
    buckets.into_iter()
        .map(|(q, elems)| Sector { q, elems })
        .sorted_by(|s0, s1| s0.q.cmp(&s1.q))
        .collect()
}

fn check_partition(ndim: usize, row: &[usize], col: &[usize])
    -> BlockResult<()>
{
    let mut seen: Vec<bool> = vec![false; ndim];
    for ax in row.iter().chain(col.iter()) {
        if *ax >= ndim { return Err(AxisOutOfBounds(*ax, ndim)); }
        if seen[*ax] { return Err(DuplicateAxis(*ax)); }
        seen[*ax] = true;
    }
    let covered = seen.iter().filter(|s| **s).count();
    if covered != ndim { return Err(IncompletePartition(covered, ndim)); }
    Ok(())
}

/// A tensor stored as a collection of conservation-legal dense blocks.
///
/// See the [module docs][self] for the representation. All whole-tensor
/// transforms (`reblocked`, `conj`, `map`, `scaled`) rebuild the block
/// structure consistently and leave `self` untouched; the engine never
/// retains references to operands after returning a result.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockTensor<Q, A> {
    qnums: Vec<Vec<Q>>,
    flux: Q,
    rowidx: Vec<usize>,
    colidx: Vec<usize>,
    row_sectors: Vec<Sector<Q>>,
    col_sectors: Vec<Sector<Q>>,
    blocks: Vec<Block<A>>,
}

impl<Q, A> BlockTensor<Q, A>
where
    Q: Qnum,
    A: Elem,
{
    /// Create a new all-zero block tensor with the given labels, flux, and
    /// row/column index groups. One zero block is allocated per legal
    /// sector pair.
    pub fn zeros(
        qnums: Vec<Vec<Q>>,
        flux: Q,
        row: &[usize],
        col: &[usize],
    ) -> BlockResult<Self>
    {
        check_partition(qnums.len(), row, col)?;
        let row_sectors = build_sectors(&qnums, row);
        let col_sectors = build_sectors(&qnums, col);
        let mut blocks: Vec<Block<A>> = Vec::new();
        for (ri, rs) in row_sectors.iter().enumerate() {
            for (ci, cs) in col_sectors.iter().enumerate() {
                if rs.q.add(cs.q) != flux { continue; }
                blocks.push(Block {
                    row: ri,
                    col: ci,
                    data: nd::Array2::zeros((rs.len(), cs.len())),
                });
            }
        }
        Ok(Self {
            qnums,
            flux,
            rowidx: row.to_vec(),
            colidx: col.to_vec(),
            row_sectors,
            col_sectors,
            blocks,
        })
    }

    /// Encode a quantum-number-tagged dense tensor.
    ///
    /// Fails if a label list's length disagrees with the corresponding
    /// index dimension or the groups are not a partition of the indices.
    /// Entries of `dense` lying outside every conservation-legal sector are
    /// discarded.
    pub fn from_dense(
        dense: &DenseTensor<A>,
        qnums: Vec<Vec<Q>>,
        flux: Q,
        row: &[usize],
        col: &[usize],
    ) -> BlockResult<Self>
    {
        if qnums.len() != dense.ndim() {
            return Err(IncompletePartition(qnums.len(), dense.ndim()));
        }
        for (ax, labels) in qnums.iter().enumerate() {
            if labels.len() != dense.shape()[ax] {
                return Err(
                    LabelLength(ax, dense.shape()[ax], labels.len()));
            }
        }
        let mut new = Self::zeros(qnums, flux, row, col)?;
        let mat = dense.to_matrix(row, col, false)?;
        for block in new.blocks.iter_mut() {
            let rows = &new.row_sectors[block.row].elems;
            let cols = &new.col_sectors[block.col].elems;
            block.data = nd::Array2::from_shape_fn(
                (rows.len(), cols.len()),
                |(i, j)| mat[[rows[i], cols[j]]],
            );
        }
        Ok(new)
    }

    /// Expand to an ordinary dense tensor with indices in their original
    /// order.
    pub fn to_dense(&self) -> DenseTensor<A> {
        let rowdim: usize =
            self.rowidx.iter().map(|ax| self.qnums[*ax].len()).product();
        let coldim: usize =
            self.colidx.iter().map(|ax| self.qnums[*ax].len()).product();
        let mut mat: nd::Array2<A> = nd::Array2::zeros((rowdim, coldim));
        for block in self.blocks.iter() {
            let rows = &self.row_sectors[block.row].elems;
            let cols = &self.col_sectors[block.col].elems;
            for (i, r) in rows.iter().enumerate() {
                for (j, c) in cols.iter().enumerate() {
                    mat[[*r, *c]] = block.data[[i, j]];
                }
            }
        }
        let row_dims: Vec<usize> =
            self.rowidx.iter().map(|ax| self.qnums[*ax].len()).collect();
        let col_dims: Vec<usize> =
            self.colidx.iter().map(|ax| self.qnums[*ax].len()).collect();
        let grouped = DenseTensor::from_matrix(mat, &row_dims, &col_dims);
        // grouped's k-th index is original index (rowidx ++ colidx)[k];
        // permute back to original order
        let order: Vec<usize> = self.inverse_order();
        grouped.permuted(&order)
            .unwrap() // inverse_order is a permutation by construction
    }

    // position of each original index within rowidx ++ colidx
    fn inverse_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = vec![0; self.ndim()];
        for (k, ax) in
            self.rowidx.iter().chain(self.colidx.iter()).enumerate()
        {
            order[*ax] = k;
        }
        order
    }

    /// Return the number of indices.
    pub fn ndim(&self) -> usize { self.qnums.len() }

    /// Return the dimensions of each index, in original index order.
    pub fn shape(&self) -> Vec<usize> {
        self.qnums.iter().map(|labels| labels.len()).collect()
    }

    /// Return the per-index quantum-number label lists.
    pub fn qnums(&self) -> &[Vec<Q>] { &self.qnums }

    /// Return the tensor's total quantum number.
    pub fn flux(&self) -> Q { self.flux }

    /// Return the active row/column index groups.
    pub fn currblock(&self) -> (&[usize], &[usize]) {
        (&self.rowidx, &self.colidx)
    }

    /// Return the row sectors of the active blocking.
    pub fn row_sectors(&self) -> &[Sector<Q>] { &self.row_sectors }

    /// Return the column sectors of the active blocking.
    pub fn col_sectors(&self) -> &[Sector<Q>] { &self.col_sectors }

    /// Return the stored blocks.
    pub fn blocks(&self) -> &[Block<A>] { &self.blocks }

    // mutable access for result assembly; block shapes must not change
    pub(crate) fn blocks_mut(&mut self) -> &mut [Block<A>] {
        &mut self.blocks
    }

    /// Return the number of stored blocks.
    pub fn num_blocks(&self) -> usize { self.blocks.len() }

    /// Return the row positions, column positions, and quantum-number pair
    /// of the `b`-th stored block.
    pub fn block_index(&self, b: usize)
        -> Option<(&[usize], &[usize], (Q, Q))>
    {
        self.blocks.get(b)
            .map(|block| {
                let rs = &self.row_sectors[block.row];
                let cs = &self.col_sectors[block.col];
                (rs.elems.as_slice(), cs.elems.as_slice(), (rs.q, cs.q))
            })
    }

    /// Find the stored block with the given quantum-number pair.
    pub fn find_block(&self, qrow: Q, qcol: Q) -> Option<&Block<A>> {
        self.blocks.iter()
            .find(|block| {
                self.row_sectors[block.row].q == qrow
                    && self.col_sectors[block.col].q == qcol
            })
    }

    /// Apply a mapping function to every stored element, preserving the
    /// block structure.
    pub fn map<F, B>(&self, mut f: F) -> BlockTensor<Q, B>
    where
        F: FnMut(&A) -> B,
        B: Elem,
    {
        BlockTensor {
            qnums: self.qnums.clone(),
            flux: self.flux,
            rowidx: self.rowidx.clone(),
            colidx: self.colidx.clone(),
            row_sectors: self.row_sectors.clone(),
            col_sectors: self.col_sectors.clone(),
            blocks:
                self.blocks.iter()
                .map(|block| Block {
                    row: block.row,
                    col: block.col,
                    data: block.data.map(&mut f),
                })
                .collect(),
        }
    }

    /// Return a new tensor scaled by `alpha`.
    pub fn scaled(&self, alpha: A) -> Self {
        self.map(|a| *a * alpha)
    }

    /// Return the elementwise complex conjugate of `self`.
    ///
    /// Conjugation reverses every index arrow: all labels, sector totals,
    /// and the flux are replaced by their group inverses alongside the
    /// elementwise conjugation, so the block legality invariant is
    /// preserved.
    pub fn conj(&self) -> Self {
        Self {
            qnums:
                self.qnums.iter()
                .map(|labels| {
                    labels.iter().map(|q| q.inverse()).collect()
                })
                .collect(),
            flux: self.flux.inverse(),
            rowidx: self.rowidx.clone(),
            colidx: self.colidx.clone(),
            row_sectors:
                self.row_sectors.iter()
                .map(|s| s.adjusted(true))
                .collect(),
            col_sectors:
                self.col_sectors.iter()
                .map(|s| s.adjusted(true))
                .collect(),
            blocks:
                self.blocks.iter()
                .map(|block| Block {
                    row: block.row,
                    col: block.col,
                    data: block.data.mapv(Elem::conj),
                })
                .collect(),
        }
    }

    /// Re-partition the indices into new row/column groups, rebuilding all
    /// blocks without expanding to a dense tensor.
    ///
    /// Runs in time proportional to the number of stored elements (plus
    /// sector construction for the new groups).
    pub fn reblocked(&self, row: &[usize], col: &[usize])
        -> BlockResult<Self>
    {
        if row == self.rowidx.as_slice() && col == self.colidx.as_slice() {
            return Ok(self.clone());
        }
        check_partition(self.ndim(), row, col)?;
        let row_sectors = build_sectors(&self.qnums, row);
        let col_sectors = build_sectors(&self.qnums, col);
        // fused position -> (sector, offset) lookups for the new groups
        let row_lookup = sector_lookup(&row_sectors);
        let col_lookup = sector_lookup(&col_sectors);
        let mut blocks: Vec<Block<A>> = Vec::new();
        for (ri, rs) in row_sectors.iter().enumerate() {
            for (ci, cs) in col_sectors.iter().enumerate() {
                if rs.q.add(cs.q) != self.flux { continue; }
                blocks.push(Block {
                    row: ri,
                    col: ci,
                    data: nd::Array2::zeros((rs.len(), cs.len())),
                });
            }
        }
        let mut new = Self {
            qnums: self.qnums.clone(),
            flux: self.flux,
            rowidx: row.to_vec(),
            colidx: col.to_vec(),
            row_sectors,
            col_sectors,
            blocks,
        };
        let old_row_dims: Vec<usize> =
            self.rowidx.iter().map(|ax| self.qnums[*ax].len()).collect();
        let old_col_dims: Vec<usize> =
            self.colidx.iter().map(|ax| self.qnums[*ax].len()).collect();
        let new_row_dims: Vec<usize> =
            row.iter().map(|ax| self.qnums[*ax].len()).collect();
        let new_col_dims: Vec<usize> =
            col.iter().map(|ax| self.qnums[*ax].len()).collect();
        let mut rvals: Vec<usize> = vec![0; self.rowidx.len()];
        let mut cvals: Vec<usize> = vec![0; self.colidx.len()];
        let mut values: Vec<usize> = vec![0; self.ndim()];
        let mut rvals_new: Vec<usize> = vec![0; row.len()];
        let mut cvals_new: Vec<usize> = vec![0; col.len()];
        // index into new.blocks by sector pair
        let slot: HashMap<(usize, usize), usize> =
            new.blocks.iter().enumerate()
            .map(|(k, block)| ((block.row, block.col), k))
            .collect();
        for block in self.blocks.iter() {
            let rows = &self.row_sectors[block.row].elems;
            let cols = &self.col_sectors[block.col].elems;
            for (i, r) in rows.iter().enumerate() {
                decode(*r, &old_row_dims, &mut rvals);
                for (ax, v) in self.rowidx.iter().zip(rvals.iter()) {
                    values[*ax] = *v;
                }
                for (j, c) in cols.iter().enumerate() {
                    decode(*c, &old_col_dims, &mut cvals);
                    for (ax, v) in self.colidx.iter().zip(cvals.iter()) {
                        values[*ax] = *v;
                    }
                    for (k, ax) in row.iter().enumerate() {
                        rvals_new[k] = values[*ax];
                    }
                    for (k, ax) in col.iter().enumerate() {
                        cvals_new[k] = values[*ax];
                    }
                    let rp = encode(&rvals_new, &new_row_dims);
                    let cp = encode(&cvals_new, &new_col_dims);
                    // every stored element lies in a legal sector pair, so
                    // the lookups cannot miss
                    let (nri, roff) = row_lookup[&rp];
                    let (nci, coff) = col_lookup[&cp];
                    let target = slot[&(nri, nci)];
                    new.blocks[target].data[[roff, coff]] =
                        block.data[[i, j]];
                }
            }
        }
        Ok(new)
    }

    /// Return `true` if `self` and `other` agree in shape, labels, flux,
    /// and numeric content to within `thresh` (default `1e-12`), comparing
    /// by content rather than block order.
    pub fn approx_eq(&self, other: &Self, thresh: Option<f64>) -> bool {
        self.qnums == other.qnums
            && self.flux == other.flux
            && self.to_dense().approx_eq(&other.to_dense(), thresh)
    }

    // internal constructor for contraction results; callers guarantee the
    // legality and tiling invariants
    pub(crate) fn from_parts(
        qnums: Vec<Vec<Q>>,
        flux: Q,
        rowidx: Vec<usize>,
        colidx: Vec<usize>,
        row_sectors: Vec<Sector<Q>>,
        col_sectors: Vec<Sector<Q>>,
        blocks: Vec<Block<A>>,
    ) -> Self
    {
        debug_assert!(
            blocks.iter().all(|block| {
                row_sectors[block.row].q
                    .add(col_sectors[block.col].q) == flux
            })
        );
        Self {
            qnums, flux, rowidx, colidx, row_sectors, col_sectors, blocks,
        }
    }
}

fn sector_lookup<Q>(sectors: &[Sector<Q>])
    -> HashMap<usize, (usize, usize)>
where Q: Qnum
{
    sectors.iter().enumerate()
        .flat_map(|(s, sector)| {
            sector.elems.iter().enumerate()
                .map(move |(off, p)| (*p, (s, off)))
        })
        .collect()
}

/// Pair up the blocks of two operands whose quantum numbers are compatible
/// for contraction: `a`'s column group is contracted against `b`'s row
/// group, so a pair matches when the conjugation-adjusted column total of
/// the `a` block is the group inverse of the conjugation-adjusted row total
/// of the `b` block.
///
/// Implemented as a hash join keyed on the matched quantum number --
/// `O(blocks(a) + blocks(b))` -- rather than the naive
/// `O(blocks(a) × blocks(b))` scan over all sector combinations. Blocks
/// with no partner on the other side are dropped here; that is the
/// sparsity-exploiting step of the engine.
pub fn match_blocks<Q, A, B>(
    a: &BlockTensor<Q, A>,
    conj_a: bool,
    b: &BlockTensor<Q, B>,
    conj_b: bool,
) -> Vec<(usize, usize)>
where
    Q: Qnum,
    A: Elem,
    B: Elem,
{
    let mut by_row: HashMap<Q, Vec<usize>> = HashMap::default();
    for (kb, block) in b.blocks().iter().enumerate() {
        let qrow = b.row_sectors()[block.row].q.adjusted(conj_b);
        by_row.entry(qrow).or_default().push(kb);
    }
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for (ka, block) in a.blocks().iter().enumerate() {
        let qcol = a.col_sectors()[block.col].q.adjusted(conj_a);
        if let Some(partners) = by_row.get(&qcol.inverse()) {
            pairs.extend(partners.iter().map(|kb| (ka, *kb)));
        }
    }
    trace!(
        "block match: {} pairs from {} x {} blocks",
        pairs.len(), a.num_blocks(), b.num_blocks(),
    );
    pairs
}
