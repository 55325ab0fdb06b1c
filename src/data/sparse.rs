//! Compressed sparse row (CSR) blocks
//!
//! Just enough sparse algebra for cross-validation plumbing: row/column
//! selection, elementwise scaling and horizontal stacking. Feature unions
//! keep sparse branch outputs sparse instead of densifying them.

use crate::{Error, Result};
use ndarray::Array2;

/// Row-major compressed sparse matrix of `f64`.
///
/// Invariants (checked by [`CsrMatrix::new`]):
/// - `indptr.len() == n_rows + 1`, non-decreasing, `indptr[n_rows] == nnz`
/// - every column index is `< n_cols`
/// - column indices are strictly increasing within a row
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    n_rows: usize,
    n_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    data: Vec<f64>,
}

impl CsrMatrix {
    /// Build from raw CSR arrays.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if the arrays violate the CSR invariants.
    pub fn new(
        shape: (usize, usize),
        indptr: Vec<usize>,
        indices: Vec<usize>,
        data: Vec<f64>,
    ) -> Result<Self> {
        let (n_rows, n_cols) = shape;
        if indptr.len() != n_rows + 1 {
            return Err(Error::InvalidInput(format!(
                "CSR indptr has length {} (expected {})",
                indptr.len(),
                n_rows + 1
            )));
        }
        if indices.len() != data.len() || indptr[n_rows] != data.len() || indptr[0] != 0 {
            return Err(Error::InvalidInput(
                "CSR indptr/indices/data lengths disagree".to_string(),
            ));
        }
        for row in 0..n_rows {
            let (start, end) = (indptr[row], indptr[row + 1]);
            if start > end || end > data.len() {
                return Err(Error::InvalidInput(format!(
                    "CSR indptr is not monotone at row {row}"
                )));
            }
            let cols = &indices[start..end];
            if cols.iter().any(|&c| c >= n_cols) {
                return Err(Error::InvalidInput(format!(
                    "CSR column index out of bounds in row {row} (n_cols = {n_cols})"
                )));
            }
            if cols.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::InvalidInput(format!(
                    "CSR column indices not strictly increasing in row {row}"
                )));
            }
        }
        Ok(Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            data,
        })
    }

    /// An all-zero matrix with no stored entries.
    #[must_use]
    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            n_rows: shape.0,
            n_cols: shape.1,
            indptr: vec![0; shape.0 + 1],
            indices: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Convert a dense block, dropping exact zeros.
    #[must_use]
    pub fn from_dense(dense: &Array2<f64>) -> Self {
        let (n_rows, n_cols) = dense.dim();
        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for row in dense.rows() {
            for (col, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    indices.push(col);
                    data.push(v);
                }
            }
            indptr.push(data.len());
        }
        Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            data,
        }
    }

    /// Materialize as a dense block.
    #[must_use]
    pub fn to_dense(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.n_rows, self.n_cols));
        for row in 0..self.n_rows {
            for (col, v) in self.row_entries(row) {
                out[[row, col]] = v;
            }
        }
        out
    }

    /// `(rows, cols)`
    #[must_use]
    pub const fn shape(&self) -> (usize, usize) {
        (self.n_rows, self.n_cols)
    }

    /// Number of stored entries.
    #[must_use]
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Stored `(column, value)` pairs of one row.
    ///
    /// Callers guarantee `row < n_rows`.
    pub(crate) fn row_entries(&self, row: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (start, end) = (self.indptr[row], self.indptr[row + 1]);
        self.indices[start..end]
            .iter()
            .copied()
            .zip(self.data[start..end].iter().copied())
    }

    /// Gather rows in the given order (repeats allowed).
    ///
    /// Callers guarantee every row index is in range.
    #[must_use]
    pub(crate) fn select_rows(&self, rows: &[usize]) -> Self {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for &row in rows {
            let (start, end) = (self.indptr[row], self.indptr[row + 1]);
            indices.extend_from_slice(&self.indices[start..end]);
            data.extend_from_slice(&self.data[start..end]);
            indptr.push(data.len());
        }
        Self {
            n_rows: rows.len(),
            n_cols: self.n_cols,
            indptr,
            indices,
            data,
        }
    }

    /// Gather a `rows x cols` sub-matrix (repeats allowed on both axes).
    ///
    /// Callers guarantee every index is in range.
    #[must_use]
    pub(crate) fn select(&self, rows: &[usize], cols: &[usize]) -> Self {
        // old column -> new column positions
        let mut targets: Vec<Vec<usize>> = vec![Vec::new(); self.n_cols];
        for (new_col, &old_col) in cols.iter().enumerate() {
            targets[old_col].push(new_col);
        }

        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        let mut row_buf: Vec<(usize, f64)> = Vec::new();
        for &row in rows {
            row_buf.clear();
            for (old_col, v) in self.row_entries(row) {
                row_buf.extend(targets[old_col].iter().map(|&c| (c, v)));
            }
            row_buf.sort_unstable_by_key(|&(c, _)| c);
            for &(c, v) in &row_buf {
                indices.push(c);
                data.push(v);
            }
            indptr.push(data.len());
        }
        Self {
            n_rows: rows.len(),
            n_cols: cols.len(),
            indptr,
            indices,
            data,
        }
    }

    /// Multiply every stored value by `weight`.
    #[must_use]
    pub fn scaled(&self, weight: f64) -> Self {
        let mut out = self.clone();
        for v in &mut out.data {
            *v *= weight;
        }
        out
    }

    /// Concatenate along the column axis.
    ///
    /// # Errors
    /// Returns [`Error::InconsistentLength`] if the blocks differ in row count.
    pub fn hstack(blocks: &[Self]) -> Result<Self> {
        let Some(first) = blocks.first() else {
            return Ok(Self::zeros((0, 0)));
        };
        let n_rows = first.n_rows;
        if blocks.iter().any(|b| b.n_rows != n_rows) {
            return Err(Error::inconsistent_length(
                "hstack of sparse blocks",
                blocks.iter().map(|b| b.n_rows).collect(),
            ));
        }

        let n_cols = blocks.iter().map(|b| b.n_cols).sum();
        let nnz = blocks.iter().map(Self::nnz).sum();
        let mut indptr = Vec::with_capacity(n_rows + 1);
        let mut indices = Vec::with_capacity(nnz);
        let mut data = Vec::with_capacity(nnz);
        indptr.push(0);
        for row in 0..n_rows {
            let mut offset = 0;
            for block in blocks {
                for (col, v) in block.row_entries(row) {
                    indices.push(col + offset);
                    data.push(v);
                }
                offset += block.n_cols;
            }
            indptr.push(data.len());
        }
        Ok(Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> CsrMatrix {
        // [[1, 0, 2],
        //  [0, 0, 3],
        //  [4, 5, 0]]
        CsrMatrix::new(
            (3, 3),
            vec![0, 2, 3, 5],
            vec![0, 2, 2, 0, 1],
            vec![1.0, 2.0, 3.0, 4.0, 5.0],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_bad_indptr() {
        let err = CsrMatrix::new((2, 2), vec![0, 1], vec![0], vec![1.0]).unwrap_err();
        assert!(err.to_string().contains("indptr"));
    }

    #[test]
    fn test_new_rejects_out_of_bounds_column() {
        assert!(CsrMatrix::new((1, 2), vec![0, 1], vec![5], vec![1.0]).is_err());
    }

    #[test]
    fn test_dense_round_trip() {
        let dense = array![[1.0, 0.0, 2.0], [0.0, 0.0, 3.0], [4.0, 5.0, 0.0]];
        let csr = CsrMatrix::from_dense(&dense);
        assert_eq!(csr, sample());
        assert_eq!(csr.to_dense(), dense);
    }

    #[test]
    fn test_row_entries() {
        let m = sample();
        assert_eq!(m.row_entries(0).collect::<Vec<_>>(), vec![(0, 1.0), (2, 2.0)]);
        assert_eq!(m.row_entries(1).collect::<Vec<_>>(), vec![(2, 3.0)]);
    }

    #[test]
    fn test_select_rows_preserves_order() {
        let picked = sample().select_rows(&[2, 0]);
        assert_eq!(picked.to_dense(), array![[4.0, 5.0, 0.0], [1.0, 0.0, 2.0]]);
    }

    #[test]
    fn test_select_submatrix() {
        let picked = sample().select(&[0, 2], &[2, 0]);
        assert_eq!(picked.to_dense(), array![[2.0, 1.0], [0.0, 4.0]]);
    }

    #[test]
    fn test_scaled() {
        let scaled = sample().scaled(2.0);
        assert_eq!(scaled.to_dense()[[2, 1]], 10.0);
        assert_eq!(scaled.nnz(), 5);
    }

    #[test]
    fn test_hstack() {
        let left = sample();
        let right = CsrMatrix::from_dense(&array![[7.0], [0.0], [8.0]]);
        let stacked = CsrMatrix::hstack(&[left, right]).unwrap();
        assert_eq!(stacked.shape(), (3, 4));
        assert_eq!(stacked.to_dense()[[0, 3]], 7.0);
        assert_eq!(stacked.to_dense()[[2, 3]], 8.0);
    }

    #[test]
    fn test_hstack_row_mismatch() {
        let err = CsrMatrix::hstack(&[CsrMatrix::zeros((2, 1)), CsrMatrix::zeros((3, 1))]);
        assert!(err.is_err());
    }
}
