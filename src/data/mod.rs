//! Datasets, folds and the numeric containers they slice
//!
//! A [`Dataset`] is a feature block `X`, optional labels `y` and optional
//! auxiliary per-sample arrays (sample weights, groups, ...). Every
//! container is a [`Data`] value. Row selection never panics: indices are
//! validated against the container before gathering.

mod sparse;

pub use sparse::CsrMatrix;

use crate::{Error, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A numeric container that can be sliced along the sample axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// Dense 2-D block (samples x features, or a square kernel)
    Dense(Array2<f64>),
    /// Sparse 2-D block
    Sparse(CsrMatrix),
    /// 1-D per-sample array (labels, weights, groups)
    Vector(Array1<f64>),
    /// A value broadcast to every sample; not indexable
    Scalar(f64),
}

impl Data {
    /// Sample count, `None` for scalars.
    #[must_use]
    pub fn n_rows(&self) -> Option<usize> {
        match self {
            Self::Dense(a) => Some(a.nrows()),
            Self::Sparse(m) => Some(m.shape().0),
            Self::Vector(v) => Some(v.len()),
            Self::Scalar(_) => None,
        }
    }

    /// 2-D shape, `None` for 1-D arrays and scalars.
    #[must_use]
    pub fn shape(&self) -> Option<(usize, usize)> {
        match self {
            Self::Dense(a) => Some(a.dim()),
            Self::Sparse(m) => Some(m.shape()),
            Self::Vector(_) | Self::Scalar(_) => None,
        }
    }

    /// Whether the container can be row-selected.
    #[must_use]
    pub const fn is_indexable(&self) -> bool {
        !matches!(self, Self::Scalar(_))
    }

    /// Whether the container uses sparse storage.
    #[must_use]
    pub const fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    /// Borrow the dense block, if dense 2-D.
    #[must_use]
    pub const fn as_dense(&self) -> Option<&Array2<f64>> {
        match self {
            Self::Dense(a) => Some(a),
            _ => None,
        }
    }

    /// Borrow the 1-D array, if 1-D.
    #[must_use]
    pub const fn as_vector(&self) -> Option<&Array1<f64>> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    /// Gather rows in the order given; scalars are returned unchanged.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if any row index is out of range.
    pub fn select_rows(&self, rows: &[usize]) -> Result<Self> {
        if let Some(n) = self.n_rows() {
            check_bounds(rows, n, "row")?;
        }
        Ok(match self {
            Self::Dense(a) => Self::Dense(a.select(Axis(0), rows)),
            Self::Sparse(m) => Self::Sparse(m.select_rows(rows)),
            Self::Vector(v) => Self::Vector(v.select(Axis(0), rows)),
            Self::Scalar(s) => Self::Scalar(*s),
        })
    }

    /// Gather a `rows x cols` sub-block of a 2-D container.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] for 1-D/scalar containers or
    /// out-of-range indices.
    pub fn select_block(&self, rows: &[usize], cols: &[usize]) -> Result<Self> {
        let (n_rows, n_cols) = self.shape().ok_or_else(|| {
            Error::InvalidInput(
                "2-D block selection on a container without a 2-D shape".to_string(),
            )
        })?;
        check_bounds(rows, n_rows, "row")?;
        check_bounds(cols, n_cols, "column")?;
        match self {
            Self::Dense(a) => Ok(Self::Dense(a.select(Axis(0), rows).select(Axis(1), cols))),
            Self::Sparse(m) => Ok(Self::Sparse(m.select(rows, cols))),
            Self::Vector(_) | Self::Scalar(_) => Err(Error::InvalidInput(
                "2-D block selection on 1-D data".to_string(),
            )),
        }
    }

    /// Elementwise multiplication by `weight`, keeping the storage format.
    #[must_use]
    pub fn scaled(&self, weight: f64) -> Self {
        match self {
            Self::Dense(a) => Self::Dense(a * weight),
            Self::Sparse(m) => Self::Sparse(m.scaled(weight)),
            Self::Vector(v) => Self::Vector(v * weight),
            Self::Scalar(s) => Self::Scalar(s * weight),
        }
    }
}

impl From<Array2<f64>> for Data {
    fn from(a: Array2<f64>) -> Self {
        Self::Dense(a)
    }
}

impl From<Array1<f64>> for Data {
    fn from(v: Array1<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<CsrMatrix> for Data {
    fn from(m: CsrMatrix) -> Self {
        Self::Sparse(m)
    }
}

fn check_bounds(indices: &[usize], len: usize, axis: &str) -> Result<()> {
    match indices.iter().find(|&&i| i >= len) {
        Some(bad) => Err(Error::InvalidInput(format!(
            "{axis} index {bad} out of bounds for length {len}"
        ))),
        None => Ok(()),
    }
}

/// Sample selector of one side of a fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexSet {
    /// Explicit ordered positions
    Positions(Vec<usize>),
    /// Boolean mask of sample length
    Mask(Vec<bool>),
}

impl IndexSet {
    /// Number of selected samples.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Positions(p) => p.len(),
            Self::Mask(m) => m.iter().filter(|&&b| b).count(),
        }
    }

    /// Selected positions in selection order.
    #[must_use]
    pub fn positions(&self) -> Cow<'_, [usize]> {
        match self {
            Self::Positions(p) => Cow::Borrowed(p),
            Self::Mask(m) => Cow::Owned(
                m.iter()
                    .enumerate()
                    .filter_map(|(i, &keep)| keep.then_some(i))
                    .collect(),
            ),
        }
    }

    /// Check that the selector fits a dataset of `n_samples`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] for out-of-range positions or a mask
    /// of the wrong length.
    pub fn validate(&self, n_samples: usize) -> Result<()> {
        match self {
            Self::Positions(p) => check_bounds(p, n_samples, "sample"),
            Self::Mask(m) if m.len() != n_samples => Err(Error::InvalidInput(format!(
                "boolean mask has length {} but dataset has {n_samples} samples",
                m.len()
            ))),
            Self::Mask(_) => Ok(()),
        }
    }
}

impl From<Vec<usize>> for IndexSet {
    fn from(p: Vec<usize>) -> Self {
        Self::Positions(p)
    }
}

impl From<Vec<bool>> for IndexSet {
    fn from(m: Vec<bool>) -> Self {
        Self::Mask(m)
    }
}

/// One train/test pair over the sample axis. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fold {
    train: IndexSet,
    test: IndexSet,
}

impl Fold {
    /// Create a fold from its train and test selectors.
    #[must_use]
    pub fn new(train: impl Into<IndexSet>, test: impl Into<IndexSet>) -> Self {
        Self {
            train: train.into(),
            test: test.into(),
        }
    }

    /// Training selector.
    #[must_use]
    pub const fn train(&self) -> &IndexSet {
        &self.train
    }

    /// Test selector.
    #[must_use]
    pub const fn test(&self) -> &IndexSet {
        &self.test
    }
}

/// Features, optional labels and auxiliary per-sample arrays.
///
/// The fold cache never owns a dataset; it is handed one per extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    x: Data,
    y: Option<Data>,
    aux: Vec<(String, Data)>,
}

impl Dataset {
    /// Unlabelled dataset.
    #[must_use]
    pub fn new(x: impl Into<Data>) -> Self {
        Self {
            x: x.into(),
            y: None,
            aux: Vec::new(),
        }
    }

    /// Attach labels.
    #[must_use]
    pub fn with_labels(mut self, y: impl Into<Data>) -> Self {
        self.y = Some(y.into());
        self
    }

    /// Attach an auxiliary per-sample array (or broadcast scalar).
    #[must_use]
    pub fn with_aux(mut self, key: impl Into<String>, value: impl Into<Data>) -> Self {
        self.aux.push((key.into(), value.into()));
        self
    }

    /// Features.
    #[must_use]
    pub const fn x(&self) -> &Data {
        &self.x
    }

    /// Labels, if any.
    #[must_use]
    pub const fn y(&self) -> Option<&Data> {
        self.y.as_ref()
    }

    /// Auxiliary arrays in insertion order.
    #[must_use]
    pub fn aux(&self) -> &[(String, Data)] {
        &self.aux
    }

    /// Number of samples (rows of `X`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if `X` is a scalar.
    pub fn n_samples(&self) -> Result<usize> {
        self.x
            .n_rows()
            .ok_or_else(|| Error::InvalidInput("features must be indexable".to_string()))
    }

    /// Check that `X`, `y` and every indexable auxiliary array agree in
    /// sample count.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if `y` is a scalar, or
    /// [`Error::InconsistentLength`] listing every container length.
    pub fn check_consistent_length(&self) -> Result<usize> {
        let n = self.n_samples()?;
        let mut names = vec!["X".to_string()];
        let mut lengths = vec![n];
        if let Some(y) = &self.y {
            let len = y
                .n_rows()
                .ok_or_else(|| Error::InvalidInput("labels must be 1-D or 2-D".to_string()))?;
            names.push("y".to_string());
            lengths.push(len);
        }
        for (key, value) in &self.aux {
            if let Some(len) = value.n_rows() {
                names.push(key.clone());
                lengths.push(len);
            }
        }
        if lengths.iter().any(|&len| len != n) {
            return Err(Error::inconsistent_length(names.join(", "), lengths));
        }
        Ok(n)
    }
}
