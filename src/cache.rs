//! Fold cache: fold partition plus memoized per-fold subsets
//!
//! The cache owns the folds of one search and a memoization table keyed by
//! `(fold index, slot)`. Identical extractions requested by different
//! candidates (or different steps of a pipeline) collapse to a single
//! physical row selection.
//!
//! Toyota Way Principles:
//! - **Muda elimination**: each `(fold, slot)` subset is computed at most once
//! - **Poka-Yoke**: entries are inserted fully computed or not at all
//!
//! ## Concurrency
//!
//! The table is a `DashMap`. A first writer computes while holding the
//! shard lock of its key, so concurrent requests for the same key wait and
//! then read the stored value instead of recomputing. A failed computation
//! leaves no entry behind.
//!
//! The shard stays write-locked for the whole row selection, so readers of
//! unrelated keys hashed to the same shard also wait for it. Extractions
//! are plain row copies and the table holds only `folds * slots` keys, so
//! this contention is bounded by one extraction per shard. A per-key
//! once-cell would lift it but needs a fallible initializer, which the
//! standard `OnceLock` does not offer on stable.
//!
//! ## Redistribution
//!
//! Serializing a cache keeps the folds, the pairwise flag and whether
//! memoization is enabled, but never the entries: a deserialized cache is
//! always cold.

use crate::data::{Data, Dataset, Fold};
use crate::estimator::FitOptions;
use crate::folds::FoldStrategy;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Which subset of a fold a memo entry holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Training rows of `X`
    FeaturesTrain,
    /// Test rows of `X`
    FeaturesTest,
    /// Training rows of `y`
    LabelsTrain,
    /// Test rows of `y`
    LabelsTest,
    /// Training rows of an auxiliary array, by key
    Param(String),
}

impl Slot {
    /// Slot for a features/labels, train/test request.
    #[must_use]
    pub const fn for_request(want_features: bool, want_train: bool) -> Self {
        match (want_features, want_train) {
            (true, true) => Self::FeaturesTrain,
            (true, false) => Self::FeaturesTest,
            (false, true) => Self::LabelsTrain,
            (false, false) => Self::LabelsTest,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeaturesTrain => f.write_str("X_train"),
            Self::FeaturesTest => f.write_str("X_test"),
            Self::LabelsTrain => f.write_str("y_train"),
            Self::LabelsTest => f.write_str("y_test"),
            Self::Param(key) => write!(f, "param@{key}"),
        }
    }
}

type MemoTable = DashMap<(usize, Slot), Arc<Data>, FxBuildHasher>;

/// Folds of a search plus the memoization table.
pub struct FoldCache {
    folds: Vec<Fold>,
    pairwise: bool,
    memo: Option<MemoTable>,
    computed: AtomicUsize,
}

impl FoldCache {
    /// Wrap already materialized folds.
    #[must_use]
    pub fn new(folds: Vec<Fold>, pairwise: bool, cache: bool) -> Self {
        Self {
            folds,
            pairwise,
            memo: cache.then(|| DashMap::with_hasher(FxBuildHasher)),
            computed: AtomicUsize::new(0),
        }
    }

    /// Validate the dataset and materialize folds with `strategy`.
    ///
    /// # Errors
    /// - [`Error::InconsistentLength`] if `X`, `y` and auxiliary arrays
    ///   disagree in sample count
    /// - any error of the fold strategy
    pub fn build(
        dataset: &Dataset,
        strategy: &dyn FoldStrategy,
        pairwise: bool,
        cache: bool,
    ) -> Result<Self> {
        dataset.check_consistent_length()?;
        let folds = strategy.split(dataset)?;
        Ok(Self::new(folds, pairwise, cache))
    }

    /// Number of folds.
    #[must_use]
    pub fn n_splits(&self) -> usize {
        self.folds.len()
    }

    /// The folds, in order.
    #[must_use]
    pub fn folds(&self) -> &[Fold] {
        &self.folds
    }

    /// Whether `X` is treated as a precomputed kernel.
    #[must_use]
    pub const fn is_pairwise(&self) -> bool {
        self.pairwise
    }

    /// Whether memoization is enabled.
    #[must_use]
    pub const fn is_caching(&self) -> bool {
        self.memo.is_some()
    }

    /// Number of memoized entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memo.as_ref().map_or(0, |memo| memo.len())
    }

    /// True if nothing is memoized.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of physical extractions performed so far.
    #[must_use]
    pub fn computations(&self) -> usize {
        self.computed.load(Ordering::Relaxed)
    }

    /// Cardinality of each fold's test set.
    #[must_use]
    pub fn test_sample_counts(&self) -> Vec<usize> {
        self.folds.iter().map(|f| f.test().count()).collect()
    }

    /// Train or test subset of `X` or `y` for fold `n`.
    ///
    /// Returns `Ok(None)` when labels are requested but the dataset has none.
    ///
    /// # Errors
    /// - [`Error::FoldOutOfRange`] for an unknown fold
    /// - [`Error::InvalidKernel`] in pairwise mode if `X` is not square
    pub fn extract(
        &self,
        dataset: &Dataset,
        n: usize,
        want_features: bool,
        want_train: bool,
    ) -> Result<Option<Arc<Data>>> {
        if want_features {
            return self.extract_features(dataset, n, want_train).map(Some);
        }
        match dataset.y() {
            Some(y) => self.slice(dataset, y, n, false, want_train).map(Some),
            None => Ok(None),
        }
    }

    /// Train or test subset of `X` for fold `n`.
    ///
    /// # Errors
    /// See [`FoldCache::extract`].
    pub fn extract_features(
        &self,
        dataset: &Dataset,
        n: usize,
        want_train: bool,
    ) -> Result<Arc<Data>> {
        self.slice(dataset, dataset.x(), n, true, want_train)
    }

    fn slice(
        &self,
        dataset: &Dataset,
        container: &Data,
        n: usize,
        is_features: bool,
        want_train: bool,
    ) -> Result<Arc<Data>> {
        let fold = self.fold(n)?;
        let slot = Slot::for_request(is_features, want_train);
        self.memoize((n, slot), || {
            let n_samples = dataset.n_samples()?;
            let side = if want_train { fold.train() } else { fold.test() };
            side.validate(n_samples)?;

            if is_features && self.pairwise {
                return extract_pairwise(container, fold, want_train, n_samples);
            }
            container.select_rows(&side.positions())
        })
    }

    /// Training rows of an auxiliary per-sample array for fold `n`.
    ///
    /// Non-indexable values (broadcast scalars) are returned unchanged.
    ///
    /// # Errors
    /// [`Error::FoldOutOfRange`] for an unknown fold, or a row-selection error.
    pub fn extract_param(&self, key: &str, value: &Data, n: usize) -> Result<Arc<Data>> {
        let fold = self.fold(n)?;
        if !value.is_indexable() {
            return Ok(Arc::new(value.clone()));
        }
        self.memoize((n, Slot::Param(key.to_string())), || {
            value.select_rows(&fold.train().positions())
        })
    }

    /// Every auxiliary array of `dataset`, fold-sliced as fit options.
    ///
    /// # Errors
    /// See [`FoldCache::extract_param`].
    pub fn extract_params(&self, dataset: &Dataset, n: usize) -> Result<FitOptions> {
        let mut options = FitOptions::new();
        for (key, value) in dataset.aux() {
            options.insert(key.clone(), self.extract_param(key, value, n)?);
        }
        Ok(options)
    }

    fn fold(&self, n: usize) -> Result<&Fold> {
        self.folds.get(n).ok_or(Error::FoldOutOfRange {
            index: n,
            n_splits: self.folds.len(),
        })
    }

    fn memoize<F>(&self, key: (usize, Slot), compute: F) -> Result<Arc<Data>>
    where
        F: FnOnce() -> Result<Data>,
    {
        let Some(memo) = &self.memo else {
            self.computed.fetch_add(1, Ordering::Relaxed);
            return compute().map(Arc::new);
        };

        if let Some(hit) = memo.get(&key) {
            trace!(fold = key.0, slot = %key.1, "fold cache hit");
            return Ok(Arc::clone(hit.value()));
        }

        match memo.entry(key) {
            Entry::Occupied(hit) => Ok(Arc::clone(hit.get())),
            Entry::Vacant(slot) => {
                trace!(fold = slot.key().0, slot = %slot.key().1, "fold cache miss");
                let value = Arc::new(compute()?);
                self.computed.fetch_add(1, Ordering::Relaxed);
                slot.insert(Arc::clone(&value));
                Ok(value)
            }
        }
    }
}

/// Kernel slice: rows from the requested side, columns from the train side.
fn extract_pairwise(x: &Data, fold: &Fold, want_train: bool, n_samples: usize) -> Result<Data> {
    let Some((rows, cols)) = x.shape() else {
        return Err(Error::InvalidKernel(
            "precomputed kernels or affinity matrices have to be passed as 2-D arrays or sparse matrices"
                .to_string(),
        ));
    };
    if rows != cols {
        return Err(Error::InvalidKernel(format!(
            "X should be a square kernel matrix, got shape ({rows}, {cols})"
        )));
    }
    fold.train().validate(n_samples)?;
    let train = fold.train().positions();
    let side = if want_train { fold.train() } else { fold.test() };
    x.select_block(&side.positions(), &train)
}

impl fmt::Debug for FoldCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FoldCache")
            .field("n_splits", &self.folds.len())
            .field("pairwise", &self.pairwise)
            .field("cache", &self.is_caching())
            .field("entries", &self.len())
            .finish()
    }
}

#[derive(Serialize)]
struct ColdCacheRef<'a> {
    folds: &'a [Fold],
    pairwise: bool,
    cache: bool,
}

#[derive(Deserialize)]
struct ColdCache {
    folds: Vec<Fold>,
    pairwise: bool,
    cache: bool,
}

impl Serialize for FoldCache {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ColdCacheRef {
            folds: &self.folds,
            pairwise: self.pairwise,
            cache: self.is_caching(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FoldCache {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let cold = ColdCache::deserialize(deserializer)?;
        Ok(Self::new(cold.folds, cold.pairwise, cold.cache))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folds::KFold;
    use ndarray::{array, Array1, Array2};

    fn dataset() -> Dataset {
        let x = Array2::from_shape_fn((6, 2), |(i, j)| (i * 10 + j) as f64);
        let y = Array1::from_iter((0..6u32).map(f64::from));
        Dataset::new(x).with_labels(y)
    }

    #[test]
    fn test_extract_train_rows() {
        let ds = dataset();
        let cache = FoldCache::build(&ds, &KFold::new(3), false, true).unwrap();
        let x_train = cache.extract(&ds, 0, true, true).unwrap().unwrap();
        assert_eq!(x_train.shape(), Some((4, 2)));
        assert_eq!(x_train.as_dense().unwrap()[[0, 0]], 20.0);

        let y_test = cache.extract(&ds, 0, false, false).unwrap().unwrap();
        assert_eq!(y_test.as_vector().unwrap(), &array![0.0, 1.0]);
    }

    #[test]
    fn test_extract_is_memoized() {
        let ds = dataset();
        let cache = FoldCache::build(&ds, &KFold::new(3), false, true).unwrap();

        let first = cache.extract(&ds, 1, true, false).unwrap().unwrap();
        let second = cache.extract(&ds, 1, true, false).unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.computations(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_extract_without_cache_recomputes() {
        let ds = dataset();
        let cache = FoldCache::build(&ds, &KFold::new(3), false, false).unwrap();
        let first = cache.extract(&ds, 1, true, false).unwrap().unwrap();
        let second = cache.extract(&ds, 1, true, false).unwrap().unwrap();

        assert_eq!(first, second);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.computations(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_extract_labels_absent() {
        let ds = Dataset::new(Array2::<f64>::zeros((4, 1)));
        let cache = FoldCache::build(&ds, &KFold::new(2), false, true).unwrap();
        assert!(cache.extract(&ds, 0, false, true).unwrap().is_none());
        assert_eq!(cache.computations(), 0);
    }

    #[test]
    fn test_extract_fold_out_of_range() {
        let ds = dataset();
        let cache = FoldCache::build(&ds, &KFold::new(2), false, true).unwrap();
        let err = cache.extract(&ds, 5, true, true).unwrap_err();
        assert!(matches!(err, Error::FoldOutOfRange { index: 5, n_splits: 2 }));
    }

    #[test]
    fn test_pairwise_slices() {
        let kernel = Array2::from_shape_fn((6, 6), |(i, j)| (i * 6 + j) as f64);
        let ds = Dataset::new(kernel);
        let cache = FoldCache::build(&ds, &KFold::new(3), true, true).unwrap();

        let train = cache.extract(&ds, 0, true, true).unwrap().unwrap();
        let test = cache.extract(&ds, 0, true, false).unwrap().unwrap();
        assert_eq!(train.shape(), Some((4, 4)));
        assert_eq!(test.shape(), Some((2, 4)));
        // test row 0 against train column 0 (sample 2)
        assert_eq!(test.as_dense().unwrap()[[0, 0]], 2.0);
    }

    #[test]
    fn test_pairwise_rejects_non_square() {
        let ds = Dataset::new(Array2::<f64>::zeros((6, 3)));
        let cache = FoldCache::build(&ds, &KFold::new(3), true, true).unwrap();
        let err = cache.extract(&ds, 0, true, true).unwrap_err();
        assert!(matches!(err, Error::InvalidKernel(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pairwise_rejects_shapeless() {
        let ds = Dataset::new(Array1::<f64>::zeros(4));
        let cache = FoldCache::build(&ds, &KFold::new(2), true, true).unwrap();
        assert!(matches!(
            cache.extract(&ds, 0, true, false),
            Err(Error::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_extract_param_scalar_passthrough() {
        let ds = dataset();
        let cache = FoldCache::build(&ds, &KFold::new(3), false, true).unwrap();
        let out = cache.extract_param("alpha", &Data::Scalar(0.5), 0).unwrap();
        assert_eq!(*out, Data::Scalar(0.5));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_extract_param_memoized_train_rows() {
        let ds = dataset();
        let cache = FoldCache::build(&ds, &KFold::new(3), false, true).unwrap();
        let weights = Data::Vector(array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let a = cache.extract_param("sample_weight", &weights, 2).unwrap();
        let b = cache.extract_param("sample_weight", &weights, 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.as_vector().unwrap(), &array![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_test_sample_counts_with_masks() {
        let folds = vec![
            Fold::new(vec![true, true, false], vec![false, false, true]),
            Fold::new(vec![2usize], vec![0usize, 1]),
        ];
        let cache = FoldCache::new(folds, false, true);
        assert_eq!(cache.test_sample_counts(), vec![1, 2]);
    }

    #[test]
    fn test_serialization_yields_cold_cache() {
        let ds = dataset();
        let cache = FoldCache::build(&ds, &KFold::new(3), true, true).unwrap();
        let _ = cache.extract(&ds, 0, false, true).unwrap();
        assert_eq!(cache.len(), 1);

        let json = serde_json::to_string(&cache).unwrap();
        let restored: FoldCache = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.folds(), cache.folds());
        assert!(restored.is_pairwise());
        assert!(restored.is_caching());
        assert!(restored.is_empty());
    }
}
