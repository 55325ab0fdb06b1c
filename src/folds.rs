//! Fold-generating strategies
//!
//! A strategy turns a dataset into an ordered list of [`Fold`]s. Folds are
//! produced once, when the fold cache is built, and never change afterwards.

use crate::data::{Dataset, Fold, IndexSet};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Splits a dataset into train/test folds.
pub trait FoldStrategy: Send + Sync {
    /// Produce the folds for `dataset`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if the strategy cannot split the data.
    fn split(&self, dataset: &Dataset) -> Result<Vec<Fold>>;

    /// Number of folds the strategy produces, when known up front.
    fn n_splits(&self) -> Option<usize> {
        None
    }
}

/// K-fold cross-validation.
///
/// Test blocks are contiguous (after the optional shuffle); the first
/// `n_samples % n_splits` folds get one extra sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KFold {
    n_splits: usize,
    shuffle: bool,
    seed: u64,
}

impl KFold {
    /// Unshuffled k-fold.
    #[must_use]
    pub const fn new(n_splits: usize) -> Self {
        Self {
            n_splits,
            shuffle: false,
            seed: 0,
        }
    }

    /// Shuffle sample order with a fixed seed before splitting.
    #[must_use]
    pub const fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }
}

impl FoldStrategy for KFold {
    fn split(&self, dataset: &Dataset) -> Result<Vec<Fold>> {
        let n_samples = dataset.n_samples()?;
        if self.n_splits < 2 {
            return Err(Error::InvalidInput(format!(
                "k-fold cross-validation requires at least 2 splits, got {}",
                self.n_splits
            )));
        }
        if self.n_splits > n_samples {
            return Err(Error::InvalidInput(format!(
                "cannot have n_splits={} greater than the number of samples {n_samples}",
                self.n_splits
            )));
        }

        let mut order: Vec<usize> = (0..n_samples).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed));
        }

        let base = n_samples / self.n_splits;
        let extra = n_samples % self.n_splits;
        let mut folds = Vec::with_capacity(self.n_splits);
        let mut start = 0;
        for k in 0..self.n_splits {
            let size = base + usize::from(k < extra);
            let stop = start + size;
            let test = order[start..stop].to_vec();
            let train = order[..start]
                .iter()
                .chain(&order[stop..])
                .copied()
                .collect::<Vec<_>>();
            folds.push(Fold::new(train, test));
            start = stop;
        }
        Ok(folds)
    }

    fn n_splits(&self) -> Option<usize> {
        Some(self.n_splits)
    }
}

/// Caller-supplied folds, validated against the dataset before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedSplit {
    folds: Vec<Fold>,
}

impl PredefinedSplit {
    /// Wrap explicit folds.
    #[must_use]
    pub fn new(folds: Vec<Fold>) -> Self {
        Self { folds }
    }

    /// Build folds from a per-sample test-fold label; `-1` keeps a sample
    /// in every training set.
    #[must_use]
    pub fn from_test_fold(test_fold: &[i64]) -> Self {
        let mut labels: Vec<i64> = test_fold.iter().copied().filter(|&f| f >= 0).collect();
        labels.sort_unstable();
        labels.dedup();

        let folds = labels
            .into_iter()
            .map(|label| {
                let test: Vec<bool> = test_fold.iter().map(|&f| f == label).collect();
                let train: Vec<bool> = test.iter().map(|&t| !t).collect();
                Fold::new(IndexSet::Mask(train), IndexSet::Mask(test))
            })
            .collect();
        Self { folds }
    }
}

impl FoldStrategy for PredefinedSplit {
    fn split(&self, dataset: &Dataset) -> Result<Vec<Fold>> {
        let n_samples = dataset.n_samples()?;
        for fold in &self.folds {
            fold.train().validate(n_samples)?;
            fold.test().validate(n_samples)?;
        }
        Ok(self.folds.clone())
    }

    fn n_splits(&self) -> Option<usize> {
        Some(self.folds.len())
    }
}
