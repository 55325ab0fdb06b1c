//! Cross-validated parameter search
//!
//! [`CvSearch`] composes the evaluation layer end to end: build the fold
//! cache, evaluate every (fold, candidate) unit, aggregate, select the best
//! candidate and optionally refit it on the full dataset.
//!
//! Units are independent. With the `rayon` feature (default) they run on
//! the rayon thread pool; the only shared state is the fold cache's memo
//! table and the parameter-application critical section.

use crate::cache::FoldCache;
use crate::data::Dataset;
use crate::estimator::{Estimator, Scorer};
use crate::eval::{
    fit_and_score, full_fit_options, refit_best, ErrorPolicy, EstimatorValue, EvalSettings,
};
use crate::folds::FoldStrategy;
use crate::params::{ParamValue, ParameterOverlay, Params};
use crate::results::{aggregate_scores, select_best, ResultTable};
use crate::sentinel::Value;
use crate::{Error, Result};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

/// Search settings.
///
/// Missing JSON fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// What a per-fold fit fault does (default: raise)
    pub error_policy: ErrorPolicy,
    /// Also record scores on the training rows
    pub return_train_score: bool,
    /// Weight folds by their test sample count when averaging
    pub iid: bool,
    /// Memoize fold extractions
    pub cache_cv: bool,
    /// `X` is a precomputed sample-by-sample kernel
    pub pairwise: bool,
    /// Refit the best candidate on the full dataset
    pub refit: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::Raise,
            return_train_score: false,
            iid: true,
            cache_cv: true,
            pairwise: false,
            refit: true,
        }
    }
}

impl SearchConfig {
    /// Create a builder starting from the defaults.
    #[must_use]
    pub fn builder() -> SearchConfigBuilder {
        SearchConfigBuilder::default()
    }

    /// Parse a JSON document.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] if the document is not a valid config.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("invalid search config: {e}")))
    }

    /// Settings handed to each evaluation unit.
    #[must_use]
    pub const fn eval_settings(&self) -> EvalSettings {
        EvalSettings {
            error_policy: self.error_policy,
            return_train_score: self.return_train_score,
        }
    }
}

/// Builder for `SearchConfig`.
#[derive(Debug, Default)]
pub struct SearchConfigBuilder {
    config: SearchConfig,
}

impl SearchConfigBuilder {
    /// Set the fit fault policy.
    #[must_use]
    pub const fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.error_policy = policy;
        self
    }

    /// Suppress fit faults and score them as `score`.
    #[must_use]
    pub const fn error_score(self, score: f64) -> Self {
        self.error_policy(ErrorPolicy::Score(score))
    }

    /// Record train scores.
    #[must_use]
    pub const fn return_train_score(mut self, enabled: bool) -> Self {
        self.config.return_train_score = enabled;
        self
    }

    /// Weight folds by test sample count.
    #[must_use]
    pub const fn iid(mut self, enabled: bool) -> Self {
        self.config.iid = enabled;
        self
    }

    /// Memoize fold extractions.
    #[must_use]
    pub const fn cache_cv(mut self, enabled: bool) -> Self {
        self.config.cache_cv = enabled;
        self
    }

    /// Treat `X` as a precomputed kernel.
    #[must_use]
    pub const fn pairwise(mut self, enabled: bool) -> Self {
        self.config.pairwise = enabled;
        self
    }

    /// Refit the best candidate.
    #[must_use]
    pub const fn refit(mut self, enabled: bool) -> Self {
        self.config.refit = enabled;
        self
    }

    /// Build the `SearchConfig`.
    #[must_use]
    pub const fn build(self) -> SearchConfig {
        self.config
    }
}

/// Outcome of [`CvSearch::fit`].
#[derive(Debug)]
pub struct SearchResult {
    /// Per-candidate results
    pub table: ResultTable,
    /// Index of the selected candidate
    pub best_index: usize,
    /// Parameters of the selected candidate
    pub best_params: Params,
    /// The selected candidate refitted on the full dataset, if requested
    pub best_estimator: Option<Box<dyn Estimator>>,
}

/// Cartesian product of named value lists; the last name varies fastest.
///
/// An empty grid yields a single empty candidate.
#[must_use]
pub fn parameter_grid(grid: &[(String, Vec<ParamValue>)]) -> Vec<Params> {
    grid.iter().fold(vec![Params::new()], |acc, (name, values)| {
        acc.iter()
            .flat_map(|params| {
                values
                    .iter()
                    .map(move |v| params.clone().with(name.clone(), v.clone()))
            })
            .collect()
    })
}

/// Compress candidates into overlays over the union of their names;
/// a name a candidate does not set is `MISSING`.
fn compress(candidates: &[Params]) -> Result<Vec<ParameterOverlay>> {
    let mut fields: Vec<String> = Vec::new();
    for name in candidates.iter().flat_map(Params::names) {
        if !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
    }
    candidates
        .iter()
        .map(|params| {
            let values = fields
                .iter()
                .map(|f| params.get(f).cloned().map_or(Value::Missing, Value::Concrete))
                .collect();
            ParameterOverlay::new(fields.clone(), values)
        })
        .collect()
}

/// Exhaustive cross-validated search over explicit candidates.
pub struct CvSearch {
    template: Box<dyn Estimator>,
    candidates: Vec<Params>,
    overlays: Vec<ParameterOverlay>,
    scorer: Box<dyn Scorer>,
    config: SearchConfig,
}

impl CvSearch {
    /// Search `candidates` (sparse parameter mappings) for `template`.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] if there are no candidates.
    pub fn new(
        template: Box<dyn Estimator>,
        candidates: &[Params],
        scorer: impl Scorer + 'static,
        config: SearchConfig,
    ) -> Result<Self> {
        if candidates.is_empty() {
            return Err(Error::InvalidInput("search needs at least one candidate".to_string()));
        }
        Ok(Self {
            template,
            overlays: compress(candidates)?,
            candidates: candidates.to_vec(),
            scorer: Box::new(scorer),
            config,
        })
    }

    /// The search settings.
    #[must_use]
    pub const fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Compressed candidates.
    #[must_use]
    pub fn overlays(&self) -> &[ParameterOverlay] {
        &self.overlays
    }

    /// Candidates as given, in search order and with their own name order.
    #[must_use]
    pub fn candidates(&self) -> &[Params] {
        &self.candidates
    }

    /// Run the search.
    ///
    /// # Errors
    /// - dataset validation and fold strategy errors
    /// - [`Error::FitFault`] under [`ErrorPolicy::Raise`]
    /// - [`Error::ScoreFault`], [`Error::RefitFault`]
    #[allow(clippy::cast_precision_loss)]
    pub fn fit(&self, dataset: &Dataset, strategy: &dyn FoldStrategy) -> Result<SearchResult> {
        let n_candidates = self.overlays.len();
        let _span = info_span!("cv_search", n_candidates).entered();

        let SearchConfig {
            pairwise, cache_cv, ..
        } = self.config;
        let cache = FoldCache::build(dataset, strategy, pairwise, cache_cv)?;
        let n_splits = cache.n_splits();
        debug!(n_splits, caching = cache.is_caching(), "fold cache ready");

        let template: EstimatorValue = Value::Concrete(self.template.clone());
        let settings = self.config.eval_settings();
        let units: Vec<(usize, usize)> = (0..n_splits)
            .flat_map(|fold| (0..n_candidates).map(move |c| (fold, c)))
            .collect();
        let run = |&(fold, c): &(usize, usize)| {
            fit_and_score(
                &template,
                &cache,
                dataset,
                fold,
                self.scorer.as_ref(),
                &settings,
                Some(&self.overlays[c]),
            )
        };

        #[cfg(feature = "rayon")]
        let scores = units.par_iter().map(run).collect::<Result<Vec<_>>>()?;
        #[cfg(not(feature = "rayon"))]
        let scores = units.iter().map(run).collect::<Result<Vec<_>>>()?;

        let failed = scores.iter().filter(|r| r.test.is_failure()).count();
        let weights: Option<Vec<f64>> = self
            .config
            .iid
            .then(|| cache.test_sample_counts().into_iter().map(|n| n as f64).collect());
        // only reachable with failures under a suppressing policy
        let error_score = settings.error_policy.error_score().unwrap_or(f64::NAN);

        let params = &self.candidates;
        let table = aggregate_scores(&scores, params, n_splits, error_score, weights.as_deref())?;
        let (best_index, best_params) = select_best(params, &table)?;
        let best_params = best_params.clone();

        let best_estimator = if self.config.refit {
            let options = full_fit_options(dataset);
            Some(refit_best(self.template.as_ref(), &best_params, dataset, &options)?)
        } else {
            None
        };

        info!(
            n_splits,
            n_candidates,
            failed,
            extractions = cache.computations(),
            best_index,
            "cross-validation search finished"
        );
        Ok(SearchResult {
            table,
            best_index,
            best_params,
            best_estimator,
        })
    }
}
