//! Fit / fit-transform / score primitives
//!
//! Per (model, fold, candidate) the evaluation moves
//! `Pending -> Fitting -> {Fitted, Failed}` and then
//! `Fitted -> Scoring -> {Scored, Failed}`.
//!
//! Toyota Way: Jidoka. A fit fault under [`ErrorPolicy::Score`] stops only
//! its own unit of work: it is logged, turned into `FIT_FAILURE`, and the
//! sentinel flows through every later step as data. Under
//! [`ErrorPolicy::Raise`] the fault is returned to the caller.

use crate::cache::FoldCache;
use crate::data::{Data, Dataset};
use crate::estimator::{fit_then_transform, Estimator, FitOptions, Scorer};
use crate::params::{set_params, set_params_in_place, ParameterOverlay, Params};
use crate::sentinel::Value;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, debug_span, info, warn};

/// A model, or `FIT_FAILURE`.
pub type EstimatorValue = Value<Box<dyn Estimator>>;

/// A data block, or `FIT_FAILURE`.
pub type DataValue = Value<Arc<Data>>;

/// What to do when a per-fold fit raises.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Propagate the fault and abort the search
    #[default]
    Raise,
    /// Warn, record `FIT_FAILURE`, and score it as this value
    Score(f64),
}

impl ErrorPolicy {
    /// The numeric penalty, if failures are suppressed.
    #[must_use]
    pub const fn error_score(self) -> Option<f64> {
        match self {
            Self::Raise => None,
            Self::Score(s) => Some(s),
        }
    }
}

/// Test score and optional train score of one (fold, candidate) unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Score on the fold's test rows
    pub test: Value<f64>,
    /// Score on the fold's train rows, when requested
    pub train: Option<Value<f64>>,
}

impl ScoreRecord {
    /// Test-only record.
    #[must_use]
    pub const fn test_only(test: Value<f64>) -> Self {
        Self { test, train: None }
    }

    /// Record with a train score.
    #[must_use]
    pub const fn with_train(test: Value<f64>, train: Value<f64>) -> Self {
        Self {
            test,
            train: Some(train),
        }
    }

    /// Both scores are `FIT_FAILURE` (or the only one is).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.test.is_failure() && self.train.map_or(true, |t| t.is_failure())
    }
}

/// Per-unit evaluation settings.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EvalSettings {
    /// Fault handling for per-fold fits
    pub error_policy: ErrorPolicy,
    /// Also score on the training rows
    pub return_train_score: bool,
}

/// Convert a fit fault according to `policy`.
fn handle_fit_fault(policy: ErrorPolicy, fault: anyhow::Error) -> Result<()> {
    match policy {
        ErrorPolicy::Raise => Err(Error::FitFault { source: fault }),
        ErrorPolicy::Score(error_score) => {
            warn!(
                error_score,
                "Estimator fit failed. The score on this train-test partition for these \
                 parameters will be set to {error_score:.6}. Details: {fault:#}"
            );
            Ok(())
        }
    }
}

/// Clone, apply `overlay`, and fit on `x`/`y`.
///
/// Returns `FIT_FAILURE` without computing anything if `estimator` or `x`
/// is already a sentinel.
///
/// # Errors
/// [`Error::FitFault`] if fitting (or applying parameters) raises under
/// [`ErrorPolicy::Raise`].
pub fn fit(
    estimator: &EstimatorValue,
    x: &DataValue,
    y: Option<&Data>,
    policy: ErrorPolicy,
    overlay: Option<&ParameterOverlay>,
    options: &FitOptions,
) -> Result<EstimatorValue> {
    let (Value::Concrete(template), Value::Concrete(x)) = (estimator, x) else {
        return Ok(Value::Failure);
    };

    let attempt = || -> anyhow::Result<Box<dyn Estimator>> {
        let mut est = set_params(template.as_ref(), overlay)?;
        est.fit(x, y, options)?;
        Ok(est)
    };

    match attempt() {
        Ok(est) => Ok(Value::Concrete(est)),
        Err(fault) => handle_fit_fault(policy, fault).map(|()| Value::Failure),
    }
}

/// Like [`fit`], also returning the transformed training data.
///
/// Uses the model's native fit-transform when its capabilities declare
/// one, otherwise fit followed by transform. On a suppressed fault both
/// outputs are `FIT_FAILURE`.
///
/// # Errors
/// [`Error::FitFault`] under [`ErrorPolicy::Raise`].
pub fn fit_transform(
    estimator: &EstimatorValue,
    x: &DataValue,
    y: Option<&Data>,
    policy: ErrorPolicy,
    overlay: Option<&ParameterOverlay>,
    options: &FitOptions,
) -> Result<(EstimatorValue, DataValue)> {
    let (Value::Concrete(template), Value::Concrete(x)) = (estimator, x) else {
        return Ok((Value::Failure, Value::Failure));
    };

    let attempt = || -> anyhow::Result<(Box<dyn Estimator>, Data)> {
        let mut est = set_params(template.as_ref(), overlay)?;
        let xt = fit_then_transform(est.as_mut(), x, y, options)?;
        Ok((est, xt))
    };

    match attempt() {
        Ok((est, xt)) => Ok((Value::Concrete(est), Value::Concrete(Arc::new(xt)))),
        Err(fault) => handle_fit_fault(policy, fault).map(|()| (Value::Failure, Value::Failure)),
    }
}

fn score_one(
    estimator: &EstimatorValue,
    x: &Data,
    y: Option<&Data>,
    scorer: &dyn Scorer,
) -> Result<Value<f64>> {
    let Value::Concrete(est) = estimator else {
        return Ok(Value::Failure);
    };
    scorer
        .score(est.as_ref(), x, y)
        .map(Value::Concrete)
        .map_err(Error::ScoreFault)
}

/// Score a fitted model on test data, and on train data when given.
///
/// A `FIT_FAILURE` model scores `FIT_FAILURE` on both sides.
///
/// # Errors
/// [`Error::ScoreFault`] if the scorer raises on a fitted model.
pub fn score(
    estimator: &EstimatorValue,
    x_test: &Data,
    y_test: Option<&Data>,
    train: Option<(&Data, Option<&Data>)>,
    scorer: &dyn Scorer,
) -> Result<ScoreRecord> {
    let test = score_one(estimator, x_test, y_test, scorer)?;
    match train {
        None => Ok(ScoreRecord::test_only(test)),
        Some((x_train, y_train)) => Ok(ScoreRecord::with_train(
            test,
            score_one(estimator, x_train, y_train, scorer)?,
        )),
    }
}

/// One scheduler unit: extract fold `fold`, fit the candidate, score it.
///
/// Auxiliary dataset arrays are passed to `fit` as fold-sliced options.
///
/// # Errors
/// - extraction errors ([`Error::InvalidKernel`], [`Error::FoldOutOfRange`], ...)
/// - [`Error::FitFault`] under [`ErrorPolicy::Raise`]
/// - [`Error::ScoreFault`]
pub fn fit_and_score(
    estimator: &EstimatorValue,
    cache: &FoldCache,
    dataset: &Dataset,
    fold: usize,
    scorer: &dyn Scorer,
    settings: &EvalSettings,
    overlay: Option<&ParameterOverlay>,
) -> Result<ScoreRecord> {
    let _span = debug_span!("fit_and_score", fold).entered();

    let x_train = cache.extract_features(dataset, fold, true)?;
    let y_train = cache.extract(dataset, fold, false, true)?;
    let x_test = cache.extract_features(dataset, fold, false)?;
    let y_test = cache.extract(dataset, fold, false, false)?;
    let options = cache.extract_params(dataset, fold)?;

    debug!("fitting");
    let fitted = fit(
        estimator,
        &Value::Concrete(Arc::clone(&x_train)),
        y_train.as_deref(),
        settings.error_policy,
        overlay,
        &options,
    )?;
    debug!(failed = fitted.is_failure(), "scoring");

    let train = settings
        .return_train_score
        .then(|| (x_train.as_ref(), y_train.as_deref()));
    score(&fitted, &x_test, y_test.as_deref(), train, scorer)
}

/// Every auxiliary array of `dataset`, unsliced, as fit options.
#[must_use]
pub fn full_fit_options(dataset: &Dataset) -> FitOptions {
    let mut options = FitOptions::new();
    for (key, value) in dataset.aux() {
        options.insert(key.clone(), Arc::new(value.clone()));
    }
    options
}

/// Clone `template`, apply `params` and fit on the full dataset.
///
/// The error policy never applies here.
///
/// # Errors
/// [`Error::RefitFault`] if applying parameters or fitting raises.
pub fn refit_best(
    template: &dyn Estimator,
    params: &Params,
    dataset: &Dataset,
    options: &FitOptions,
) -> Result<Box<dyn Estimator>> {
    let mut est = template.clone_box();
    set_params_in_place(est.as_mut(), params).map_err(Error::RefitFault)?;
    est.fit(dataset.x(), dataset.y(), options)
        .map_err(Error::RefitFault)?;
    info!(n_params = params.len(), "refit best candidate on full dataset");
    Ok(est)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::Capabilities;
    use crate::params::ParamValue;
    use anyhow::bail;
    use ndarray::{array, Array2};

    /// Adds `offset` on transform; fails to fit when `offset < 0`.
    #[derive(Debug, Clone, Default)]
    struct Shift {
        offset: f64,
        fitted: bool,
    }

    impl Estimator for Shift {
        fn clone_box(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }

        fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
            if let Some(v) = params.get("offset").and_then(ParamValue::as_f64) {
                self.offset = v;
            }
            Ok(())
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::none().with_transform().with_score()
        }

        fn fit(&mut self, _x: &Data, _y: Option<&Data>, _o: &FitOptions) -> anyhow::Result<()> {
            if self.offset < 0.0 {
                bail!("negative offset {}", self.offset);
            }
            self.fitted = true;
            Ok(())
        }

        fn transform(&self, x: &Data) -> anyhow::Result<Data> {
            match x {
                Data::Dense(a) => Ok(Data::Dense(a + self.offset)),
                _ => bail!("dense only"),
            }
        }

        fn score(&self, _x: &Data, _y: Option<&Data>) -> anyhow::Result<f64> {
            Ok(self.offset)
        }
    }

    fn template() -> EstimatorValue {
        Value::Concrete(Box::new(Shift::default()))
    }

    fn x() -> DataValue {
        Value::Concrete(Arc::new(Data::Dense(array![[1.0], [2.0]])))
    }

    fn overlay(offset: f64) -> ParameterOverlay {
        ParameterOverlay::from_params(&Params::new().with("offset", offset))
    }

    #[test]
    fn test_fit_applies_overlay_to_clone() {
        let options = FitOptions::new();
        let est = fit(&template(), &x(), None, ErrorPolicy::Raise, Some(&overlay(3.0)), &options)
            .unwrap()
            .into_concrete()
            .unwrap();
        let offset = Estimator::score(est.as_ref(), &Data::Scalar(0.0), None).unwrap();
        assert!((offset - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_fit_short_circuits_on_failure_inputs() {
        let options = FitOptions::new();
        let out = fit(&Value::Failure, &x(), None, ErrorPolicy::Raise, None, &options).unwrap();
        assert!(out.is_failure());
        let out =
            fit(&template(), &Value::Failure, None, ErrorPolicy::Raise, None, &options).unwrap();
        assert!(out.is_failure());
    }

    #[test]
    fn test_fit_raise_policy_surfaces_fault() {
        let options = FitOptions::new();
        let err = fit(&template(), &x(), None, ErrorPolicy::Raise, Some(&overlay(-1.0)), &options)
            .unwrap_err();
        assert!(matches!(err, Error::FitFault { .. }));
        assert!(err.to_string().contains("negative offset"));
    }

    #[test]
    fn test_fit_score_policy_yields_failure() {
        let policy = ErrorPolicy::Score(0.0);
        let options = FitOptions::new();
        let out = fit(&template(), &x(), None, policy, Some(&overlay(-1.0)), &options).unwrap();
        assert!(out.is_failure());
    }

    #[test]
    fn test_fit_transform_falls_back_to_fit_then_transform() {
        let policy = ErrorPolicy::Raise;
        let options = FitOptions::new();
        let (est, xt) =
            fit_transform(&template(), &x(), None, policy, Some(&overlay(1.0)), &options).unwrap();
        assert!(!est.is_failure());
        let xt = xt.into_concrete().unwrap();
        assert_eq!(xt.as_dense().unwrap(), &array![[2.0], [3.0]]);
    }

    #[test]
    fn test_fit_transform_failure_pairs() {
        let policy = ErrorPolicy::Score(-1.0);
        let options = FitOptions::new();
        let (est, xt) =
            fit_transform(&template(), &x(), None, policy, Some(&overlay(-5.0)), &options).unwrap();
        assert!(est.is_failure());
        assert!(xt.is_failure());
    }

    #[test]
    fn test_score_failure_model_scores_failure_both_sides() {
        let x = Data::Dense(Array2::zeros((1, 1)));
        let scorer = crate::estimator::Metric::Estimator;
        let record = score(&Value::Failure, &x, None, Some((&x, None)), &scorer).unwrap();
        assert!(record.test.is_failure());
        assert_eq!(record.train, Some(Value::Failure));
        assert!(record.is_failure());
    }

    #[test]
    fn test_score_fault_is_not_suppressed() {
        let x = Data::Dense(Array2::zeros((1, 1)));
        let scorer = |_: &dyn Estimator, _: &Data, _: Option<&Data>| -> anyhow::Result<f64> {
            bail!("scorer broke")
        };
        let err = score(&template(), &x, None, None, &scorer).unwrap_err();
        assert!(matches!(err, Error::ScoreFault(_)));
    }

    #[test]
    fn test_refit_best_fault_is_fatal() {
        let ds = Dataset::new(Array2::<f64>::zeros((3, 1)));
        let params = Params::new().with("offset", -2.0);
        let err = refit_best(&Shift::default(), &params, &ds, &FitOptions::new()).unwrap_err();
        assert!(matches!(err, Error::RefitFault(_)));
    }

    #[test]
    fn test_error_policy_serde() {
        let json = serde_json::to_string(&ErrorPolicy::Score(0.5)).unwrap();
        assert_eq!(json, r#"{"score":0.5}"#);
        let back: ErrorPolicy = serde_json::from_str("\"raise\"").unwrap();
        assert_eq!(back, ErrorPolicy::Raise);
    }
}
