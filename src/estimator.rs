//! Model handle capability set
//!
//! The evaluation layer never looks inside a model. It only needs the
//! capabilities below: clone, set-parameters, fit, and optionally
//! transform / fit-transform / predict / score. Optional capabilities are
//! declared through [`Capabilities`] and checked explicitly before dispatch.

use crate::data::Data;
use crate::params::Params;
use anyhow::{anyhow, bail};
use ndarray::Array1;
use std::fmt;
use std::sync::Arc;

/// Optional capabilities a model exposes beyond fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `transform` is implemented
    pub transform: bool,
    /// `fit_transform` is implemented natively (not fit + transform)
    pub fit_transform: bool,
    /// `predict` is implemented
    pub predict: bool,
    /// `score` is implemented
    pub score: bool,
}

impl Capabilities {
    /// Fit-only model.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            transform: false,
            fit_transform: false,
            predict: false,
            score: false,
        }
    }

    /// Add `transform`.
    #[must_use]
    pub const fn with_transform(mut self) -> Self {
        self.transform = true;
        self
    }

    /// Add native `fit_transform`.
    #[must_use]
    pub const fn with_fit_transform(mut self) -> Self {
        self.transform = true;
        self.fit_transform = true;
        self
    }

    /// Add `predict`.
    #[must_use]
    pub const fn with_predict(mut self) -> Self {
        self.predict = true;
        self
    }

    /// Add `score`.
    #[must_use]
    pub const fn with_score(mut self) -> Self {
        self.score = true;
        self
    }
}

/// A fittable model (leaf or composite).
///
/// Faults are reported as [`anyhow::Error`]; the evaluation layer decides
/// whether they are fatal or converted into the `FIT_FAILURE` sentinel.
///
/// `set_params` is not assumed to be reentrant. The crate only calls it
/// inside [`crate::params::with_param_lock`].
pub trait Estimator: Send + Sync + fmt::Debug {
    /// Deep copy sharing no mutable state with `self`.
    fn clone_box(&self) -> Box<dyn Estimator>;

    /// Apply a sparse parameter mapping.
    ///
    /// # Errors
    /// Unknown parameter names or invalid values.
    fn set_params(&mut self, params: &Params) -> anyhow::Result<()>;

    /// Current parameters, for reporting.
    fn get_params(&self) -> Params {
        Params::new()
    }

    /// Optional capabilities of this model.
    fn capabilities(&self) -> Capabilities {
        Capabilities::none()
    }

    /// Fit on `x` (and `y` for supervised models).
    ///
    /// # Errors
    /// Any fault raised by the learning algorithm.
    fn fit(&mut self, x: &Data, y: Option<&Data>, options: &FitOptions) -> anyhow::Result<()>;

    /// Transform `x` with the fitted model.
    ///
    /// # Errors
    /// Fails unless [`Capabilities::transform`] is set.
    fn transform(&self, _x: &Data) -> anyhow::Result<Data> {
        bail!("{self:?} does not support transform")
    }

    /// Fit then transform in one pass.
    ///
    /// Only called when [`Capabilities::fit_transform`] is set.
    ///
    /// # Errors
    /// Any fit or transform fault.
    fn fit_transform(
        &mut self,
        x: &Data,
        y: Option<&Data>,
        options: &FitOptions,
    ) -> anyhow::Result<Data> {
        self.fit(x, y, options)?;
        self.transform(x)
    }

    /// Predict targets for `x`.
    ///
    /// # Errors
    /// Fails unless [`Capabilities::predict`] is set.
    fn predict(&self, _x: &Data) -> anyhow::Result<Data> {
        bail!("{self:?} does not support predict")
    }

    /// Model-defined score (greater is better).
    ///
    /// # Errors
    /// Fails unless [`Capabilities::score`] is set.
    fn score(&self, _x: &Data, _y: Option<&Data>) -> anyhow::Result<f64> {
        bail!("{self:?} does not support score")
    }
}

/// Fit and transform `x`, through the native fit-transform when the model
/// declares one.
///
/// # Errors
/// Any fit or transform fault, or a model that declares no `transform`
/// (checked before fitting).
pub fn fit_then_transform(
    est: &mut dyn Estimator,
    x: &Data,
    y: Option<&Data>,
    options: &FitOptions,
) -> anyhow::Result<Data> {
    let caps = est.capabilities();
    if caps.fit_transform {
        return est.fit_transform(x, y, options);
    }
    if !caps.transform {
        bail!("{est:?} does not declare transform");
    }
    est.fit(x, y, options)?;
    est.transform(x)
}

impl Clone for Box<dyn Estimator> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Keyword options forwarded to `fit` (sample weights, groups, ...).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitOptions {
    entries: Vec<(String, Arc<Data>)>,
}

impl FitOptions {
    /// No options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an option.
    pub fn insert(&mut self, key: impl Into<String>, value: Arc<Data>) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Look up an option.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Data> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_ref())
    }

    /// Options in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Data)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Number of options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no options.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scoring capability `(model, X[, y]) -> number`, greater is better.
pub trait Scorer: Send + Sync {
    /// Score a fitted model.
    ///
    /// # Errors
    /// Any fault raised while predicting or scoring.
    fn score(&self, estimator: &dyn Estimator, x: &Data, y: Option<&Data>) -> anyhow::Result<f64>;
}

impl<F> Scorer for F
where
    F: Fn(&dyn Estimator, &Data, Option<&Data>) -> anyhow::Result<f64> + Send + Sync,
{
    fn score(&self, estimator: &dyn Estimator, x: &Data, y: Option<&Data>) -> anyhow::Result<f64> {
        self(estimator, x, y)
    }
}

/// Prediction-based metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// The model's own `score`
    Estimator,
    /// Negated mean squared error of `predict`
    NegMeanSquaredError,
    /// Coefficient of determination of `predict`
    R2,
    /// Fraction of exactly matching predictions
    Accuracy,
}

impl Metric {
    /// Labels and predictions as equally long, non-empty 1-D arrays.
    fn paired(
        self,
        estimator: &dyn Estimator,
        x: &Data,
        y: Option<&Data>,
    ) -> anyhow::Result<(Array1<f64>, Array1<f64>)> {
        let truth = y
            .and_then(Data::as_vector)
            .ok_or_else(|| anyhow!("{self:?} requires 1-D labels"))?;
        if !estimator.capabilities().predict {
            bail!("{self:?} requires predict, {estimator:?} does not declare it");
        }
        let pred = match estimator.predict(x)? {
            Data::Vector(v) => v,
            _ => bail!("{self:?} requires 1-D predictions"),
        };
        if pred.len() != truth.len() {
            bail!(
                "prediction length {} does not match label length {}",
                pred.len(),
                truth.len()
            );
        }
        if truth.is_empty() {
            bail!("cannot score an empty test set");
        }
        Ok((truth.clone(), pred))
    }
}

fn sum_squared_error(truth: &Array1<f64>, pred: &Array1<f64>) -> f64 {
    truth.iter().zip(pred).map(|(t, p)| (t - p).powi(2)).sum()
}

impl Scorer for Metric {
    #[allow(clippy::cast_precision_loss)]
    fn score(&self, estimator: &dyn Estimator, x: &Data, y: Option<&Data>) -> anyhow::Result<f64> {
        match self {
            Self::Estimator => {
                if !estimator.capabilities().score {
                    bail!("{estimator:?} does not declare score");
                }
                estimator.score(x, y)
            }
            Self::NegMeanSquaredError => {
                let (truth, pred) = self.paired(estimator, x, y)?;
                Ok(-sum_squared_error(&truth, &pred) / truth.len() as f64)
            }
            Self::R2 => {
                let (truth, pred) = self.paired(estimator, x, y)?;
                let sse = sum_squared_error(&truth, &pred);
                let mean = truth.sum() / truth.len() as f64;
                let sst: f64 = truth.iter().map(|t| (t - mean).powi(2)).sum();
                if sst == 0.0 {
                    // constant target: perfect or nothing
                    return Ok(if sse == 0.0 { 1.0 } else { 0.0 });
                }
                Ok(1.0 - sse / sst)
            }
            Self::Accuracy => {
                let (truth, pred) = self.paired(estimator, x, y)?;
                let hits = truth.iter().zip(&pred).filter(|(t, p)| t == p).count();
                Ok(hits as f64 / truth.len() as f64)
            }
        }
    }
}
