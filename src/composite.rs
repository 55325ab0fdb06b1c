//! Composite models: sequential pipelines and parallel feature unions
//!
//! A scheduler that evaluates the steps of a composite separately (so that
//! shared prefixes are fitted once) puts the fitted pieces back together
//! with [`rebuild_pipeline`], [`rebuild_feature_union`] and
//! [`concatenate_branches`]. All three short-circuit to `FIT_FAILURE` when
//! any piece failed: there are no partial composites.
//!
//! In step/branch result lists, `MISSING` stands for an absent step
//! (pipeline passthrough, or a dropped union branch).
//!
//! Both composites are themselves [`Estimator`]s. Parameters are routed to
//! their children by `"<name>__<param>"`.

use crate::data::{CsrMatrix, Data};
use crate::estimator::{fit_then_transform, Capabilities, Estimator, FitOptions};
use crate::eval::{DataValue, EstimatorValue};
use crate::params::Params;
use crate::sentinel::{any_failure, Value};
use crate::{Error, Result};
use anyhow::{anyhow, bail};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use std::collections::HashSet;
use std::sync::Arc;

/// A named child of a composite; `None` is an absent step.
pub type Step = (String, Option<Box<dyn Estimator>>);

fn validate_names(kind: &str, names: impl Iterator<Item = impl AsRef<str>>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        let name = name.as_ref();
        if name.is_empty() || name.contains("__") {
            return Err(Error::InvalidInput(format!(
                "{kind} step name {name:?} must be non-empty and must not contain '__'"
            )));
        }
        if !seen.insert(name.to_string()) {
            return Err(Error::InvalidInput(format!(
                "{kind} step names must be unique, {name:?} repeats"
            )));
        }
    }
    Ok(())
}

/// Route `"<name>__<param>"` entries to the children, rejecting anything
/// that addresses no child.
fn route_params(steps: &mut [Step], params: &Params) -> anyhow::Result<()> {
    for (name, value) in params.iter() {
        let owner = name
            .split_once("__")
            .and_then(|(head, _)| steps.iter().position(|(n, _)| n == head));
        if owner.is_none() {
            bail!("invalid parameter {name}={value}: no step addressed");
        }
    }
    for (step_name, step) in steps.iter_mut() {
        let nested = params.nested(step_name);
        if nested.is_empty() {
            continue;
        }
        match step {
            Some(est) => est.set_params(&nested)?,
            None => bail!("cannot set parameters on absent step {step_name:?}"),
        }
    }
    Ok(())
}

fn collect_params(steps: &[Step]) -> Params {
    let mut out = Params::new();
    for (step_name, step) in steps {
        if let Some(est) = step {
            for (name, value) in est.get_params().iter() {
                out.insert(format!("{step_name}__{name}"), value.clone());
            }
        }
    }
    out
}

/// Ordered steps; each transform output feeds the next step, the last
/// step is the one predicted with and scored.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    /// Build from named steps.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] for an empty pipeline or bad/duplicate names.
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::InvalidInput("pipeline needs at least one step".to_string()));
        }
        validate_names("pipeline", steps.iter().map(|(n, _)| n))?;
        Ok(Self { steps })
    }

    /// Build from named, all-present steps.
    ///
    /// # Errors
    /// See [`Pipeline::new`].
    pub fn from_estimators<S: Into<String>>(
        steps: impl IntoIterator<Item = (S, Box<dyn Estimator>)>,
    ) -> Result<Self> {
        Self::new(steps.into_iter().map(|(n, e)| (n.into(), Some(e))).collect())
    }

    /// The steps in order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Step names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|(n, _)| n.as_str())
    }

    /// Look up a step by name (`None` if unknown or absent).
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&dyn Estimator> {
        self.steps
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, e)| e.as_deref())
    }

    fn head(&self) -> &[Step] {
        match self.steps.split_last() {
            Some((_, head)) => head,
            None => &[],
        }
    }

    fn last(&self) -> Option<&dyn Estimator> {
        self.steps.last().and_then(|(_, est)| est.as_deref())
    }

    /// Run `x` through every step but the last.
    fn transform_head(&self, x: &Data) -> anyhow::Result<Data> {
        let mut xt = x.clone();
        for est in self.head().iter().filter_map(|(_, est)| est.as_deref()) {
            if !est.capabilities().transform {
                bail!("{est:?} does not declare transform");
            }
            xt = est.transform(&xt)?;
        }
        Ok(xt)
    }
}

impl Estimator for Pipeline {
    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
        route_params(&mut self.steps, params)
    }

    fn get_params(&self) -> Params {
        collect_params(&self.steps)
    }

    fn capabilities(&self) -> Capabilities {
        self.last().map_or_else(
            || Capabilities::none().with_transform(),
            |est| {
                let caps = est.capabilities();
                Capabilities {
                    fit_transform: false,
                    ..caps
                }
            },
        )
    }

    fn fit(&mut self, x: &Data, y: Option<&Data>, options: &FitOptions) -> anyhow::Result<()> {
        let n = self.steps.len();
        let mut xt = x.clone();
        for (i, (name, step)) in self.steps.iter_mut().enumerate() {
            let Some(est) = step else { continue };
            if i + 1 == n {
                est.fit(&xt, y, options)
                    .map_err(|e| e.context(format!("pipeline step {name:?}")))?;
            } else {
                xt = fit_then_transform(est.as_mut(), &xt, y, options)
                    .map_err(|e| e.context(format!("pipeline step {name:?}")))?;
            }
        }
        Ok(())
    }

    fn transform(&self, x: &Data) -> anyhow::Result<Data> {
        let xt = self.transform_head(x)?;
        match self.last() {
            Some(last) => last.transform(&xt),
            None => Ok(xt),
        }
    }

    fn predict(&self, x: &Data) -> anyhow::Result<Data> {
        let xt = self.transform_head(x)?;
        match self.last() {
            Some(last) => last.predict(&xt),
            None => bail!("pipeline ends in an absent step and cannot predict"),
        }
    }

    fn score(&self, x: &Data, y: Option<&Data>) -> anyhow::Result<f64> {
        let xt = self.transform_head(x)?;
        match self.last() {
            Some(last) => last.score(&xt, y),
            None => bail!("pipeline ends in an absent step and cannot score"),
        }
    }
}

/// Branches run independently on the same input; their outputs are
/// optionally weighted and concatenated along the feature axis.
#[derive(Debug, Clone)]
pub struct FeatureUnion {
    branches: Vec<Step>,
    weights: Vec<Option<f64>>,
}

impl FeatureUnion {
    /// Build from named branches, unweighted.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] for bad or duplicate names.
    pub fn new(branches: Vec<Step>) -> Result<Self> {
        validate_names("feature union", branches.iter().map(|(n, _)| n))?;
        let weights = vec![None; branches.len()];
        Ok(Self { branches, weights })
    }

    /// Build from named, all-present branches.
    ///
    /// # Errors
    /// See [`FeatureUnion::new`].
    pub fn from_estimators<S: Into<String>>(
        branches: impl IntoIterator<Item = (S, Box<dyn Estimator>)>,
    ) -> Result<Self> {
        Self::new(branches.into_iter().map(|(n, e)| (n.into(), Some(e))).collect())
    }

    /// Set the output weight of one branch.
    ///
    /// # Errors
    /// [`Error::InvalidInput`] if no branch has that name.
    pub fn with_weight(mut self, name: &str, weight: f64) -> Result<Self> {
        let idx = self
            .branches
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| Error::InvalidInput(format!("no feature union branch named {name:?}")))?;
        self.weights[idx] = Some(weight);
        Ok(self)
    }

    /// Branches in result order.
    #[must_use]
    pub fn branches(&self) -> &[Step] {
        &self.branches
    }

    /// Per-branch weights, aligned with [`FeatureUnion::branches`].
    #[must_use]
    pub fn weights(&self) -> &[Option<f64>] {
        &self.weights
    }

    fn concat(&self, outputs: Vec<Option<Data>>, n_samples: usize) -> anyhow::Result<Data> {
        let outputs: Vec<DataValue> = outputs
            .into_iter()
            .map(|o| o.map_or(Value::Missing, |d| Value::Concrete(Arc::new(d))))
            .collect();
        let joined = concatenate_branches(&outputs, n_samples, &self.weights)?;
        let joined = joined
            .into_concrete()
            .ok_or_else(|| anyhow!("feature union branch produced FIT_FAILURE"))?;
        Ok(Arc::try_unwrap(joined).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl Estimator for FeatureUnion {
    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
        route_params(&mut self.branches, params)
    }

    fn get_params(&self) -> Params {
        collect_params(&self.branches)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_fit_transform()
    }

    fn fit(&mut self, x: &Data, y: Option<&Data>, options: &FitOptions) -> anyhow::Result<()> {
        for (name, branch) in &mut self.branches {
            if let Some(est) = branch {
                est.fit(x, y, options)
                    .map_err(|e| e.context(format!("feature union branch {name:?}")))?;
            }
        }
        Ok(())
    }

    fn transform(&self, x: &Data) -> anyhow::Result<Data> {
        let n_samples = x.n_rows().unwrap_or(0);
        let outputs = self
            .branches
            .iter()
            .map(|(_, b)| b.as_ref().map(|est| est.transform(x)).transpose())
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.concat(outputs, n_samples)
    }

    fn fit_transform(
        &mut self,
        x: &Data,
        y: Option<&Data>,
        options: &FitOptions,
    ) -> anyhow::Result<Data> {
        let n_samples = x.n_rows().unwrap_or(0);
        let mut outputs = Vec::with_capacity(self.branches.len());
        for (name, branch) in &mut self.branches {
            let out = match branch {
                Some(est) => Some(
                    fit_then_transform(est.as_mut(), x, y, options)
                        .map_err(|e| e.context(format!("feature union branch {name:?}")))?,
                ),
                None => None,
            };
            outputs.push(out);
        }
        self.concat(outputs, n_samples)
    }
}

fn check_lengths(what: &str, names: usize, results: usize) -> Result<()> {
    if names == results {
        Ok(())
    } else {
        Err(Error::inconsistent_length(
            format!("{what} names vs results"),
            vec![names, results],
        ))
    }
}

fn into_steps(names: &[String], results: Vec<EstimatorValue>) -> Vec<Step> {
    names
        .iter()
        .cloned()
        .zip(results.into_iter().map(Value::into_concrete))
        .collect()
}

/// Zip names with fitted steps, or `FIT_FAILURE` if any step failed.
///
/// # Errors
/// [`Error::InconsistentLength`] if names and results differ in length,
/// or the usual [`Pipeline::new`] validation errors.
pub fn rebuild_pipeline(names: &[String], steps: Vec<EstimatorValue>) -> Result<Value<Pipeline>> {
    check_lengths("pipeline", names.len(), steps.len())?;
    if any_failure(&steps) {
        return Ok(Value::Failure);
    }
    Pipeline::new(into_steps(names, steps)).map(Value::Concrete)
}

/// Zip names with fitted branches and weights, or `FIT_FAILURE` if any
/// branch failed.
///
/// # Errors
/// [`Error::InconsistentLength`] if names, results and weights differ in
/// length, or the usual [`FeatureUnion::new`] validation errors.
pub fn rebuild_feature_union(
    names: &[String],
    branches: Vec<EstimatorValue>,
    weights: &[Option<f64>],
) -> Result<Value<FeatureUnion>> {
    check_lengths("feature union", names.len(), branches.len())?;
    check_lengths("feature union weights", names.len(), weights.len())?;
    if any_failure(&branches) {
        return Ok(Value::Failure);
    }
    let mut union = FeatureUnion::new(into_steps(names, branches))?;
    union.weights = weights.to_vec();
    Ok(Value::Concrete(union))
}

/// Weight and concatenate branch outputs along the feature axis.
///
/// - any `FIT_FAILURE` output: the result is `FIT_FAILURE`
/// - `MISSING` outputs (absent branches) are dropped
/// - no surviving branch: an explicit `(n_samples, 0)` dense block
/// - any sparse output: sparse result; all dense: dense result
///
/// `weights` is either empty (no weighting) or aligned with `outputs`.
///
/// # Errors
/// - [`Error::InconsistentLength`] for misaligned weights or branch outputs
///   with different sample counts
/// - [`Error::InvalidInput`] for a branch output without a 2-D shape
pub fn concatenate_branches(
    outputs: &[DataValue],
    n_samples: usize,
    weights: &[Option<f64>],
) -> Result<DataValue> {
    if any_failure(outputs) {
        return Ok(Value::Failure);
    }
    if !weights.is_empty() {
        check_lengths("branch weights", outputs.len(), weights.len())?;
    }

    let mut blocks = Vec::with_capacity(outputs.len());
    for (i, output) in outputs.iter().enumerate() {
        let Value::Concrete(block) = output else { continue };
        if block.shape().is_none() {
            return Err(Error::InvalidInput(format!(
                "feature union branch {i} produced a container without a 2-D shape"
            )));
        }
        match weights.get(i).copied().flatten() {
            Some(w) => blocks.push(Arc::new(block.scaled(w))),
            None => blocks.push(Arc::clone(block)),
        }
    }

    if blocks.is_empty() {
        return Ok(Value::Concrete(Arc::new(Data::Dense(Array2::zeros((n_samples, 0))))));
    }

    let joined = if blocks.iter().any(|b| b.is_sparse()) {
        let sparse: Vec<CsrMatrix> = blocks
            .iter()
            .map(|b| match b.as_ref() {
                Data::Sparse(m) => m.clone(),
                Data::Dense(a) => CsrMatrix::from_dense(a),
                Data::Vector(_) | Data::Scalar(_) => CsrMatrix::zeros((0, 0)),
            })
            .collect();
        Data::Sparse(CsrMatrix::hstack(&sparse)?)
    } else {
        let views: Vec<ArrayView2<'_, f64>> =
            blocks.iter().filter_map(|b| b.as_dense().map(Array2::view)).collect();
        let dense = concatenate(Axis(1), &views).map_err(|_| {
            Error::inconsistent_length(
                "feature union branch outputs",
                views.iter().map(|v| v.nrows()).collect(),
            )
        })?;
        Data::Dense(dense)
    };
    Ok(Value::Concrete(Arc::new(joined)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;
    use ndarray::array;

    /// Multiplies features by `factor`.
    #[derive(Debug, Clone)]
    struct Scale {
        factor: f64,
    }

    impl Estimator for Scale {
        fn clone_box(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }

        fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
            for (name, value) in params.iter() {
                match (name, value.as_f64()) {
                    ("factor", Some(f)) => self.factor = f,
                    _ => bail!("invalid parameter {name}"),
                }
            }
            Ok(())
        }

        fn get_params(&self) -> Params {
            Params::new().with("factor", self.factor)
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::none().with_transform()
        }

        fn fit(&mut self, _x: &Data, _y: Option<&Data>, _o: &FitOptions) -> anyhow::Result<()> {
            Ok(())
        }

        fn transform(&self, x: &Data) -> anyhow::Result<Data> {
            Ok(x.scaled(self.factor))
        }
    }

    fn scale(factor: f64) -> Box<dyn Estimator> {
        Box::new(Scale { factor })
    }

    fn dense(a: Array2<f64>) -> DataValue {
        Value::Concrete(Arc::new(Data::Dense(a)))
    }

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_rebuild_pipeline_ok() {
        let rebuilt = rebuild_pipeline(
            &names(&["a", "b"]),
            vec![Value::Concrete(scale(2.0)), Value::Concrete(scale(3.0))],
        )
        .unwrap();
        let pipe = rebuilt.into_concrete().unwrap();
        assert_eq!(pipe.names().collect::<Vec<_>>(), vec!["a", "b"]);

        let out = pipe.transform(&Data::Dense(array![[1.0]])).unwrap();
        assert_eq!(out, Data::Dense(array![[6.0]]));
    }

    #[test]
    fn test_rebuild_pipeline_failure_short_circuits() {
        let rebuilt = rebuild_pipeline(
            &names(&["a", "b"]),
            vec![Value::Concrete(scale(2.0)), Value::Failure],
        )
        .unwrap();
        assert!(rebuilt.is_failure());
    }

    #[test]
    fn test_rebuild_pipeline_length_mismatch() {
        let err = rebuild_pipeline(&names(&["a"]), vec![]).unwrap_err();
        assert!(matches!(err, Error::InconsistentLength { .. }));
    }

    #[test]
    fn test_rebuild_pipeline_missing_step_is_passthrough() {
        let pipe = rebuild_pipeline(
            &names(&["skip", "b"]),
            vec![Value::Missing, Value::Concrete(scale(3.0))],
        )
        .unwrap()
        .into_concrete()
        .unwrap();
        assert!(pipe.step("skip").is_none());
        let out = pipe.transform(&Data::Dense(array![[1.0]])).unwrap();
        assert_eq!(out, Data::Dense(array![[3.0]]));
    }

    #[test]
    fn test_rebuild_feature_union_failure() {
        let rebuilt = rebuild_feature_union(
            &names(&["a", "b"]),
            vec![Value::Failure, Value::Concrete(scale(1.0))],
            &[None, Some(2.0)],
        )
        .unwrap();
        assert!(rebuilt.is_failure());
    }

    #[test]
    fn test_rebuild_feature_union_keeps_weights() {
        let union = rebuild_feature_union(
            &names(&["a", "b"]),
            vec![Value::Concrete(scale(1.0)), Value::Concrete(scale(1.0))],
            &[None, Some(2.0)],
        )
        .unwrap()
        .into_concrete()
        .unwrap();
        assert_eq!(union.weights(), &[None, Some(2.0)]);

        let out = union.transform(&Data::Dense(array![[1.0], [2.0]])).unwrap();
        assert_eq!(out, Data::Dense(array![[1.0, 2.0], [2.0, 4.0]]));
    }

    #[test]
    fn test_concatenate_failure() {
        let out = concatenate_branches(&[dense(array![[1.0]]), Value::Failure], 1, &[]).unwrap();
        assert!(out.is_failure());
    }

    #[test]
    fn test_concatenate_all_dropped_is_empty_block() {
        let out = concatenate_branches(&[Value::Missing, Value::Missing], 4, &[]).unwrap();
        let out = out.into_concrete().unwrap();
        assert_eq!(out.shape(), Some((4, 0)));
        assert!(!out.is_sparse());
    }

    #[test]
    fn test_concatenate_weight_scales_branch() {
        let out = concatenate_branches(
            &[dense(array![[1.0, 2.0]]), dense(array![[3.0]])],
            1,
            &[Some(2.0), None],
        )
        .unwrap()
        .into_concrete()
        .unwrap();
        assert_eq!(*out, Data::Dense(array![[2.0, 4.0, 3.0]]));
    }

    #[test]
    fn test_concatenate_sparse_wins() {
        let sparse = CsrMatrix::from_dense(&array![[0.0, 1.0], [2.0, 0.0]]);
        let out = concatenate_branches(
            &[Value::Concrete(Arc::new(Data::Sparse(sparse))), dense(array![[5.0], [6.0]])],
            2,
            &[],
        )
        .unwrap()
        .into_concrete()
        .unwrap();
        let Data::Sparse(m) = out.as_ref() else {
            panic!("expected sparse output");
        };
        assert_eq!(m.to_dense(), array![[0.0, 1.0, 5.0], [2.0, 0.0, 6.0]]);
    }

    #[test]
    fn test_concatenate_row_mismatch() {
        let err = concatenate_branches(
            &[dense(Array2::zeros((2, 1))), dense(Array2::zeros((3, 1)))],
            2,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InconsistentLength { .. }));
    }

    #[test]
    fn test_pipeline_param_routing() {
        let mut pipe =
            Pipeline::from_estimators([("scale", scale(1.0)), ("final", scale(1.0))]).unwrap();
        pipe.set_params(&Params::new().with("scale__factor", 4.0)).unwrap();
        assert_eq!(
            pipe.get_params().get("scale__factor"),
            Some(&ParamValue::Float(4.0))
        );

        let err = pipe.set_params(&Params::new().with("nope__factor", 1.0)).unwrap_err();
        assert!(err.to_string().contains("no step addressed"));
        let err = pipe.set_params(&Params::new().with("factor", 1.0)).unwrap_err();
        assert!(err.to_string().contains("no step addressed"));
    }

    #[test]
    fn test_pipeline_rejects_bad_names() {
        assert!(Pipeline::from_estimators([("a__b", scale(1.0))]).is_err());
        assert!(Pipeline::from_estimators([("a", scale(1.0)), ("a", scale(1.0))]).is_err());
        assert!(Pipeline::new(vec![]).is_err());
    }

    #[test]
    fn test_feature_union_fit_transform() {
        let mut union = FeatureUnion::from_estimators([("x1", scale(1.0)), ("x10", scale(10.0))])
            .unwrap()
            .with_weight("x1", 3.0)
            .unwrap();
        let out = union
            .fit_transform(&Data::Dense(array![[1.0]]), None, &FitOptions::new())
            .unwrap();
        assert_eq!(out, Data::Dense(array![[3.0, 10.0]]));
        assert!(union.capabilities().fit_transform);
    }
}
