//! Parameter overlays and parameter application
//!
//! A candidate is stored compressed as a shared field list plus one value
//! per field, where a value may be `MISSING`. Decompression drops the
//! `MISSING` entries and yields a sparse [`Params`] mapping meaning
//! "override these, leave everything else at its default".
//!
//! ## Serialized mutation
//!
//! Model `set_params` routines are not assumed to be reentrant, so every
//! in-place parameter application in the process runs inside one critical
//! section, [`with_param_lock`]. Cloning happens outside the lock; the
//! clone is the isolation boundary between concurrent evaluations.

use crate::estimator::Estimator;
use crate::sentinel::Value;
use crate::{Error, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// A single hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Categorical / string
    Str(String),
}

impl ParamValue {
    /// Numeric view (ints widen to float).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(_) | Self::Str(_) => None,
        }
    }

    /// Integer view.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String view.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => v.fmt(f),
            Self::Int(v) => v.fmt(f),
            Self::Float(v) => v.fmt(f),
            Self::Str(s) => s.fmt(f),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Sparse, insertion-ordered parameter mapping.
///
/// Serializes as a JSON object with keys in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    /// Empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a parameter, keeping its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Look up a parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Parameters in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parameter names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is overridden.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split `"<prefix>__<rest>"` names: returns the sub-mapping addressed
    /// to `prefix` (with the prefix stripped).
    #[must_use]
    pub fn nested(&self, prefix: &str) -> Self {
        let entries = self
            .entries
            .iter()
            .filter_map(|(k, v)| {
                k.split_once("__")
                    .filter(|(head, _)| *head == prefix)
                    .map(|(_, rest)| (rest.to_string(), v.clone()))
            })
            .collect();
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ParamsVisitor;

        impl<'de> Visitor<'de> for ParamsVisitor {
            type Value = Params;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of parameter names to values")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Params, A::Error> {
                let mut params = Params::new();
                while let Some((k, v)) = access.next_entry::<String, ParamValue>()? {
                    params.insert(k, v);
                }
                Ok(params)
            }
        }

        deserializer.deserialize_map(ParamsVisitor)
    }
}

/// One candidate in compressed form: shared field names plus one
/// (possibly `MISSING`) value per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterOverlay {
    fields: Vec<String>,
    values: Vec<Value<ParamValue>>,
}

impl ParameterOverlay {
    /// Pair field names with values.
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if the lengths differ.
    pub fn new(fields: Vec<String>, values: Vec<Value<ParamValue>>) -> Result<Self> {
        if fields.len() != values.len() {
            return Err(Error::InvalidInput(format!(
                "overlay has {} fields but {} values",
                fields.len(),
                values.len()
            )));
        }
        Ok(Self { fields, values })
    }

    /// Overlay with every field concrete.
    #[must_use]
    pub fn from_params(params: &Params) -> Self {
        let (fields, values) = params
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Concrete(v.clone())))
            .unzip();
        Self { fields, values }
    }

    /// Field names.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Raw values, sentinels included.
    #[must_use]
    pub fn values(&self) -> &[Value<ParamValue>] {
        &self.values
    }

    /// Sparse mapping with `MISSING` entries dropped.
    #[must_use]
    pub fn decompress(&self) -> Params {
        self.fields
            .iter()
            .zip(&self.values)
            .filter_map(|(k, v)| v.as_concrete().map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

/// Decompress many candidates sharing one field list.
///
/// # Errors
/// Returns [`Error::InvalidInput`] if a candidate's length differs from
/// the field list.
pub fn decompress_params(
    fields: &[String],
    candidates: &[Vec<Value<ParamValue>>],
) -> Result<Vec<Params>> {
    candidates
        .iter()
        .map(|values| {
            ParameterOverlay::new(fields.to_vec(), values.clone()).map(|o| o.decompress())
        })
        .collect()
}

static SET_PARAMS_LOCK: Mutex<()> = Mutex::new(());

/// Run `f` inside the process-wide parameter-mutation critical section.
///
/// A panic inside a previous holder does not poison the section.
pub fn with_param_lock<R>(f: impl FnOnce() -> R) -> R {
    let _guard = SET_PARAMS_LOCK
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    f()
}

/// Apply `params` to `estimator` in place, inside the critical section.
///
/// An empty mapping leaves the estimator untouched without locking.
///
/// # Errors
/// Whatever the estimator's `set_params` reports.
pub fn set_params_in_place(estimator: &mut dyn Estimator, params: &Params) -> anyhow::Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    with_param_lock(|| estimator.set_params(params))
}

/// Clone `template` and apply the decompressed `overlay` to the clone.
///
/// The template is never mutated.
///
/// # Errors
/// Whatever the estimator's `set_params` reports.
pub fn set_params(
    template: &dyn Estimator,
    overlay: Option<&ParameterOverlay>,
) -> anyhow::Result<Box<dyn Estimator>> {
    let mut estimator = template.clone_box();
    if let Some(overlay) = overlay {
        set_params_in_place(estimator.as_mut(), &overlay.decompress())?;
    }
    Ok(estimator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::estimator::FitOptions;
    use anyhow::bail;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Clone, Default)]
    struct Knob {
        depth: i64,
        label: String,
    }

    impl Estimator for Knob {
        fn clone_box(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }

        fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
            for (name, value) in params.iter() {
                match (name, value) {
                    ("depth", ParamValue::Int(d)) => self.depth = *d,
                    ("label", ParamValue::Str(s)) => self.label.clone_from(s),
                    _ => bail!("invalid parameter {name}={value}"),
                }
            }
            Ok(())
        }

        fn get_params(&self) -> Params {
            Params::new()
                .with("depth", self.depth)
                .with("label", self.label.as_str())
        }

        fn fit(&mut self, _x: &Data, _y: Option<&Data>, _o: &FitOptions) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn overlay() -> ParameterOverlay {
        ParameterOverlay::new(
            vec!["depth".to_string(), "label".to_string()],
            vec![Value::Concrete(ParamValue::Int(4)), Value::Missing],
        )
        .unwrap()
    }

    #[test]
    fn test_decompress_drops_missing() {
        let params = overlay().decompress();
        assert_eq!(params.len(), 1);
        assert_eq!(params.get("depth"), Some(&ParamValue::Int(4)));
        assert!(params.get("label").is_none());
    }

    #[test]
    fn test_decompress_params_many() {
        let fields = vec!["a".to_string(), "b".to_string()];
        let all = decompress_params(
            &fields,
            &[
                vec![Value::Concrete(1.into()), Value::Missing],
                vec![Value::Missing, Value::Concrete("x".into())],
            ],
        )
        .unwrap();
        assert_eq!(all[0], Params::new().with("a", 1));
        assert_eq!(all[1], Params::new().with("b", "x"));
    }

    #[test]
    fn test_overlay_length_mismatch() {
        assert!(ParameterOverlay::new(vec!["a".to_string()], vec![]).is_err());
    }

    #[test]
    fn test_set_params_clones_template() {
        let template = Knob {
            depth: 1,
            label: "base".to_string(),
        };
        let applied = set_params(&template, Some(&overlay())).unwrap();

        assert_eq!(template.depth, 1);
        let params = applied.get_params();
        assert_eq!(params.get("depth"), Some(&ParamValue::Int(4)));
        assert_eq!(params.get("label"), Some(&ParamValue::Str("base".to_string())));
    }

    #[test]
    fn test_set_params_without_overlay_is_plain_clone() {
        let template = Knob::default();
        let applied = set_params(&template, None).unwrap();
        assert_eq!(applied.get_params(), template.get_params());
    }

    #[test]
    fn test_set_params_reports_invalid_value() {
        let bad = ParameterOverlay::from_params(&Params::new().with("depth", "deep"));
        let err = set_params(&Knob::default(), Some(&bad)).unwrap_err();
        assert!(err.to_string().contains("invalid parameter depth=deep"));
    }

    #[test]
    fn test_param_lock_survives_panic() {
        let result = std::panic::catch_unwind(|| with_param_lock(|| panic!("boom")));
        assert!(result.is_err());
        assert_eq!(with_param_lock(|| 7), 7);
    }

    static INSIDE: AtomicBool = AtomicBool::new(false);
    static OVERLAPS: AtomicUsize = AtomicUsize::new(0);
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    /// Records any `set_params` call that starts while another is running.
    #[derive(Debug, Clone, Default)]
    struct Exclusive;

    impl Estimator for Exclusive {
        fn clone_box(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }

        fn set_params(&mut self, _params: &Params) -> anyhow::Result<()> {
            if INSIDE.swap(true, Ordering::SeqCst) {
                OVERLAPS.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(std::time::Duration::from_micros(50));
            CALLS.fetch_add(1, Ordering::SeqCst);
            INSIDE.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn fit(&mut self, _x: &Data, _y: Option<&Data>, _o: &FitOptions) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_set_params_never_overlap() {
        let overlay = ParameterOverlay::from_params(&Params::new().with("depth", 3));
        let template = Exclusive;

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..20 {
                        set_params(&template, Some(&overlay)).unwrap();
                    }
                });
            }
        });

        assert_eq!(CALLS.load(Ordering::SeqCst), 160);
        assert_eq!(OVERLAPS.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_params_serialize_in_order() {
        let params = Params::new().with("z", 1).with("a", 2.5).with("flag", true);
        let json = serde_json::to_string(&params).unwrap();
        assert_eq!(json, r#"{"z":1,"a":2.5,"flag":true}"#);

        let back: Params = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_nested_params() {
        let params = Params::new()
            .with("scale__factor", 2.0)
            .with("model__alpha", 0.1)
            .with("scale__with_mean", false);
        let scale = params.nested("scale");
        assert_eq!(scale.len(), 2);
        assert_eq!(scale.get("factor"), Some(&ParamValue::Float(2.0)));
        assert!(params.nested("missing").is_empty());
    }
}
