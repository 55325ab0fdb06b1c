//! Sentinel values: `MISSING` and `FIT_FAILURE`
//!
//! Both sentinels are variants of one closed enum instead of ambient
//! singleton objects. Identity checks are pattern matches, so every copy,
//! clone or deserialized value of a sentinel *is* the sentinel.
//!
//! Each sentinel normalizes to a fixed token ([`MISSING_TOKEN`],
//! [`FAILURE_TOKEN`]) usable as a cache or graph key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Token of the `MISSING` sentinel (absent parameter).
pub const MISSING_TOKEN: &str = "MISSING";

/// Token of the `FIT_FAILURE` sentinel (suppressed fit fault).
pub const FAILURE_TOKEN: &str = "FIT_FAILURE";

/// A value that may be one of the two sentinels.
///
/// Serializes `Missing` as `"MISSING"` and `Failure` as `"FIT_FAILURE"`;
/// deserializing either token always yields the canonical variant.
///
/// ```rust
/// use trueno_cv::sentinel::Value;
///
/// let v: Value<f64> = serde_json::from_str("\"FIT_FAILURE\"").unwrap();
/// assert!(v.is_failure());
/// assert_eq!(v.token(), Some("FIT_FAILURE"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value<T> {
    /// A real computed or supplied value
    #[serde(rename = "value")]
    Concrete(T),
    /// No explicit override: leave the field at its default
    #[serde(rename = "MISSING")]
    Missing,
    /// Output of a step whose fit raised and was suppressed
    #[serde(rename = "FIT_FAILURE")]
    Failure,
}

impl<T> Value<T> {
    /// O(1) check for the `MISSING` sentinel.
    #[must_use]
    pub const fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// O(1) check for the `FIT_FAILURE` sentinel.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }

    /// The sentinel's stable token, `None` for concrete values.
    #[must_use]
    pub const fn token(&self) -> Option<&'static str> {
        match self {
            Self::Concrete(_) => None,
            Self::Missing => Some(MISSING_TOKEN),
            Self::Failure => Some(FAILURE_TOKEN),
        }
    }

    /// Borrow the concrete value.
    #[must_use]
    pub const fn as_concrete(&self) -> Option<&T> {
        match self {
            Self::Concrete(v) => Some(v),
            _ => None,
        }
    }

    /// Take the concrete value.
    #[must_use]
    pub fn into_concrete(self) -> Option<T> {
        match self {
            Self::Concrete(v) => Some(v),
            _ => None,
        }
    }

    /// Borrowing view, keeping sentinels in place.
    #[must_use]
    pub const fn as_ref(&self) -> Value<&T> {
        match self {
            Self::Concrete(v) => Value::Concrete(v),
            Self::Missing => Value::Missing,
            Self::Failure => Value::Failure,
        }
    }

    /// Map the concrete value; sentinels pass through unchanged.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Value<U> {
        match self {
            Self::Concrete(v) => Value::Concrete(f(v)),
            Self::Missing => Value::Missing,
            Self::Failure => Value::Failure,
        }
    }
}

impl<T> From<T> for Value<T> {
    fn from(value: T) -> Self {
        Self::Concrete(value)
    }
}

impl<T: fmt::Display> fmt::Display for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Concrete(v) => v.fmt(f),
            Self::Missing => f.write_str(MISSING_TOKEN),
            Self::Failure => f.write_str(FAILURE_TOKEN),
        }
    }
}

/// True if any element is the `FIT_FAILURE` sentinel.
pub fn any_failure<'a, T: 'a>(values: impl IntoIterator<Item = &'a Value<T>>) -> bool {
    values.into_iter().any(Value::is_failure)
}
