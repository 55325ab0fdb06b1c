//! # Trueno-CV: Memoizing Cross-Validation Evaluation
//!
//! **Version**: 0.1.0
//!
//! Trueno-CV evaluates many candidate model configurations against many
//! cross-validation folds. Identical (fold, subset) extractions requested by
//! different candidates are computed once and shared, and a model that fails
//! to fit on one fold is recorded as a failure instead of aborting the search.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Muda elimination**: fold subsets are memoized per `(fold, slot)`
//! - **Jidoka**: a fit fault stops only its own unit of work (`FIT_FAILURE`)
//! - **Poka-Yoke**: one named critical section guards every parameter mutation
//! - **Genchi Genbutsu**: failures stay visible in the result table, penalized
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use trueno_cv::data::Dataset;
//! use trueno_cv::estimator::{Estimator, Metric};
//! use trueno_cv::folds::KFold;
//! use trueno_cv::params::Params;
//! use trueno_cv::search::{CvSearch, SearchConfig};
//!
//! # fn model() -> Box<dyn Estimator> { unimplemented!() }
//! # let x = ndarray::Array2::<f64>::zeros((10, 2));
//! # let y = ndarray::Array1::<f64>::zeros(10);
//! let dataset = Dataset::new(x).with_labels(y);
//! let candidates = vec![Params::new().with("alpha", 0.1), Params::new().with("alpha", 1.0)];
//! let config = SearchConfig::builder().error_score(0.0).build();
//!
//! let search = CvSearch::new(model(), &candidates, Metric::R2, config)?;
//! let result = search.fit(&dataset, &KFold::new(3))?;
//! println!("best: {:?}", result.best_params);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod cache;
pub mod composite;
pub mod data;
pub mod error;
pub mod estimator;
pub mod eval;
pub mod folds;
pub mod params;
pub mod results;
pub mod search;
pub mod sentinel;

pub use error::{Error, Result};
pub use sentinel::Value;
