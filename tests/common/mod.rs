//! Toy models shared by the integration tests

#![allow(dead_code)]

use anyhow::{anyhow, bail};
use ndarray::{Array1, Array2};
use std::io;
use std::sync::{Arc, Mutex};
use trueno_cv::data::{Data, Dataset};
use trueno_cv::estimator::{Capabilities, Estimator, FitOptions};
use trueno_cv::params::{ParamValue, Params};

/// `n` samples: `x = [i]`, `y = 2i`.
pub fn linear_dataset(n: usize) -> Dataset {
    let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
    let y = Array1::from_shape_fn(n, |i| 2.0 * i as f64);
    Dataset::new(x).with_labels(y)
}

/// Predicts the (optionally `sample_weight`-weighted) mean of the training
/// labels plus `offset`.
///
/// Fit fails when `poison` appears in the first feature column of the
/// training rows.
#[derive(Debug, Clone, Default)]
pub struct MeanRegressor {
    pub offset: f64,
    pub poison: Option<f64>,
    pub mean: Option<f64>,
    pub saw_weights: bool,
}

impl MeanRegressor {
    pub fn boxed() -> Box<dyn Estimator> {
        Box::new(Self::default())
    }
}

impl Estimator for MeanRegressor {
    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
        for (name, value) in params.iter() {
            match name {
                "offset" => {
                    self.offset = value
                        .as_f64()
                        .ok_or_else(|| anyhow!("offset must be numeric, got {value}"))?;
                }
                "poison" => self.poison = value.as_f64(),
                _ => bail!("Invalid parameter {name} for MeanRegressor"),
            }
        }
        Ok(())
    }

    fn get_params(&self) -> Params {
        let mut params = Params::new().with("offset", self.offset);
        if let Some(p) = self.poison {
            params.insert("poison", p);
        }
        params
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_predict()
    }

    fn fit(&mut self, x: &Data, y: Option<&Data>, options: &FitOptions) -> anyhow::Result<()> {
        if let (Some(poison), Some(xs)) = (self.poison, x.as_dense()) {
            if xs.column(0).iter().any(|&v| v == poison) {
                bail!("poisoned training row {poison}");
            }
        }
        let y = y
            .and_then(Data::as_vector)
            .ok_or_else(|| anyhow!("MeanRegressor needs 1-D labels"))?;
        let mean = match options.get("sample_weight").and_then(Data::as_vector) {
            Some(w) => {
                if w.len() != y.len() {
                    bail!("sample_weight has {} rows, labels have {}", w.len(), y.len());
                }
                self.saw_weights = true;
                y.iter().zip(w).map(|(v, w)| v * w).sum::<f64>() / w.sum()
            }
            None => y.mean().ok_or_else(|| anyhow!("empty training set"))?,
        };
        self.mean = Some(mean);
        Ok(())
    }

    fn predict(&self, x: &Data) -> anyhow::Result<Data> {
        let mean = self.mean.ok_or_else(|| anyhow!("not fitted"))?;
        let n = x.n_rows().ok_or_else(|| anyhow!("cannot predict on a scalar"))?;
        Ok(Data::Vector(Array1::from_elem(n, mean + self.offset)))
    }
}

/// Multiplies features by `factor`; counts its fits in a shared counter.
#[derive(Debug, Clone)]
pub struct Scaler {
    pub factor: f64,
    pub fits: Arc<Mutex<usize>>,
}

impl Scaler {
    pub fn new(factor: f64) -> Self {
        Self {
            factor,
            fits: Arc::new(Mutex::new(0)),
        }
    }
}

impl Estimator for Scaler {
    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
        for (name, value) in params.iter() {
            match (name, value) {
                ("factor", v) => {
                    self.factor = v.as_f64().ok_or_else(|| anyhow!("factor must be numeric"))?;
                }
                _ => bail!("Invalid parameter {name} for Scaler"),
            }
        }
        Ok(())
    }

    fn get_params(&self) -> Params {
        Params::new().with("factor", ParamValue::Float(self.factor))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_transform()
    }

    fn fit(&mut self, _x: &Data, _y: Option<&Data>, _o: &FitOptions) -> anyhow::Result<()> {
        if let Ok(mut fits) = self.fits.lock() {
            *fits += 1;
        }
        Ok(())
    }

    fn transform(&self, x: &Data) -> anyhow::Result<Data> {
        Ok(x.scaled(self.factor))
    }
}

/// Always fails to fit.
#[derive(Debug, Clone, Default)]
pub struct Broken;

impl Estimator for Broken {
    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn set_params(&mut self, _params: &Params) -> anyhow::Result<()> {
        Ok(())
    }

    fn fit(&mut self, _x: &Data, _y: Option<&Data>, _o: &FitOptions) -> anyhow::Result<()> {
        bail!("singular matrix")
    }
}

/// In-memory sink for `tracing_subscriber::fmt` output.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        self.0
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default()
    }

    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let sink = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut inner) = self.0.lock() {
            inner.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
