//! Grid search over a two-step pipeline
//!
//! Run with: RUST_LOG=info cargo run --example grid_search

use anyhow::{anyhow, bail};
use ndarray::{Array1, Array2, Axis};
use trueno_cv::composite::Pipeline;
use trueno_cv::data::{Data, Dataset};
use trueno_cv::estimator::{Capabilities, Estimator, FitOptions, Metric};
use trueno_cv::folds::KFold;
use trueno_cv::params::{ParamValue, Params};
use trueno_cv::results::Column;
use trueno_cv::search::{parameter_grid, CvSearch, SearchConfig};
use tracing_subscriber::EnvFilter;

/// Centers each column, optionally dividing by its standard deviation.
#[derive(Debug, Clone, Default)]
struct Standardize {
    with_std: bool,
    mean: Option<Array1<f64>>,
    scale: Option<Array1<f64>>,
}

impl Estimator for Standardize {
    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
        for (name, value) in params.iter() {
            match name {
                "with_std" => {
                    self.with_std = value
                        .as_bool()
                        .ok_or_else(|| anyhow!("with_std must be a bool, got {value}"))?;
                }
                _ => bail!("Invalid parameter {name} for Standardize"),
            }
        }
        Ok(())
    }

    fn get_params(&self) -> Params {
        Params::new().with("with_std", self.with_std)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_transform()
    }

    fn fit(&mut self, x: &Data, _y: Option<&Data>, _options: &FitOptions) -> anyhow::Result<()> {
        let x = x.as_dense().ok_or_else(|| anyhow!("Standardize needs dense input"))?;
        let mean = x
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow!("cannot standardize an empty matrix"))?;
        let std = x.std_axis(Axis(0), 0.0).mapv(|s| if s == 0.0 { 1.0 } else { s });
        self.mean = Some(mean);
        self.scale = Some(std);
        Ok(())
    }

    fn transform(&self, x: &Data) -> anyhow::Result<Data> {
        let x = x.as_dense().ok_or_else(|| anyhow!("Standardize needs dense input"))?;
        let (Some(mean), Some(scale)) = (&self.mean, &self.scale) else {
            bail!("Standardize is not fitted");
        };
        let centered = x - mean;
        Ok(Data::Dense(if self.with_std { centered / scale } else { centered }))
    }
}

/// Single-feature ridge regression.
#[derive(Debug, Clone, Default)]
struct Ridge {
    alpha: f64,
    coef: f64,
    intercept: f64,
}

impl Estimator for Ridge {
    fn clone_box(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn set_params(&mut self, params: &Params) -> anyhow::Result<()> {
        for (name, value) in params.iter() {
            match name {
                "alpha" => {
                    self.alpha = value
                        .as_f64()
                        .filter(|a| *a >= 0.0)
                        .ok_or_else(|| anyhow!("alpha must be non-negative, got {value}"))?;
                }
                _ => bail!("Invalid parameter {name} for Ridge"),
            }
        }
        Ok(())
    }

    fn get_params(&self) -> Params {
        Params::new().with("alpha", self.alpha)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::none().with_predict()
    }

    fn fit(&mut self, x: &Data, y: Option<&Data>, _options: &FitOptions) -> anyhow::Result<()> {
        let x = x.as_dense().ok_or_else(|| anyhow!("Ridge needs dense input"))?.column(0);
        let y = y.and_then(Data::as_vector).ok_or_else(|| anyhow!("Ridge needs labels"))?;
        let (Some(x_mean), Some(y_mean)) = (x.mean(), y.mean()) else {
            bail!("cannot fit on zero samples");
        };
        let sxy: f64 = x.iter().zip(y).map(|(a, b)| (a - x_mean) * (b - y_mean)).sum();
        let sxx: f64 = x.iter().map(|a| (a - x_mean).powi(2)).sum();
        if sxx + self.alpha == 0.0 {
            bail!("singular system: constant feature and alpha=0");
        }
        self.coef = sxy / (sxx + self.alpha);
        self.intercept = y_mean - self.coef * x_mean;
        Ok(())
    }

    fn predict(&self, x: &Data) -> anyhow::Result<Data> {
        let x = x.as_dense().ok_or_else(|| anyhow!("Ridge needs dense input"))?;
        Ok(Data::Vector(x.column(0).mapv(|v| self.coef * v + self.intercept)))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("Trueno-CV grid search demo\n");

    // y = 3x + 1 with a deterministic wobble
    let n = 60;
    #[allow(clippy::cast_precision_loss)]
    let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64 / 10.0);
    #[allow(clippy::cast_precision_loss)]
    let y = Array1::from_shape_fn(n, |i| {
        let wobble = ((i * 7) % 5) as f64 * 0.1;
        3.0 * (i as f64 / 10.0) + 1.0 + wobble
    });
    let dataset = Dataset::new(x).with_labels(y);

    let pipeline = Pipeline::from_estimators([
        ("scale", Box::new(Standardize::default()) as Box<dyn Estimator>),
        ("ridge", Box::new(Ridge::default())),
    ])?;

    let candidates = parameter_grid(&[
        (
            "scale__with_std".to_string(),
            vec![ParamValue::Bool(false), ParamValue::Bool(true)],
        ),
        (
            "ridge__alpha".to_string(),
            vec![ParamValue::Float(0.0), ParamValue::Float(10.0), ParamValue::Float(1000.0)],
        ),
    ]);

    let config = SearchConfig::builder().return_train_score(true).build();
    let search = CvSearch::new(Box::new(pipeline), &candidates, Metric::R2, config)?;
    let result = search.fit(&dataset, &KFold::new(5).shuffled(42))?;
    let table = &result.table;

    println!("{:<40} {:>10} {:>10} {:>5}", "params", "mean", "std", "rank");
    for (i, params) in table.params().iter().enumerate() {
        println!(
            "{:<40} {:>10.4} {:>10.4} {:>5}",
            serde_json::to_string(params)?,
            table.test().mean[i],
            table.test().std[i],
            table.rank()[i]
        );
    }

    println!("\nColumns:");
    for name in table.column_names() {
        let kind = match table.column(&name) {
            Some(Column::Scores(_)) => "scores",
            Some(Column::Ranks(_)) => "ranks",
            Some(Column::Params(_)) => "params",
            None => "?",
        };
        println!("  {name:<24} {kind}");
    }

    println!(
        "\nBest candidate #{}: {}",
        result.best_index,
        serde_json::to_string(&result.best_params)?
    );

    let path = std::env::temp_dir().join("trueno-cv-grid-search.parquet");
    table.write_parquet(&path)?;
    println!("Results written to {}", path.display());

    Ok(())
}
