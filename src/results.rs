//! Result aggregation, ranking and export
//!
//! Per-fold, per-candidate score records are reduced into a [`ResultTable`]:
//! one row per candidate with per-split scores, (weighted) mean, population
//! standard deviation, a min-tie rank, and one masked column per parameter
//! name seen in any candidate.
//!
//! The flat record order is fold-major: record `f * n_candidates + c` is
//! candidate `c` on fold `f`.
//!
//! Toyota Way: Genchi Genbutsu. Failures are not hidden from the table;
//! they are scored with the configured penalty and ranked like any other
//! candidate.

use crate::eval::ScoreRecord;
use crate::params::{ParamValue, Params};
use crate::sentinel::Value;
use crate::{Error, Result};
use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

/// Aggregated scores for one side (test or train).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreColumns {
    /// `splits[k][c]`: score of candidate `c` on split `k`
    pub splits: Vec<Vec<f64>>,
    /// Per-candidate (weighted) mean across splits
    pub mean: Vec<f64>,
    /// Per-candidate (weighted) population standard deviation
    pub std: Vec<f64>,
}

/// One masked parameter column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamColumn {
    /// Parameter name (column is reported as `param_<name>`)
    pub name: String,
    /// One cell per candidate; `None` means masked (not applicable)
    pub cells: Vec<Option<ParamValue>>,
}

/// A named reporting column borrowed from a [`ResultTable`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Column<'a> {
    /// Score-valued column (`mean_test_score`, `split0_train_score`, ...)
    Scores(&'a [f64]),
    /// `rank_test_score`
    Ranks(&'a [usize]),
    /// `param_<name>` with masked cells
    Params(&'a [Option<ParamValue>]),
}

/// Candidate-by-split results, built once and immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    params: Vec<Params>,
    n_splits: usize,
    test: ScoreColumns,
    rank: Vec<usize>,
    train: Option<ScoreColumns>,
    param_columns: Vec<ParamColumn>,
}

impl ResultTable {
    /// Number of candidates (rows).
    #[must_use]
    pub fn n_candidates(&self) -> usize {
        self.params.len()
    }

    /// Number of splits.
    #[must_use]
    pub const fn n_splits(&self) -> usize {
        self.n_splits
    }

    /// Decompressed parameters of every candidate.
    #[must_use]
    pub fn params(&self) -> &[Params] {
        &self.params
    }

    /// Test score columns.
    #[must_use]
    pub const fn test(&self) -> &ScoreColumns {
        &self.test
    }

    /// Train score columns, if train scores were recorded.
    #[must_use]
    pub const fn train(&self) -> Option<&ScoreColumns> {
        self.train.as_ref()
    }

    /// Min-tie rank of every candidate by descending mean test score.
    #[must_use]
    pub fn rank(&self) -> &[usize] {
        &self.rank
    }

    /// Masked parameter columns in first-appearance order.
    #[must_use]
    pub fn param_columns(&self) -> &[ParamColumn] {
        &self.param_columns
    }

    /// First candidate (in original order) holding rank 1.
    #[must_use]
    pub fn best_index(&self) -> Option<usize> {
        self.rank.iter().position(|&r| r == 1)
    }

    /// Every name accepted by [`ResultTable::column`].
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .param_columns
            .iter()
            .map(|c| format!("param_{}", c.name))
            .collect();
        names.extend(score_column_names("test", self.n_splits));
        names.push("rank_test_score".to_string());
        if self.train.is_some() {
            names.extend(score_column_names("train", self.n_splits));
        }
        names
    }

    /// Look up a reporting column by name.
    ///
    /// Known names: `mean_test_score`, `std_test_score`, `rank_test_score`,
    /// `split<k>_test_score`, `param_<name>`, and the `_train_` equivalents
    /// (no train rank).
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Column<'_>> {
        if name == "rank_test_score" {
            return Some(Column::Ranks(&self.rank));
        }
        if let Some(param) = name.strip_prefix("param_") {
            return self
                .param_columns
                .iter()
                .find(|c| c.name == param)
                .map(|c| Column::Params(&c.cells));
        }
        let (head, side) = if let Some(head) = name.strip_suffix("_test_score") {
            (head, Some(&self.test))
        } else if let Some(head) = name.strip_suffix("_train_score") {
            (head, self.train.as_ref())
        } else {
            return None;
        };
        let side = side?;
        match head {
            "mean" => Some(Column::Scores(&side.mean)),
            "std" => Some(Column::Scores(&side.std)),
            _ => head
                .strip_prefix("split")
                .and_then(|k| k.parse::<usize>().ok())
                .and_then(|k| side.splits.get(k))
                .map(|s| Column::Scores(s.as_slice())),
        }
    }

    /// Export as an Arrow record batch.
    ///
    /// Parameter columns are nullable (masked cells are nulls) and typed
    /// from their set cells: all-bool to `Boolean`, all-int to `Int64`,
    /// numeric to `Float64`, anything else to `Utf8`. A `params` column
    /// holds each candidate's parameters as JSON.
    ///
    /// # Errors
    /// [`Error::Arrow`] if the batch cannot be assembled, or
    /// [`Error::Storage`] if a rank does not fit `Int32`.
    pub fn to_record_batch(&self) -> Result<RecordBatch> {
        let mut fields = Vec::new();
        let mut columns: Vec<ArrayRef> = Vec::new();

        for column in &self.param_columns {
            let (data_type, array) = param_array(&column.cells);
            fields.push(Field::new(format!("param_{}", column.name), data_type, true));
            columns.push(array);
        }

        let params_json = self
            .params
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Storage(format!("Failed to encode params: {e}")))?;
        fields.push(Field::new("params", DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(params_json)));

        push_scores(&mut fields, &mut columns, "test", &self.test);

        let ranks = self
            .rank
            .iter()
            .map(|&r| i32::try_from(r))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Storage(format!("Rank does not fit Int32: {e}")))?;
        fields.push(Field::new("rank_test_score", DataType::Int32, false));
        columns.push(Arc::new(Int32Array::from(ranks)));

        if let Some(train) = &self.train {
            push_scores(&mut fields, &mut columns, "train", train);
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }

    /// Persist the table as a single-batch Parquet file.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written.
    pub fn write_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        use parquet::arrow::ArrowWriter;
        use std::fs::File;

        let batch = self.to_record_batch()?;
        let file = File::create(path.as_ref())?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .map_err(|e| Error::Storage(format!("Failed to create Parquet writer: {e}")))?;
        writer
            .write(&batch)
            .map_err(|e| Error::Storage(format!("Failed to write Parquet batch: {e}")))?;
        writer
            .close()
            .map_err(|e| Error::Storage(format!("Failed to finish Parquet file: {e}")))?;
        Ok(())
    }
}

/// Read back every record batch of a Parquet file written by
/// [`ResultTable::write_parquet`].
///
/// # Errors
/// Returns error if the file cannot be read or parsed.
pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<RecordBatch>> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;

    let file = File::open(path.as_ref())?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::Storage(format!("Failed to parse Parquet file: {e}")))?
        .build()
        .map_err(|e| Error::Storage(format!("Failed to create Parquet reader: {e}")))?;
    Ok(reader.collect::<std::result::Result<Vec<_>, _>>()?)
}

fn score_column_names(side: &str, n_splits: usize) -> Vec<String> {
    let mut names: Vec<String> = (0..n_splits)
        .map(|k| format!("split{k}_{side}_score"))
        .collect();
    names.push(format!("mean_{side}_score"));
    names.push(format!("std_{side}_score"));
    names
}

fn push_scores(
    fields: &mut Vec<Field>,
    columns: &mut Vec<ArrayRef>,
    side: &str,
    scores: &ScoreColumns,
) {
    let arrays = scores
        .splits
        .iter()
        .chain([&scores.mean, &scores.std]);
    for (name, values) in score_column_names(side, scores.splits.len()).into_iter().zip(arrays) {
        fields.push(Field::new(name, DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(values.clone())));
    }
}

fn param_array(cells: &[Option<ParamValue>]) -> (DataType, ArrayRef) {
    fn typed<T>(
        cells: &[Option<ParamValue>],
        view: impl Fn(&ParamValue) -> Option<T>,
    ) -> Vec<Option<T>> {
        cells.iter().map(|c| c.as_ref().and_then(&view)).collect()
    }

    let set = || cells.iter().flatten();
    if set().all(|v| matches!(v, ParamValue::Bool(_))) {
        let values = typed(cells, ParamValue::as_bool);
        (DataType::Boolean, Arc::new(BooleanArray::from(values)))
    } else if set().all(|v| matches!(v, ParamValue::Int(_))) {
        let values = typed(cells, ParamValue::as_i64);
        (DataType::Int64, Arc::new(Int64Array::from(values)))
    } else if set().all(|v| v.as_f64().is_some()) {
        let values = typed(cells, ParamValue::as_f64);
        (DataType::Float64, Arc::new(Float64Array::from(values)))
    } else {
        let values = typed(cells, |v| Some(v.to_string()));
        (DataType::Utf8, Arc::new(StringArray::from(values)))
    }
}

/// Weighted mean and population standard deviation of one candidate's
/// per-split scores.
///
/// `weights` of `None` weighs every split equally.
///
/// # Errors
/// [`Error::InvalidInput`] for an empty row, misaligned weights, or
/// weights that do not sum to a positive number.
#[allow(clippy::cast_precision_loss)]
pub fn weighted_mean_std(values: &[f64], weights: Option<&[f64]>) -> Result<(f64, f64)> {
    if values.is_empty() {
        return Err(Error::InvalidInput("cannot average zero splits".to_string()));
    }
    let total = match weights {
        None => values.len() as f64,
        Some(w) if w.len() != values.len() => {
            return Err(Error::inconsistent_length(
                "fold weights vs splits",
                vec![w.len(), values.len()],
            ));
        }
        Some(w) => w.iter().sum(),
    };
    if total <= 0.0 || total.is_nan() {
        return Err(Error::InvalidInput(format!(
            "fold weights must sum to a positive number, got {total}"
        )));
    }
    let weight = |i: usize| weights.map_or(1.0, |w| w[i]);
    let mean = values.iter().enumerate().map(|(i, v)| weight(i) * v).sum::<f64>() / total;
    let var = values
        .iter()
        .enumerate()
        .map(|(i, v)| weight(i) * (v - mean).powi(2))
        .sum::<f64>()
        / total;
    Ok((mean, var.sqrt()))
}

/// Min-tie ranks by descending score: each entry is one plus the number of
/// entries strictly greater. `NaN` sorts below every number.
#[must_use]
pub fn rank_min_descending(scores: &[f64]) -> Vec<usize> {
    let descending = |a: &f64, b: &f64| match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(a).unwrap_or(Ordering::Equal),
    };
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&i, &j| descending(&scores[i], &scores[j]));

    let mut ranks = vec![0; scores.len()];
    for (pos, &idx) in order.iter().enumerate() {
        ranks[idx] = match pos.checked_sub(1).map(|p| order[p]) {
            Some(prev) if descending(&scores[prev], &scores[idx]) == Ordering::Equal => ranks[prev],
            _ => pos + 1,
        };
    }
    ranks
}

fn reduce_side(
    flat: &[f64],
    n_candidates: usize,
    n_splits: usize,
    fold_weights: Option<&[f64]>,
) -> Result<ScoreColumns> {
    let splits: Vec<Vec<f64>> = (0..n_splits)
        .map(|k| flat[k * n_candidates..(k + 1) * n_candidates].to_vec())
        .collect();
    let mut mean = Vec::with_capacity(n_candidates);
    let mut std = Vec::with_capacity(n_candidates);
    for c in 0..n_candidates {
        let row: Vec<f64> = (0..n_splits).map(|k| flat[k * n_candidates + c]).collect();
        let (m, s) = weighted_mean_std(&row, fold_weights)?;
        mean.push(m);
        std.push(s);
    }
    Ok(ScoreColumns { splits, mean, std })
}

fn masked_columns(candidate_params: &[Params]) -> Vec<ParamColumn> {
    let mut columns: Vec<ParamColumn> = Vec::new();
    for (c, params) in candidate_params.iter().enumerate() {
        for (name, value) in params.iter() {
            let idx = match columns.iter().position(|col| col.name == name) {
                Some(idx) => idx,
                None => {
                    columns.push(ParamColumn {
                        name: name.to_string(),
                        cells: vec![None; candidate_params.len()],
                    });
                    columns.len() - 1
                }
            };
            columns[idx].cells[c] = Some(value.clone());
        }
    }
    columns
}

/// Reduce fold-major score records into a ranked [`ResultTable`].
///
/// Every `FIT_FAILURE` (or otherwise non-concrete) score is replaced by
/// `error_score` before averaging. Train columns are produced when every
/// record carries a train score.
///
/// # Errors
/// - [`Error::InconsistentLength`] if `scores.len() != n_splits * candidates`
///   or `fold_weights` is not one weight per split
/// - [`Error::InvalidInput`] for zero splits, records that disagree on
///   carrying a train score, or non-positive total weight
pub fn aggregate_scores(
    scores: &[ScoreRecord],
    candidate_params: &[Params],
    n_splits: usize,
    error_score: f64,
    fold_weights: Option<&[f64]>,
) -> Result<ResultTable> {
    let n_candidates = candidate_params.len();
    if n_splits == 0 {
        return Err(Error::InvalidInput("cannot aggregate zero splits".to_string()));
    }
    if scores.len() != n_splits * n_candidates {
        return Err(Error::inconsistent_length(
            "score records vs splits x candidates",
            vec![scores.len(), n_splits * n_candidates],
        ));
    }
    if let Some(w) = fold_weights {
        if w.len() != n_splits {
            return Err(Error::inconsistent_length(
                "fold weights vs splits",
                vec![w.len(), n_splits],
            ));
        }
    }

    let penalize = |v: Value<f64>| v.into_concrete().unwrap_or(error_score);
    let test_flat: Vec<f64> = scores.iter().map(|r| penalize(r.test)).collect();
    let with_train = scores.iter().filter(|r| r.train.is_some()).count();
    let train_flat: Option<Vec<f64>> = match with_train {
        0 => None,
        n if n == scores.len() => {
            Some(scores.iter().filter_map(|r| r.train.map(penalize)).collect())
        }
        _ => {
            return Err(Error::InvalidInput(
                "either every score record carries a train score or none does".to_string(),
            ))
        }
    };

    let test = reduce_side(&test_flat, n_candidates, n_splits, fold_weights)?;
    let rank = rank_min_descending(&test.mean);
    let train = train_flat
        .map(|flat| reduce_side(&flat, n_candidates, n_splits, fold_weights))
        .transpose()?;

    Ok(ResultTable {
        params: candidate_params.to_vec(),
        n_splits,
        test,
        rank,
        train,
        param_columns: masked_columns(candidate_params),
    })
}

/// The first candidate (in original order) ranked 1, with its parameters.
///
/// # Errors
/// [`Error::InconsistentLength`] if the table was built from a different
/// number of candidates, [`Error::InvalidInput`] if there are none.
pub fn select_best<'a>(
    candidate_params: &'a [Params],
    table: &ResultTable,
) -> Result<(usize, &'a Params)> {
    if candidate_params.len() != table.n_candidates() {
        return Err(Error::inconsistent_length(
            "candidates vs result table rows",
            vec![candidate_params.len(), table.n_candidates()],
        ));
    }
    table
        .best_index()
        .map(|i| (i, &candidate_params[i]))
        .ok_or_else(|| Error::InvalidInput("no candidates to select from".to_string()))
}
