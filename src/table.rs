//! Feature records to tables, and tables to ML-ready frames.
//!
//! Stage one (`FeatureTable`) keeps raw values with recency sentinels and
//! categorical cells intact. Stage two (`MlFrame`) is the only place where
//! encoding, sentinel capping and skew correction happen.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::features::TrainingSample;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Raw-table stand-in for "never happened" recency values.
pub const RECENCY_SENTINEL_DAYS: f64 = 999.0;
pub const RECENCY_CAP_DAYS: f64 = 365.0;

pub const LANGUAGE_COLUMN: &str = "language_code";
pub const LANGUAGE_PREFIX: &str = "lang";
pub const LANGUAGE_FALLBACK: &str = "other";
pub const LANGUAGE_VOCABULARY: [&str; 9] = ["en", "ru", "uk", "de", "es", "fr", "it", "pt", "other"];

const SENTINEL_COLUMNS: [&str; 3] = [
    "days_since_last_activity",
    "days_since_last_purchase",
    "avg_days_between_purchases",
];

pub const LOG1P_COLUMNS: [&str; 4] = [
    "total_events",
    "total_spent",
    "avg_order_value",
    "customer_lifetime_value",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    User,
    PurchasePrediction,
    ChurnPrediction,
}

impl FeatureSet {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::PurchasePrediction => "purchase_prediction",
            Self::ChurnPrediction => "churn_prediction",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Number(f64),
    Flag(bool),
    Category(Option<String>),
    Missing,
}

impl Cell {
    pub fn count(value: usize) -> Self {
        Self::Number(value as f64)
    }

    /// Materializes an optional recency as the raw-table sentinel.
    pub fn recency(days: Option<i64>) -> Self {
        Self::Number(days.map_or(RECENCY_SENTINEL_DAYS, |d| d as f64))
    }

    pub fn recency_f64(days: Option<f64>) -> Self {
        Self::Number(days.unwrap_or(RECENCY_SENTINEL_DAYS))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Category(_) | Self::Missing => None,
        }
    }
}

/// A flat, fixed-schema record produced by an extractor.
pub trait FeatureRecord {
    const FEATURE_SET: FeatureSet;

    /// Model-facing column names, in the order `cells` emits them.
    fn columns() -> &'static [&'static str];

    fn cells(&self) -> Vec<Cell>;

    fn user_id(&self) -> i64;

    fn extraction_date(&self) -> DateTime<Utc>;
}

#[derive(Debug, Error)]
pub enum TableError {
    #[error("row {row} has {actual} cells, expected {expected}")]
    RowWidth {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("column `{column}` holds a categorical value but has no vocabulary")]
    UnexpectedCategory { column: String },
    #[error("table has {rows} rows but {labels} labels")]
    LabelCount { rows: usize, labels: usize },
    #[error("records shape ({rows}, {cols}) does not match {expected_cols} columns")]
    Shape {
        rows: usize,
        cols: usize,
        expected_cols: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub feature_set: FeatureSet,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
    pub user_ids: Vec<i64>,
    pub extraction_dates: Vec<DateTime<Utc>>,
    pub labels: Option<Vec<bool>>,
}

impl FeatureTable {
    pub fn from_records<R: FeatureRecord>(records: &[R]) -> Self {
        Self {
            feature_set: R::FEATURE_SET,
            columns: R::columns().iter().map(|c| (*c).to_string()).collect(),
            rows: records.iter().map(FeatureRecord::cells).collect(),
            user_ids: records.iter().map(FeatureRecord::user_id).collect(),
            extraction_dates: records.iter().map(FeatureRecord::extraction_date).collect(),
            labels: None,
        }
    }

    pub fn from_samples<R: FeatureRecord>(samples: &[TrainingSample<R>]) -> Self {
        Self {
            feature_set: R::FEATURE_SET,
            columns: R::columns().iter().map(|c| (*c).to_string()).collect(),
            rows: samples.iter().map(|s| s.features.cells()).collect(),
            user_ids: samples.iter().map(|s| s.features.user_id()).collect(),
            extraction_dates: samples
                .iter()
                .map(|s| s.features.extraction_date())
                .collect(),
            labels: Some(samples.iter().map(|s| s.label).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Encodes flags, one-hot encodes the language column against the pinned
    /// vocabulary, fills NaN, caps recency sentinels and applies `log1p`.
    pub fn to_ml_ready(&self) -> Result<MlFrame, TableError> {
        let width = self.columns.len();
        let language_idx = self.column_index(LANGUAGE_COLUMN);

        let mut names: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != language_idx)
            .map(|(_, c)| c.clone())
            .collect();
        let numeric_width = names.len();
        if language_idx.is_some() {
            names.extend(
                LANGUAGE_VOCABULARY
                    .iter()
                    .map(|code| format!("{LANGUAGE_PREFIX}_{code}")),
            );
        }

        let sentinel: HashSet<usize> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| SENTINEL_COLUMNS.contains(&n.as_str()))
            .map(|(i, _)| i)
            .collect();
        let skewed: HashSet<usize> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| LOG1P_COLUMNS.contains(&n.as_str()))
            .map(|(i, _)| i)
            .collect();

        let mut records = Array2::<f64>::zeros((self.rows.len(), names.len()));
        for (r, row) in self.rows.iter().enumerate() {
            if row.len() != width {
                return Err(TableError::RowWidth {
                    row: r,
                    expected: width,
                    actual: row.len(),
                });
            }

            let mut out_col = 0;
            for (c, cell) in row.iter().enumerate() {
                if Some(c) == language_idx {
                    let code = match cell {
                        Cell::Category(code) => code.as_deref(),
                        _ => None,
                    };
                    let slot = language_slot(code);
                    records[[r, numeric_width + slot]] = 1.0;
                    continue;
                }
                if let Cell::Category(_) = cell {
                    return Err(TableError::UnexpectedCategory {
                        column: self.columns[c].clone(),
                    });
                }

                let mut value = cell.as_number().unwrap_or(0.0);
                if !value.is_finite() {
                    value = 0.0;
                }
                if sentinel.contains(&out_col) && value == RECENCY_SENTINEL_DAYS {
                    value = RECENCY_CAP_DAYS;
                }
                if skewed.contains(&out_col) {
                    // negative amounts clamp to zero before the transform
                    value = value.max(0.0).ln_1p();
                }
                records[[r, out_col]] = value;
                out_col += 1;
            }
        }

        let labels = match &self.labels {
            Some(labels) if labels.len() != self.rows.len() => {
                return Err(TableError::LabelCount {
                    rows: self.rows.len(),
                    labels: labels.len(),
                })
            }
            Some(labels) => Some(
                labels
                    .iter()
                    .map(|l| usize::from(*l))
                    .collect::<Array1<usize>>(),
            ),
            None => None,
        };

        let schema = build_feature_schema(self.feature_set, &names, language_idx.is_some());
        debug!(
            component = "table",
            event = "table.ml_ready",
            feature_set = self.feature_set.as_str(),
            rows = records.nrows(),
            columns = records.ncols(),
            fingerprint = %schema.fingerprint
        );

        Ok(MlFrame {
            schema,
            records,
            user_ids: self.user_ids.clone(),
            labels,
        })
    }
}

fn language_slot(code: Option<&str>) -> usize {
    let normalized = code.map(|c| c.trim().to_ascii_lowercase());
    let fallback = LANGUAGE_VOCABULARY
        .iter()
        .position(|v| *v == LANGUAGE_FALLBACK)
        .unwrap_or(LANGUAGE_VOCABULARY.len() - 1);
    normalized
        .and_then(|c| LANGUAGE_VOCABULARY.iter().position(|v| *v == c))
        .unwrap_or(fallback)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureDType {
    Numeric,
    OneHot,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub feature_set: FeatureSet,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
    /// Vocabulary the one-hot columns were built against, if any.
    pub vocabulary: Vec<String>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }
}

pub fn build_feature_schema(
    feature_set: FeatureSet,
    names: &[String],
    one_hot_language: bool,
) -> FeatureSchema {
    let onehot_prefix = format!("{LANGUAGE_PREFIX}_");
    let columns: Vec<FeatureColumn> = names
        .iter()
        .map(|name| FeatureColumn {
            name: name.clone(),
            dtype: if one_hot_language && name.starts_with(&onehot_prefix) {
                FeatureDType::OneHot
            } else {
                FeatureDType::Numeric
            },
        })
        .collect();
    let vocabulary = if one_hot_language {
        LANGUAGE_VOCABULARY.iter().map(|v| (*v).to_string()).collect()
    } else {
        Vec::new()
    };

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        feature_set,
        fingerprint: schema_fingerprint(FEATURE_SCHEMA_VERSION, feature_set, &columns),
        columns,
        vocabulary,
    }
}

fn schema_fingerprint(version: u32, feature_set: FeatureSet, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!("feature_set:{};", feature_set.as_str()));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

/// Column-level difference between a trained schema and an input frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaMismatch {
    pub expected_fingerprint: String,
    pub actual_fingerprint: String,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub order_differs: bool,
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "feature schema mismatch: missing {:?}, unexpected {:?}",
            self.missing, self.unexpected
        )?;
        if self.order_differs {
            write!(f, ", column order differs")?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaMismatch {}

/// Fails unless `actual` has exactly the trained columns in the trained order.
pub fn assert_schema_compatible(
    expected: &FeatureSchema,
    actual: &FeatureSchema,
) -> Result<(), SchemaMismatch> {
    if expected.version == actual.version
        && expected.fingerprint == actual.fingerprint
        && expected.columns == actual.columns
    {
        return Ok(());
    }

    let expected_names: Vec<&str> = expected.column_names();
    let actual_names: Vec<&str> = actual.column_names();
    let actual_set: HashSet<&str> = actual_names.iter().copied().collect();
    let expected_set: HashSet<&str> = expected_names.iter().copied().collect();

    let missing: Vec<String> = expected_names
        .iter()
        .filter(|n| !actual_set.contains(*n))
        .map(|n| (*n).to_string())
        .collect();
    let unexpected: Vec<String> = actual_names
        .iter()
        .filter(|n| !expected_set.contains(*n))
        .map(|n| (*n).to_string())
        .collect();
    let order_differs = missing.is_empty() && unexpected.is_empty();

    Err(SchemaMismatch {
        expected_fingerprint: expected.fingerprint.clone(),
        actual_fingerprint: actual.fingerprint.clone(),
        missing,
        unexpected,
        order_differs,
    })
}

/// Numeric model input with its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct MlFrame {
    pub schema: FeatureSchema,
    pub records: Array2<f64>,
    pub user_ids: Vec<i64>,
    pub labels: Option<Array1<usize>>,
}

impl MlFrame {
    /// Builds a frame from already numeric columns.
    pub fn new(
        feature_set: FeatureSet,
        columns: Vec<String>,
        records: Array2<f64>,
        user_ids: Vec<i64>,
        labels: Option<Vec<bool>>,
    ) -> Result<Self, TableError> {
        if records.ncols() != columns.len() || records.nrows() != user_ids.len() {
            return Err(TableError::Shape {
                rows: records.nrows(),
                cols: records.ncols(),
                expected_cols: columns.len(),
            });
        }
        let labels = match labels {
            Some(l) if l.len() != records.nrows() => {
                return Err(TableError::LabelCount {
                    rows: records.nrows(),
                    labels: l.len(),
                })
            }
            Some(l) => Some(l.into_iter().map(usize::from).collect()),
            None => None,
        };
        let one_hot = columns
            .iter()
            .any(|c| c.starts_with(&format!("{LANGUAGE_PREFIX}_")));
        Ok(Self {
            schema: build_feature_schema(feature_set, &columns, one_hot),
            records,
            user_ids,
            labels,
        })
    }

    pub fn nrows(&self) -> usize {
        self.records.nrows()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.columns.iter().position(|c| c.name == name)
    }

    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            schema: self.schema.clone(),
            records: self.records.select(Axis(0), rows),
            user_ids: rows.iter().map(|r| self.user_ids[*r]).collect(),
            labels: self.labels.as_ref().map(|l| l.select(Axis(0), rows)),
        }
    }

    /// Same rows without one column, with a recomputed schema.
    pub fn without_column(&self, name: &str) -> Self {
        let keep: Vec<usize> = (0..self.schema.width())
            .filter(|i| self.schema.columns[*i].name != name)
            .collect();
        let names: Vec<String> = keep
            .iter()
            .map(|i| self.schema.columns[*i].name.clone())
            .collect();
        let one_hot = !self.schema.vocabulary.is_empty();
        Self {
            schema: build_feature_schema(self.schema.feature_set, &names, one_hot),
            records: self.records.select(Axis(1), &keep),
            user_ids: self.user_ids.clone(),
            labels: self.labels.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct Probe {
        user_id: i64,
        total_events: usize,
        days_since_last_purchase: Option<i64>,
        has_username: bool,
        language: Option<String>,
        ratio: f64,
    }

    impl FeatureRecord for Probe {
        const FEATURE_SET: FeatureSet = FeatureSet::User;

        fn columns() -> &'static [&'static str] {
            &[
                "total_events",
                "days_since_last_purchase",
                "has_username",
                "language_code",
                "ratio",
            ]
        }

        fn cells(&self) -> Vec<Cell> {
            vec![
                Cell::count(self.total_events),
                Cell::recency(self.days_since_last_purchase),
                Cell::Flag(self.has_username),
                Cell::Category(self.language.clone()),
                Cell::Number(self.ratio),
            ]
        }

        fn user_id(&self) -> i64 {
            self.user_id
        }

        fn extraction_date(&self) -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
        }
    }

    fn probes() -> Vec<Probe> {
        vec![
            Probe {
                user_id: 1,
                total_events: 3,
                days_since_last_purchase: None,
                has_username: true,
                language: Some("ru".to_string()),
                ratio: f64::NAN,
            },
            Probe {
                user_id: 2,
                total_events: 0,
                days_since_last_purchase: Some(4),
                has_username: false,
                language: Some("xx".to_string()),
                ratio: 0.5,
            },
        ]
    }

    #[test]
    fn raw_table_keeps_sentinel() {
        let table = FeatureTable::from_records(&probes());
        assert_eq!(
            table.value(0, "days_since_last_purchase"),
            Some(&Cell::Number(RECENCY_SENTINEL_DAYS))
        );
    }

    #[test]
    fn ml_ready_transform_encodes_and_caps() {
        let frame = FeatureTable::from_records(&probes())
            .to_ml_ready()
            .expect("transform succeeds");

        let names = frame.schema.column_names();
        assert_eq!(
            &names[..4],
            &["total_events", "days_since_last_purchase", "has_username", "ratio"]
        );
        assert_eq!(names.len(), 4 + LANGUAGE_VOCABULARY.len());
        assert!(!names.contains(&"language_code"));

        let col = |n: &str| frame.column_index(n).expect("column present");
        assert!((frame.records[[0, col("total_events")]] - 4.0_f64.ln()).abs() < 1e-12);
        assert_eq!(frame.records[[0, col("days_since_last_purchase")]], 365.0);
        assert_eq!(frame.records[[1, col("days_since_last_purchase")]], 4.0);
        assert_eq!(frame.records[[0, col("has_username")]], 1.0);
        assert_eq!(frame.records[[0, col("ratio")]], 0.0);
        assert_eq!(frame.records[[0, col("lang_ru")]], 1.0);
        assert_eq!(frame.records[[1, col("lang_other")]], 1.0);
        assert_eq!(frame.records[[1, col("lang_ru")]], 0.0);
    }

    #[test]
    fn schema_is_independent_of_batch_contents() {
        let all = FeatureTable::from_records(&probes())
            .to_ml_ready()
            .expect("transform succeeds");
        let first_only = FeatureTable::from_records(&probes()[..1])
            .to_ml_ready()
            .expect("transform succeeds");
        assert_eq!(all.schema, first_only.schema);
        assert!(assert_schema_compatible(&all.schema, &first_only.schema).is_ok());
    }

    #[test]
    fn dropped_column_is_reported_as_missing() {
        let frame = FeatureTable::from_records(&probes())
            .to_ml_ready()
            .expect("transform succeeds");
        let reduced = frame.without_column("ratio");
        let err = assert_schema_compatible(&frame.schema, &reduced.schema)
            .expect_err("missing column must be rejected");
        assert_eq!(err.missing, vec!["ratio".to_string()]);
        assert!(err.unexpected.is_empty());
    }

    #[test]
    fn reordered_columns_are_rejected() {
        let names = vec!["a".to_string(), "b".to_string()];
        let reordered = vec!["b".to_string(), "a".to_string()];
        let expected = build_feature_schema(FeatureSet::User, &names, false);
        let actual = build_feature_schema(FeatureSet::User, &reordered, false);
        let err = assert_schema_compatible(&expected, &actual).expect_err("order matters");
        assert!(err.order_differs);
    }
}
