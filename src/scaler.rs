//! Per-column standardization fitted on training data and persisted with
//! every model bundle.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub means: Array1<f64>,
    pub stds: Array1<f64>,
}

impl StandardScaler {
    /// Population mean and standard deviation per column. Constant columns
    /// get a unit scale so they transform to zero.
    pub fn fit(records: &Array2<f64>) -> Self {
        let n = records.ncols();
        if records.nrows() == 0 {
            return Self {
                means: Array1::zeros(n),
                stds: Array1::ones(n),
            };
        }
        let means = records
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(n));
        let stds = records
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });
        Self { means, stds }
    }

    pub fn transform(&self, records: &Array2<f64>) -> Array2<f64> {
        (records - &self.means) / &self.stds
    }

    pub fn transform_row(&self, row: ArrayView1<f64>) -> Array1<f64> {
        (&row - &self.means) / &self.stds
    }

    pub fn width(&self) -> usize {
        self.means.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn standardizes_columns_and_keeps_constants_finite() {
        let x = array![[1.0, 5.0], [3.0, 5.0]];
        let scaler = StandardScaler::fit(&x);
        assert_eq!(scaler.means, array![2.0, 5.0]);
        assert_eq!(scaler.stds, array![1.0, 1.0]);

        let scaled = scaler.transform(&x);
        assert_eq!(scaled, array![[-1.0, 0.0], [1.0, 0.0]]);
        assert_eq!(scaler.transform_row(x.row(1)), array![1.0, 0.0]);
    }
}
