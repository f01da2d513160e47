//! Held-out splits and evaluation metrics for classifiers and clusterers.

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TEST_FRACTION: f64 = 0.2;

/// Train/test row indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Shuffles each class separately and holds out `test_fraction` of it.
/// A class with at least two members always keeps one row on each side.
pub fn stratified_split(labels: &Array1<usize>, test_fraction: f64, seed: u64) -> Split {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in distinct_classes(labels) {
        let mut rows: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == class)
            .map(|(i, _)| i)
            .collect();
        rows.shuffle(&mut rng);

        let mut n_test = (rows.len() as f64 * test_fraction).round() as usize;
        if rows.len() >= 2 {
            n_test = n_test.clamp(1, rows.len() - 1);
        } else {
            n_test = 0;
        }
        test.extend_from_slice(&rows[..n_test]);
        train.extend_from_slice(&rows[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    Split { train, test }
}

/// `k` stratified folds; each split holds one fold out.
pub fn stratified_folds(labels: &Array1<usize>, k: usize, seed: u64) -> Vec<Split> {
    let k = k.max(2);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); k];

    for class in distinct_classes(labels) {
        let mut rows: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == class)
            .map(|(i, _)| i)
            .collect();
        rows.shuffle(&mut rng);
        for (i, row) in rows.into_iter().enumerate() {
            folds[i % k].push(row);
        }
    }

    (0..k)
        .map(|held_out| {
            let mut test = folds[held_out].clone();
            let mut train: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != held_out)
                .flat_map(|(_, f)| f.iter().copied())
                .collect();
            test.sort_unstable();
            train.sort_unstable();
            Split { train, test }
        })
        .collect()
}

fn distinct_classes(labels: &Array1<usize>) -> Vec<usize> {
    let mut classes: Vec<usize> = labels.iter().copied().collect();
    classes.sort_unstable();
    classes.dedup();
    classes
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub auc_roc: f64,
    /// `[[tn, fp], [fn, tp]]`
    pub confusion_matrix: [[u64; 2]; 2],
    pub test_size: usize,
}

pub fn classification_metrics(
    truth: &Array1<usize>,
    probabilities: &Array1<f64>,
    threshold: f64,
) -> ClassificationMetrics {
    let mut cm = [[0u64; 2]; 2];
    for (t, p) in truth.iter().zip(probabilities.iter()) {
        let predicted = usize::from(*p >= threshold);
        let actual = usize::from(*t == 1);
        cm[actual][predicted] += 1;
    }
    let [[tn, fp], [fn_, tp]] = cm;
    let total = (tn + fp + fn_ + tp) as f64;

    let precision = safe_div(tp as f64, (tp + fp) as f64);
    let recall = safe_div(tp as f64, (tp + fn_) as f64);
    ClassificationMetrics {
        accuracy: safe_div((tp + tn) as f64, total),
        precision,
        recall,
        f1_score: safe_div(2.0 * precision * recall, precision + recall),
        auc_roc: auc_roc(truth, probabilities),
        confusion_matrix: cm,
        test_size: truth.len(),
    }
}

/// Rank-based AUC (Mann-Whitney U) with average ranks for ties. Returns 0.5
/// when only one class is present.
pub fn auc_roc(truth: &Array1<usize>, scores: &Array1<f64>) -> f64 {
    let n = truth.len();
    let positives = truth.iter().filter(|t| **t == 1).count();
    let negatives = n - positives;
    if positives == 0 || negatives == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = avg_rank;
        }
        i = j + 1;
    }

    let positive_rank_sum: f64 = (0..n).filter(|i| truth[*i] == 1).map(|i| ranks[i]).sum();
    let p = positives as f64;
    (positive_rank_sum - p * (p + 1.0) / 2.0) / (p * negatives as f64)
}

fn safe_div(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

pub fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

pub fn cluster_sizes(labels: &Array1<usize>, n_clusters: usize) -> Vec<usize> {
    let mut sizes = vec![0; n_clusters];
    for &label in labels {
        if label < n_clusters {
            sizes[label] += 1;
        }
    }
    sizes
}

/// Within-cluster sum of squared distances.
pub fn inertia(records: &Array2<f64>, labels: &Array1<usize>, centroids: &Array2<f64>) -> f64 {
    labels
        .iter()
        .enumerate()
        .filter(|(_, c)| **c < centroids.nrows())
        .map(|(i, c)| euclidean(records.row(i), centroids.row(*c)).powi(2))
        .sum()
}

/// Rows scored by [`sampled_silhouette_score`] before it switches from the
/// full pairwise pass to a random subset.
pub const SILHOUETTE_SAMPLE_SIZE: usize = 2_000;

/// Mean silhouette over all points. Points in singleton clusters score 0.
pub fn silhouette_score(records: &Array2<f64>, labels: &Array1<usize>, n_clusters: usize) -> f64 {
    let rows: Vec<usize> = (0..records.nrows()).collect();
    silhouette_over(records, labels, n_clusters, &rows)
}

/// Silhouette over at most `sample_size` rows drawn with `seed`. Equal to
/// [`silhouette_score`] when the table fits in the sample.
pub fn sampled_silhouette_score(
    records: &Array2<f64>,
    labels: &Array1<usize>,
    n_clusters: usize,
    sample_size: usize,
    seed: u64,
) -> f64 {
    let mut rows: Vec<usize> = (0..records.nrows()).collect();
    if rows.len() > sample_size {
        let mut rng = StdRng::seed_from_u64(seed);
        rows.shuffle(&mut rng);
        rows.truncate(sample_size);
        rows.sort_unstable();
    }
    silhouette_over(records, labels, n_clusters, &rows)
}

/// Silhouette restricted to `rows`: both the scored points and the points
/// they are compared against come from the subset.
fn silhouette_over(
    records: &Array2<f64>,
    labels: &Array1<usize>,
    n_clusters: usize,
    rows: &[usize],
) -> f64 {
    let n = rows.len();
    if n < 2 || n_clusters < 2 {
        return 0.0;
    }
    let mut sizes = vec![0usize; n_clusters];
    for &i in rows {
        if labels[i] < n_clusters {
            sizes[labels[i]] += 1;
        }
    }

    let mut total = 0.0;
    for &i in rows {
        let own = labels[i];
        if own >= n_clusters || sizes[own] <= 1 {
            continue;
        }
        let mut sums = vec![0.0; n_clusters];
        for &j in rows {
            if i != j && labels[j] < n_clusters {
                sums[labels[j]] += euclidean(records.row(i), records.row(j));
            }
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..n_clusters)
            .filter(|c| *c != own && sizes[*c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        if b.is_finite() {
            let denom = a.max(b);
            if denom > 0.0 {
                total += (b - a) / denom;
            }
        }
    }
    total / n as f64
}

/// Ratio of between-cluster to within-cluster dispersion.
pub fn calinski_harabasz_score(
    records: &Array2<f64>,
    labels: &Array1<usize>,
    centroids: &Array2<f64>,
) -> f64 {
    let n = records.nrows();
    let k = centroids.nrows();
    if n <= k || k < 2 {
        return 0.0;
    }
    let Some(overall) = records.mean_axis(ndarray::Axis(0)) else {
        return 0.0;
    };
    let sizes = cluster_sizes(labels, k);
    let between: f64 = (0..k)
        .map(|c| sizes[c] as f64 * euclidean(centroids.row(c), overall.view()).powi(2))
        .sum();
    let within = inertia(records, labels, centroids);
    if within == 0.0 {
        return 0.0;
    }
    (between / (k - 1) as f64) / (within / (n - k) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn auc_is_one_for_perfect_ranking_and_half_for_ties() {
        let truth = array![0, 0, 1, 1];
        assert!((auc_roc(&truth, &array![0.1, 0.2, 0.8, 0.9]) - 1.0).abs() < 1e-12);
        assert!((auc_roc(&truth, &array![0.5, 0.5, 0.5, 0.5]) - 0.5).abs() < 1e-12);
        assert!((auc_roc(&truth, &array![0.9, 0.8, 0.2, 0.1])).abs() < 1e-12);
        assert_eq!(auc_roc(&array![1, 1], &array![0.2, 0.3]), 0.5);
    }

    #[test]
    fn confusion_matrix_and_rates() {
        let truth = array![0, 0, 1, 1, 1];
        let probs = array![0.1, 0.7, 0.9, 0.6, 0.2];
        let m = classification_metrics(&truth, &probs, 0.5);
        assert_eq!(m.confusion_matrix, [[1, 1], [1, 2]]);
        assert!((m.accuracy - 0.6).abs() < 1e-12);
        assert!((m.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.recall - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn stratified_split_keeps_both_classes_on_each_side() {
        let labels: Array1<usize> = (0..50).map(|i| usize::from(i % 5 == 0)).collect();
        let split = stratified_split(&labels, 0.2, 7);
        assert_eq!(split.train.len() + split.test.len(), 50);
        assert_eq!(split.test.len(), 10);
        assert!(split.test.iter().any(|i| labels[*i] == 1));
        assert!(split.train.iter().any(|i| labels[*i] == 1));
        assert_eq!(split, stratified_split(&labels, 0.2, 7));
    }

    #[test]
    fn folds_partition_rows() {
        let labels: Array1<usize> = (0..30).map(|i| usize::from(i % 3 == 0)).collect();
        let folds = stratified_folds(&labels, 3, 1);
        let mut seen: Vec<usize> = folds.iter().flat_map(|f| f.test.clone()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn separated_clusters_score_well() {
        let x = array![[0.0, 0.0], [0.0, 0.1], [10.0, 10.0], [10.0, 10.1]];
        let labels = array![0, 0, 1, 1];
        let centroids = array![[0.0, 0.05], [10.0, 10.05]];
        assert!(silhouette_score(&x, &labels, 2) > 0.9);
        assert!(calinski_harabasz_score(&x, &labels, &centroids) > 100.0);
        assert!((inertia(&x, &labels, &centroids) - 0.01).abs() < 1e-9);
        assert_eq!(cluster_sizes(&labels, 2), vec![2, 2]);
    }

    #[test]
    fn sampled_silhouette_tracks_the_full_score() {
        let x: Array2<f64> = Array2::from_shape_fn((400, 2), |(i, j)| {
            let base = if i % 2 == 0 { 0.0 } else { 20.0 };
            base + ((i * 7 + j * 3) % 11) as f64 * 0.1
        });
        let labels: Array1<usize> = (0..400).map(|i| i % 2).collect();

        let full = silhouette_score(&x, &labels, 2);
        assert_eq!(sampled_silhouette_score(&x, &labels, 2, 400, 3), full);

        let sampled = sampled_silhouette_score(&x, &labels, 2, 60, 3);
        assert!(sampled > 0.9, "sampled {sampled}");
        assert!((sampled - full).abs() < 0.05);
        assert_eq!(sampled, sampled_silhouette_score(&x, &labels, 2, 60, 3));
    }
}
