use anyhow::bail;
use serde::Serialize;

/// The four quality metrics the dashboard compares, each rounded to four
/// decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Metrics at the operator-chosen threshold next to metrics at the
/// precomputed best threshold.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThresholdComparison {
    pub user: MetricsReport,
    pub best: MetricsReport,
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// Accuracy, precision, recall and F1 over aligned binary sequences.
/// Degenerate denominators follow the usual convention: precision is 0 with
/// no positive predictions, recall is 0 with no positive truths, F1 is 0
/// when precision + recall is 0.
pub fn classification_metrics(truth: &[i16], predicted: &[bool]) -> anyhow::Result<MetricsReport> {
    if truth.len() != predicted.len() {
        bail!(
            "metrics input mismatch: {} truths vs {} predictions",
            truth.len(),
            predicted.len()
        );
    }
    if truth.is_empty() {
        bail!("metrics need at least one labelled row");
    }

    let mut tp = 0usize;
    let mut tn = 0usize;
    let mut fp = 0usize;
    let mut fn_ = 0usize;
    for (&y, &p) in truth.iter().zip(predicted.iter()) {
        match (y != 0, p) {
            (true, true) => tp += 1,
            (false, false) => tn += 1,
            (false, true) => fp += 1,
            (true, false) => fn_ += 1,
        }
    }

    let total = truth.len() as f64;
    let accuracy = (tp + tn) as f64 / total;
    let precision = if tp + fp == 0 {
        0.0
    } else {
        tp as f64 / (tp + fp) as f64
    };
    let recall = if tp + fn_ == 0 {
        0.0
    } else {
        tp as f64 / (tp + fn_) as f64
    };
    let f1 = if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    Ok(MetricsReport {
        accuracy: round4(accuracy),
        precision: round4(precision),
        recall: round4(recall),
        f1: round4(f1),
    })
}

/// Thresholds the probabilities at the operator cutoff and at the best
/// cutoff (both inclusive) and computes metrics for each.
pub fn threshold_comparison(
    truth: &[i16],
    probabilities: &[f64],
    threshold: f64,
    best_thr: f64,
) -> anyhow::Result<ThresholdComparison> {
    if truth.len() != probabilities.len() {
        bail!(
            "comparison input mismatch: {} truths vs {} probabilities",
            truth.len(),
            probabilities.len()
        );
    }
    let at_user: Vec<bool> = probabilities.iter().map(|p| *p >= threshold).collect();
    let at_best: Vec<bool> = probabilities.iter().map(|p| *p >= best_thr).collect();
    Ok(ThresholdComparison {
        user: classification_metrics(truth, &at_user)?,
        best: classification_metrics(truth, &at_best)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_vector_matches_expected_metrics() {
        let truth = [1, 0, 1, 1];
        let predicted = [true, false, false, true];
        let report = classification_metrics(&truth, &predicted).unwrap();
        assert!((report.accuracy - 0.75).abs() < 1e-9);
        assert!((report.precision - 1.0).abs() < 1e-9);
        assert!((report.recall - 0.6667).abs() < 1e-9);
        assert!((report.f1 - 0.8).abs() < 1e-9);
    }

    #[test]
    fn no_positive_predictions_means_zero_precision() {
        let report = classification_metrics(&[1, 0, 1], &[false, false, false]).unwrap();
        assert_eq!(report.precision, 0.0);
        assert_eq!(report.f1, 0.0);
        assert!((report.recall - 0.0).abs() < 1e-9);
    }

    #[test]
    fn no_positive_truths_means_zero_recall() {
        let report = classification_metrics(&[0, 0, 0], &[true, false, false]).unwrap();
        assert_eq!(report.recall, 0.0);
        assert_eq!(report.f1, 0.0);
        assert!((report.accuracy - 0.6667).abs() < 1e-9);
    }

    #[test]
    fn perfect_predictions_score_one_everywhere() {
        let report = classification_metrics(&[1, 0, 1, 0], &[true, false, true, false]).unwrap();
        assert_eq!(
            report,
            MetricsReport {
                accuracy: 1.0,
                precision: 1.0,
                recall: 1.0,
                f1: 1.0,
            }
        );
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(classification_metrics(&[1, 0], &[true]).is_err());
        assert!(classification_metrics(&[], &[]).is_err());
    }

    #[test]
    fn thresholding_is_inclusive_on_both_cutoffs() {
        let truth = [1, 0];
        let probabilities = [0.5, 0.2];
        let comparison = threshold_comparison(&truth, &probabilities, 0.5, 0.5).unwrap();
        // the 0.5 probability meets the 0.5 cutoff, so both rows are right
        assert_eq!(comparison.user.accuracy, 1.0);
        assert_eq!(comparison.best.accuracy, 1.0);
    }

    #[test]
    fn user_and_best_cutoffs_diverge() {
        let truth = [1, 1, 0, 0];
        let probabilities = [0.9, 0.45, 0.4, 0.1];
        let comparison = threshold_comparison(&truth, &probabilities, 0.5, 0.42).unwrap();
        // at 0.5 the second positive is missed
        assert!((comparison.user.recall - 0.5).abs() < 1e-9);
        // at 0.42 it is caught
        assert!((comparison.best.recall - 1.0).abs() < 1e-9);
    }
}
