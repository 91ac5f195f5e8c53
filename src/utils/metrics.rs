//! Metrics Module for Training and Evaluation
//!
//! - `EpochMeter`: sample-weighted loss and categorical accuracy for an epoch
//! - `ConfusionMatrix`: per-class breakdown of the final validation pass
//! - `ClassReport`: precision/recall/F1 per class

use serde::{Deserialize, Serialize};

/// Sample-weighted running loss and accuracy
#[derive(Debug, Clone, Default)]
pub struct EpochMeter {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl EpochMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch given its mean loss, correct count and size
    pub fn add_batch(&mut self, mean_loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += mean_loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    /// Mean loss per sample
    pub fn loss(&self) -> f64 {
        if self.total > 0 {
            self.loss_sum / self.total as f64
        } else {
            0.0
        }
    }

    /// Fraction of samples whose arg-max prediction matched the target
    pub fn accuracy(&self) -> f64 {
        if self.total > 0 {
            self.correct as f64 / self.total as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.total
    }
}

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassReport {
    /// Class index
    pub class_idx: usize,

    /// Precision = TP / (TP + FP)
    pub precision: f64,

    /// Recall = TP / (TP + FN)
    pub recall: f64,

    /// F1 = 2 * (precision * recall) / (precision + recall)
    pub f1: f64,

    /// Support = number of actual samples of this class
    pub support: usize,
}

impl ClassReport {
    /// Calculate metrics for a class from confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);
        let predicted: usize = (0..cm.num_classes).map(|i| cm.get(i, class_idx)).sum();
        let support: usize = (0..cm.num_classes).map(|i| cm.get(class_idx, i)).sum();

        let precision = if predicted > 0 {
            true_positives as f64 / predicted as f64
        } else {
            0.0
        };

        let recall = if support > 0 {
            true_positives as f64 / support as f64
        } else {
            0.0
        };

        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            precision,
            recall,
            f1,
            support,
        }
    }
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfusionMatrix {
    /// Number of classes
    pub num_classes: usize,

    /// Matrix data (row = actual, column = predicted), row-major
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    /// Create a new empty confusion matrix
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    /// Add a single prediction to the matrix
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    /// Add a batch of predictions
    pub fn add_batch(&mut self, actual: &[usize], predicted: &[usize]) {
        for (&a, &p) in actual.iter().zip(predicted.iter()) {
            self.add(a, p);
        }
    }

    /// Get the count at (actual, predicted)
    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    /// Diagonal sum
    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total > 0 {
            self.correct() as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Metrics for every class
    pub fn class_reports(&self) -> Vec<ClassReport> {
        (0..self.num_classes)
            .map(|c| ClassReport::from_confusion_matrix(self, c))
            .collect()
    }

    /// Macro-averaged F1 over classes that have support
    pub fn macro_f1(&self) -> f64 {
        let supported: Vec<f64> = self
            .class_reports()
            .iter()
            .filter(|r| r.support > 0)
            .map(|r| r.f1)
            .collect();
        if supported.is_empty() {
            0.0
        } else {
            supported.iter().sum::<f64>() / supported.len() as f64
        }
    }

    /// Pretty print the matrix
    pub fn display(&self) -> String {
        let mut output = String::new();
        output.push_str("\nConfusion Matrix (rows=actual, cols=predicted):\n\n");

        output.push_str("         ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", col));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>8} ", row));
            for col in 0..self.num_classes {
                let count = self.get(row, col);
                if row == col {
                    output.push_str(&format!("[{:>4}]", count));
                } else if count > 0 {
                    output.push_str(&format!(" {:>4} ", count));
                } else {
                    output.push_str("    . ");
                }
            }
            output.push('\n');
        }

        output.push_str(&format!("\nAccuracy: {:.2}%\n", self.accuracy() * 100.0));
        output
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Final validation report written next to the trained model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub loss: f64,
    pub accuracy: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassReport>,
    pub confusion_matrix: ConfusionMatrix,
}

impl ValidationReport {
    pub fn new(loss: f64, confusion_matrix: ConfusionMatrix) -> Self {
        Self {
            loss,
            accuracy: confusion_matrix.accuracy(),
            macro_f1: confusion_matrix.macro_f1(),
            per_class: confusion_matrix.class_reports(),
            confusion_matrix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_meter_weights_by_batch_size() {
        let mut meter = EpochMeter::new();
        meter.add_batch(1.0, 3, 4);
        meter.add_batch(4.0, 0, 1);
        assert!((meter.loss() - 8.0 / 5.0).abs() < 1e-12);
        assert!((meter.accuracy() - 0.6).abs() < 1e-12);
        assert_eq!(meter.count(), 5);
    }

    #[test]
    fn test_empty_meter() {
        let meter = EpochMeter::new();
        assert_eq!(meter.loss(), 0.0);
        assert_eq!(meter.accuracy(), 0.0);
    }

    #[test]
    fn test_confusion_matrix_counts() {
        let mut cm = ConfusionMatrix::new(3);
        cm.add_batch(&[0, 0, 1, 2, 2], &[0, 1, 1, 2, 0]);
        assert_eq!(cm.total(), 5);
        assert_eq!(cm.correct(), 3);
        assert!((cm.accuracy() - 0.6).abs() < 1e-12);
        assert_eq!(cm.get(0, 1), 1);
        assert_eq!(cm.get(5, 5), 0);
    }

    #[test]
    fn test_class_report() {
        let mut cm = ConfusionMatrix::new(2);
        cm.add_batch(&[0, 0, 0, 1], &[0, 0, 1, 1]);
        let reports = cm.class_reports();
        assert_eq!(reports[0].support, 3);
        assert!((reports[0].recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((reports[0].precision - 1.0).abs() < 1e-12);
        assert!((reports[1].precision - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_validation_report_serializes() {
        let mut cm = ConfusionMatrix::new(2);
        cm.add(0, 0);
        cm.add(1, 0);
        let report = ValidationReport::new(0.3, cm);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"accuracy\":0.5"));
    }

    #[test]
    fn test_matrix_rendering_marks_diagonal() {
        let mut cm = ConfusionMatrix::new(2);
        cm.add_batch(&[0, 0, 1], &[0, 1, 1]);
        let text = cm.to_string();
        assert!(text.contains("rows=actual"));
        assert!(text.contains("[   1]"));
        assert!(text.contains("Accuracy: 66.67%"));
    }
}
