//! Threshold evaluation

use crate::models::{ClassificationEvent, MetricKind, ThresholdBand, ThresholdTable, VitalSample};

/// Stateless classifier of samples against the threshold table
#[derive(Debug, Clone, Default)]
pub struct ThresholdEvaluator {
    table: ThresholdTable,
}

impl ThresholdEvaluator {
    /// Create an evaluator over a threshold table
    pub fn new(table: ThresholdTable) -> Self {
        Self { table }
    }

    /// Classify one sample
    pub fn classify(&self, sample: &VitalSample) -> ClassificationEvent {
        let (status, deviation) = self.table.band(sample.metric()).classify(sample.value());
        ClassificationEvent::new(*sample, status, deviation)
    }

    /// Band applied to a metric
    pub fn band(&self, metric: MetricKind) -> ThresholdBand {
        self.table.band(metric)
    }

    /// The threshold table
    pub fn table(&self) -> &ThresholdTable {
        &self.table
    }
}
