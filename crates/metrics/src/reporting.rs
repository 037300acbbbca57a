use std::collections::HashMap;

use prometheus::{
    core::Collector,
    Gauge,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
};

use crate::{
    labels::Labels,
    log_invalid_metric,
    StaticMetricLabel,
};

pub fn log_counter(prometheus_counter: &IntCounter, increment: u64) {
    prometheus_counter.inc_by(increment);
}

pub fn log_counter_with_labels(prometheus_counter: &IntCounterVec, increment: u64, labels: Labels) {
    match prometheus_counter.get_metric_with(&label_map(&labels)) {
        Ok(metric) => metric.inc_by(increment),
        Err(e) => {
            // Recursing into `log_invalid_metric` for the invalid metric counter
            // itself would loop forever.
            if get_desc(prometheus_counter).ends_with("invalid_metric_total") {
                tracing::error!("Failed to record invalid metric counter: {e}");
                return;
            }
            log_invalid_metric(get_desc(prometheus_counter), e);
        },
    }
}

pub fn log_gauge(prometheus_gauge: &Gauge, value: f64) {
    prometheus_gauge.set(value);
}

pub fn log_distribution(prometheus_histogram: &Histogram, value: f64) {
    prometheus_histogram.observe(value);
}

pub(crate) fn log_distribution_with_labels(
    prometheus_histogram: &HistogramVec,
    value: f64,
    labels: Labels,
) {
    match prometheus_histogram.get_metric_with(&label_map(&labels)) {
        Ok(metric) => metric.observe(value),
        Err(e) => {
            log_invalid_metric(get_desc(prometheus_histogram), e);
        },
    }
}

fn label_map(labels: &Labels) -> HashMap<&str, &str> {
    labels
        .iter()
        .map(StaticMetricLabel::split_key_value)
        .collect()
}

pub fn get_desc<M: Collector>(metric: &M) -> String {
    let unknown = "unknown".to_string();
    metric
        .desc()
        .first()
        .map(|d| d.fq_name.clone())
        .unwrap_or(unknown)
}
