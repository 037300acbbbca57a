use std::{
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    get_desc,
    log_distribution,
    reporting::log_distribution_with_labels,
    StaticMetricLabel,
};

/// Records the time between construction and drop into a histogram.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed_duration = self.start.elapsed();
        tracing::debug!(
            "{elapsed_duration:?} for timer {:?}",
            get_desc(self.histogram)
        );
        log_distribution(self.histogram, elapsed_duration.as_secs_f64());
    }
}

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: Vec<StaticMetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels: vec![StaticMetricLabel::STATUS_ERROR],
        }
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.labels.push(label);
    }

    /// Finish the timer with status success
    pub fn finish(mut self) -> Duration {
        for label in self.labels.iter_mut() {
            if *label == StaticMetricLabel::STATUS_ERROR {
                *label = StaticMetricLabel::STATUS_SUCCESS;
            }
        }
        self.start.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed_duration = self.start.elapsed();
        let labels = mem::take(&mut self.labels);
        tracing::debug!(
            "{elapsed_duration:?} for timer {:?} {labels:?}",
            get_desc(self.histogram)
        );
        log_distribution_with_labels(self.histogram, elapsed_duration.as_secs_f64(), labels);
    }
}
