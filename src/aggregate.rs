use chrono::{DateTime, Local};
use std::time::Duration;

use crate::domain::{round1, Reading};
use crate::history::{HistoricalPoint, MetricSummary, LABEL_FORMAT};

/// Time/count windowed accumulator that summarises raw samples into one
/// historical point per window.
///
/// A window opens on the first sample after a flush and closes when either
/// `window` has elapsed since it opened or `max_samples` samples are held,
/// whichever comes first. The closing sample belongs to the closing window.
///
/// Fed by one polling loop. The switchboard shares it through `EngineState`
/// so a stop can flush it and a history clear can drop it.
#[derive(Debug)]
pub struct AggregationBuffer {
    metrics: Vec<String>,
    window: Duration,
    max_samples: usize,
    /// one column per tracked metric, rows aligned
    samples: Vec<Vec<f64>>,
    started: Option<DateTime<Local>>,
}

impl AggregationBuffer {
    pub fn new(metrics: Vec<String>, window: Duration, max_samples: usize) -> Self {
        let samples = vec![Vec::new(); metrics.len()];
        Self { metrics, window, max_samples: max_samples.max(1), samples, started: None }
    }

    /// add one reading; returns the summary if this sample closed the window.
    /// readings missing any tracked metric are skipped.
    pub fn add(&mut self, reading: &Reading, now: DateTime<Local>) -> Option<HistoricalPoint> {
        let values: Option<Vec<f64>> = self.metrics.iter().map(|m| reading.metric(m)).collect();
        let values = values?;

        let started = *self.started.get_or_insert(now);
        for (column, value) in self.samples.iter_mut().zip(values) {
            column.push(value);
        }

        let elapsed = now.signed_duration_since(started).to_std().unwrap_or_default();
        if elapsed >= self.window || self.len() >= self.max_samples {
            self.flush(now)
        } else {
            None
        }
    }

    /// summarise and clear the open window. an empty window is left alone.
    pub fn flush(&mut self, now: DateTime<Local>) -> Option<HistoricalPoint> {
        if self.is_empty() {
            return None;
        }
        let started = self.started.take().unwrap_or(now);

        let metrics = self
            .metrics
            .iter()
            .zip(self.samples.iter_mut())
            .map(|(name, column)| {
                let avg = column.iter().sum::<f64>() / column.len() as f64;
                let peak = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                column.clear();
                MetricSummary { name: name.clone(), avg: round1(avg), peak: round1(peak) }
            })
            .collect();

        Some(HistoricalPoint { label: started.format(LABEL_FORMAT).to_string(), metrics })
    }

    /// drop the open window without summarising it
    pub fn reset(&mut self) {
        self.samples.iter_mut().for_each(Vec::clear);
        self.started = None;
    }

    pub fn len(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window_start(&self) -> Option<DateTime<Local>> {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Measurement;
    use chrono::TimeZone;

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Local> {
        t0() + chrono::Duration::seconds(secs)
    }

    fn distance(cm: f64) -> Reading {
        Reading::new(vec![Measurement::Distance { cm }], t0())
    }

    fn buffer(window_secs: u64, cap: usize) -> AggregationBuffer {
        AggregationBuffer::new(vec!["distance".to_string()], Duration::from_secs(window_secs), cap)
    }

    #[test]
    fn test_window_summary_scenario() {
        let mut buf = buffer(60, 60);
        assert!(buf.add(&distance(20.0), at(0)).is_none());
        assert!(buf.add(&distance(22.0), at(20)).is_none());
        assert!(buf.add(&distance(24.0), at(40)).is_none());

        let point = buf.flush(at(60)).unwrap();
        assert_eq!(point.label, "2024-05-01 12:00");
        assert_eq!(point.metrics, vec![MetricSummary { name: "distance".into(), avg: 22.0, peak: 24.0 }]);
        assert!(buf.is_empty());
        assert_eq!(buf.window_start(), None);
    }

    #[test]
    fn test_empty_flush_keeps_window_start() {
        let mut buf = buffer(60, 60);
        assert!(buf.flush(at(0)).is_none());
        assert_eq!(buf.window_start(), None);

        buf.add(&distance(10.0), at(5));
        buf.flush(at(6)).unwrap();
        assert!(buf.flush(at(7)).is_none());

        // next add opens a new window at its own timestamp
        buf.add(&distance(10.0), at(30));
        assert_eq!(buf.window_start(), Some(at(30)));
    }

    #[test]
    fn test_window_closes_on_elapsed_time() {
        let mut buf = buffer(60, 60);
        buf.add(&distance(10.0), at(0));
        let point = buf.add(&distance(30.0), at(60)).unwrap();
        assert_eq!(point.metrics[0].avg, 20.0);
        assert_eq!(point.metrics[0].peak, 30.0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_window_closes_on_sample_cap() {
        let mut buf = buffer(300, 3);
        buf.add(&distance(1.0), at(0));
        buf.add(&distance(2.0), at(1));
        let point = buf.add(&distance(2.0), at(2)).unwrap();
        assert_eq!(point.metrics[0].avg, 1.7);
    }

    #[test]
    fn test_multi_metric_and_missing_metric() {
        let mut buf = AggregationBuffer::new(vec!["temp".into(), "hum".into()], Duration::from_secs(60), 60);
        let climate = |t, h| Reading::new(vec![Measurement::Climate { temperature: t, humidity: h }], t0());

        assert!(buf.add(&distance(5.0), at(0)).is_none());
        assert!(buf.is_empty());

        buf.add(&climate(21.0, 40.0), at(0));
        buf.add(&climate(23.5, 44.0), at(10));
        let point = buf.flush(at(20)).unwrap();
        assert_eq!(point.metrics[0], MetricSummary { name: "temp".into(), avg: 22.3, peak: 23.5 });
        assert_eq!(point.metrics[1], MetricSummary { name: "hum".into(), avg: 42.0, peak: 44.0 });
    }

    #[test]
    fn test_reset_discards_open_window() {
        let mut buf = buffer(60, 60);
        buf.add(&distance(10.0), at(0));
        buf.reset();
        assert!(buf.flush(at(10)).is_none());
    }
}
