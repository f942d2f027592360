//! ==============================================================================
//! history.rs - historical store (canonical series + tolerant loader)
//! ==============================================================================
//!
//! purpose:
//!     keeps the summarised points of one activity as parallel arrays and
//!     persists them as json:
//!
//!         {"data": {"labels": [...], "avg_<m>": [...], "peak_<m>": [...]},
//!          "last_save": "<rfc3339 or null>"}
//!
//!     every array always has the same length; index i of each is the same
//!     observation. the oldest point is evicted first once max_points is hit.
//!
//! loading:
//!     files written by older versions come in several shapes. an ordered list
//!     of shape parsers is tried and the first match wins:
//!       1. canonical   {labels, avg_x, peak_x}
//!       2. flat        {labels|times|timestamps, x | x_avg | avgX | <long name>}
//!       3. events      [{date, time, x}, ...]
//!     nothing matching (or unreadable json) gives an empty canonical series.
//!     loading never fails.
//!
//! relationships:
//!     - fed by: aggregate.rs (HistoricalPoint)
//!     - owned by: switchboard.rs (one store per activity, shared with monitor.rs)
//!
//! ==============================================================================

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::HistoryConfig;
use crate::error::PersistenceError;

/// label written for new points (window start, local time)
pub const LABEL_FORMAT: &str = "%Y-%m-%d %H:%M";

/// formats tried, in order, when reading a label back as a timestamp
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %I:%M:%S %p",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// time-only labels from older files; assumed to be within the last day
const TIME_FORMATS: [&str; 3] = ["%H:%M", "%H:%M:%S", "%I:%M %p"];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricSummary {
    pub name: String,
    pub avg: f64,
    pub peak: f64,
}

/// one closed aggregation window
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoricalPoint {
    pub label: String,
    pub metrics: Vec<MetricSummary>,
}

fn avg_key(metric: &str) -> String {
    format!("avg_{}", metric)
}

fn peak_key(metric: &str) -> String {
    format!("peak_{}", metric)
}

/// parallel arrays: `labels` plus `avg_<m>` / `peak_<m>` per tracked metric
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistoricalSeries {
    pub labels: Vec<String>,
    #[serde(flatten)]
    pub columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl HistoricalSeries {
    pub fn empty(metrics: &[String]) -> Self {
        let columns = metrics
            .iter()
            .flat_map(|m| [avg_key(m), peak_key(m)])
            .map(|k| (k, Vec::new()))
            .collect();
        Self { labels: Vec::new(), columns }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn column(&self, key: &str) -> Option<&[Option<f64>]> {
        self.columns.get(key).map(Vec::as_slice)
    }

    /// push one point on every array; metrics the point lacks become null
    pub fn append(&mut self, point: &HistoricalPoint, max_len: usize) {
        self.labels.push(point.label.clone());
        for (key, column) in self.columns.iter_mut() {
            let value = point.metrics.iter().find_map(|m| {
                if *key == avg_key(&m.name) {
                    Some(m.avg)
                } else if *key == peak_key(&m.name) {
                    Some(m.peak)
                } else {
                    None
                }
            });
            column.push(value);
        }
        self.trim(max_len);
    }

    /// drop the oldest points until at most `max_len` remain
    pub fn trim(&mut self, max_len: usize) {
        let excess = self.labels.len().saturating_sub(max_len);
        if excess == 0 {
            return;
        }
        self.labels.drain(..excess);
        for column in self.columns.values_mut() {
            let n = excess.min(column.len());
            column.drain(..n);
        }
    }

    /// bring every column to the label count: longer columns lose their
    /// oldest entries, shorter ones are padded with null at the end
    fn normalize(&mut self) {
        let len = self.labels.len();
        for column in self.columns.values_mut() {
            if column.len() > len {
                column.drain(..column.len() - len);
            } else {
                column.resize(len, None);
            }
        }
    }

    /// remove points whose label is older than `horizon`. labels that
    /// cannot be read as a timestamp are kept. returns how many were removed.
    pub fn prune_older_than(&mut self, now: DateTime<Local>, horizon: chrono::Duration) -> usize {
        let cutoff = now - horizon;
        let keep: Vec<bool> = self
            .labels
            .iter()
            .map(|label| parse_label(label, now).map_or(true, |at| at >= cutoff))
            .collect();
        let removed = keep.iter().filter(|k| !**k).count();
        if removed == 0 {
            return 0;
        }

        let mut mask = keep.iter();
        self.labels.retain(|_| *mask.next().unwrap_or(&true));
        for column in self.columns.values_mut() {
            let mut mask = keep.iter();
            column.retain(|_| *mask.next().unwrap_or(&true));
        }
        removed
    }
}

/// best-effort label -> timestamp
pub fn parse_label(label: &str, now: DateTime<Local>) -> Option<DateTime<Local>> {
    let label = label.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(label) {
        return Some(at.with_timezone(&Local));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(label, format) {
            return Local.from_local_datetime(&naive).earliest();
        }
    }
    for format in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(label, format) {
            let today = Local.from_local_datetime(&now.date_naive().and_time(time)).earliest()?;
            return Some(if today > now { today - chrono::Duration::days(1) } else { today });
        }
    }
    None
}

fn parse_timestamp(text: &str) -> Option<DateTime<Local>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Local));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
}

// ==============================================================================
// shape parsers
// ==============================================================================

type ShapeParser = fn(&Value, &[String]) -> Option<HistoricalSeries>;

const SHAPES: [(&str, ShapeParser); 3] = [
    ("canonical", parse_canonical),
    ("flat", parse_flat),
    ("events", parse_events),
];

fn numbers(value: &Value) -> Option<Vec<Option<f64>>> {
    Some(value.as_array()?.iter().map(Value::as_f64).collect())
}

fn strings(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect(),
    )
}

/// alternative name older files used for a metric
fn long_name(metric: &str) -> Option<&'static str> {
    match metric {
        "temp" => Some("temperature"),
        "hum" => Some("humidity"),
        _ => None,
    }
}

fn camel(prefix: &str, metric: &str) -> String {
    let mut chars = metric.chars();
    match chars.next() {
        Some(first) => format!("{}{}{}", prefix, first.to_ascii_uppercase(), chars.as_str()),
        None => prefix.to_string(),
    }
}

fn first_column(obj: &Map<String, Value>, keys: &[String]) -> Option<Vec<Option<f64>>> {
    keys.iter().find_map(|k| obj.get(k).and_then(numbers).filter(|c| !c.is_empty()))
}

fn parse_canonical(body: &Value, metrics: &[String]) -> Option<HistoricalSeries> {
    let obj = body.as_object()?;
    let labels = strings(obj.get("labels")?)?;
    if !metrics.iter().any(|m| obj.contains_key(&avg_key(m))) {
        return None;
    }

    let mut series = HistoricalSeries::empty(metrics);
    series.labels = labels;
    for m in metrics {
        let avg = obj.get(&avg_key(m)).and_then(numbers).unwrap_or_default();
        let peak = obj.get(&peak_key(m)).and_then(numbers).unwrap_or_else(|| avg.clone());
        series.columns.insert(avg_key(m), avg);
        series.columns.insert(peak_key(m), peak);
    }
    Some(series)
}

fn parse_flat(body: &Value, metrics: &[String]) -> Option<HistoricalSeries> {
    let obj = body.as_object()?;
    let mut series = HistoricalSeries::empty(metrics);
    let mut found = false;

    for m in metrics {
        let mut avg_keys = vec![format!("{}_avg", m), camel("avg", m), m.clone()];
        avg_keys.extend(long_name(m).map(str::to_string));
        let peak_keys = [format!("{}_peak", m), camel("peak", m)];

        let Some(avg) = first_column(obj, &avg_keys) else { continue };
        let peak = first_column(obj, &peak_keys).unwrap_or_else(|| avg.clone());
        found = true;
        series.columns.insert(avg_key(m), avg);
        series.columns.insert(peak_key(m), peak);
    }
    if !found {
        return None;
    }

    let labels = ["labels", "times", "timestamps"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(strings).filter(|l| !l.is_empty()));
    series.labels = match labels {
        Some(labels) => labels,
        None => {
            // values without labels: stamp them with the load time
            let len = series.columns.values().map(Vec::len).max().unwrap_or(0);
            vec![Local::now().format(LABEL_FORMAT).to_string(); len]
        }
    };
    Some(series)
}

fn parse_events(body: &Value, metrics: &[String]) -> Option<HistoricalSeries> {
    let entries = body.as_array()?;
    let mut series = HistoricalSeries::empty(metrics);

    for entry in entries.iter().filter_map(Value::as_object) {
        let date = entry.get("date").and_then(Value::as_str).unwrap_or("");
        let time = entry.get("time").and_then(Value::as_str).unwrap_or("");
        let label = format!("{} {}", date, time).trim().to_string();
        let label = if label.is_empty() {
            ["label", "timestamp"]
                .iter()
                .find_map(|k| entry.get(*k).and_then(Value::as_str))
                .unwrap_or("")
                .to_string()
        } else {
            label
        };
        series.labels.push(label);

        for m in metrics {
            let value = [Some(m.as_str()), long_name(m)]
                .into_iter()
                .flatten()
                .find_map(|k| entry.get(k).and_then(Value::as_f64));
            for key in [avg_key(m), peak_key(m)] {
                series.columns.entry(key).or_default().push(value);
            }
        }
    }
    Some(series)
}

/// unwrap the `{"data": ..., "last_save": ...}` envelope and run the shape
/// parsers. always yields a canonical series.
pub fn parse_document(
    raw: &Value,
    metrics: &[String],
    max_points: usize,
) -> (HistoricalSeries, Option<DateTime<Local>>) {
    let body = match raw.get("data") {
        Some(data) if data.is_object() || data.is_array() => data,
        _ => raw,
    };
    let last_save = ["last_save", "lastsave"]
        .iter()
        .find_map(|k| raw.get(*k).and_then(Value::as_str))
        .and_then(parse_timestamp);

    let parsed = SHAPES.iter().find_map(|(shape, parser)| {
        let series = parser(body, metrics)?;
        debug!(shape = *shape, points = series.len(), "history shape matched");
        Some(series)
    });
    let mut series = match parsed {
        Some(series) => series,
        None => {
            warn!("history file has an unknown shape, starting empty");
            HistoricalSeries::empty(metrics)
        }
    };
    series.normalize();
    series.trim(max_points);
    (series, last_save)
}

// ==============================================================================
// store
// ==============================================================================

/// on-disk envelope
#[derive(Serialize)]
struct Document<'a> {
    data: &'a HistoricalSeries,
    last_save: Option<String>,
}

/// the series of one activity plus where it lives on disk
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    metrics: Vec<String>,
    max_points: usize,
    series: HistoricalSeries,
    last_save: Option<DateTime<Local>>,
}

impl HistoryStore {
    pub fn load(config: &HistoryConfig) -> Self {
        Self::open(&config.path, config.metrics.clone(), config.max_points)
    }

    /// read `path` if it exists. never fails: unreadable files give an
    /// empty series.
    pub fn open(path: impl AsRef<Path>, metrics: Vec<String>, max_points: usize) -> Self {
        let path = path.as_ref().to_path_buf();
        let (series, last_save) = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Value>(&text) {
                Ok(raw) => parse_document(&raw, &metrics, max_points),
                Err(e) => {
                    warn!(file = %path.display(), "history file is not valid json ({}), starting empty", e);
                    (HistoricalSeries::empty(&metrics), None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (HistoricalSeries::empty(&metrics), None),
            Err(e) => {
                warn!(file = %path.display(), "could not read history ({}), starting empty", e);
                (HistoricalSeries::empty(&metrics), None)
            }
        };
        info!(file = %path.display(), points = series.len(), "history loaded");
        Self { path, metrics, max_points, series, last_save }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn series(&self) -> &HistoricalSeries {
        &self.series
    }

    pub fn last_save(&self) -> Option<DateTime<Local>> {
        self.last_save
    }

    /// append in memory only; call `save` to persist
    pub fn record(&mut self, point: &HistoricalPoint) {
        self.series.append(point, self.max_points);
    }

    pub fn trim(&mut self, max_len: usize) {
        self.series.trim(max_len);
    }

    pub fn prune(&mut self, now: DateTime<Local>, horizon: chrono::Duration) -> usize {
        self.series.prune_older_than(now, horizon)
    }

    /// write to a sibling temp file, then rename over the real one so a
    /// reader never sees a half-written document
    pub fn save(&mut self) -> Result<(), PersistenceError> {
        let now = Local::now();
        let document = Document { data: &self.series, last_save: Some(now.to_rfc3339()) };
        let bytes = serde_json::to_vec_pretty(&document)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, bytes).map_err(|e| PersistenceError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| PersistenceError::io(&self.path, e))?;
        self.last_save = Some(now);
        debug!(file = %self.path.display(), points = self.series.len(), "history saved");
        Ok(())
    }

    /// empty the series and remove the file
    pub fn clear(&mut self) -> Result<(), PersistenceError> {
        self.series = HistoricalSeries::empty(&self.metrics);
        self.last_save = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::io(&self.path, e)),
        }
    }
}
