//! Metrics Registry — lock-free instruments and Prometheus text exposition.
//!
//! Instruments are plain atomics wrapped in `Arc` and handed to whoever updates
//! them; the registry only remembers identities for duplicate detection and
//! for rendering. Updates never touch the registry lock.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Prometheus default latency buckets, in seconds.
pub const DEFAULT_LATENCY_BUCKETS: [f64; 11] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// `count` buckets starting at `start`, each `factor` times the previous.
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    let mut bounds = Vec::with_capacity(count);
    let mut next = start;
    for _ in 0..count {
        bounds.push(next);
        next *= factor;
    }
    bounds
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid metric name '{0}'")]
    InvalidName(String),
    #[error("invalid label name '{label}' on metric '{metric}'")]
    InvalidLabel { metric: String, label: String },
    #[error("label '{label}' appears more than once on metric '{metric}'")]
    DuplicateLabel { metric: String, label: String },
    #[error("label '{label}' is reserved on histogram '{metric}'")]
    ReservedLabel { metric: String, label: String },
    #[error("metric '{0}' is already registered with the same labels")]
    Duplicate(String),
    #[error("metric '{name}' is already registered as a {existing}")]
    TypeConflict { name: String, existing: &'static str },
}

// ─── Instruments ────────────────────────────────────────────────────────────

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Signed gauge. Negative values only appear if inc/dec pairing is broken.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    #[inline]
    pub fn dec(&self) {
        self.add(-1);
    }

    #[inline]
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram. Buckets are counted individually and made
/// cumulative when read, so an observation is a single bucket increment.
#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    /// One slot per bound plus a trailing overflow slot (+Inf).
    counts: Vec<AtomicU64>,
    count: AtomicU64,
    /// f64 bits of the running sum.
    sum: AtomicU64,
}

impl Histogram {
    /// Bounds are sorted and deduplicated; non-finite bounds are dropped
    /// since +Inf is always implied.
    pub fn new(bounds: &[f64]) -> Self {
        let mut bounds: Vec<f64> = bounds.iter().copied().filter(|b| b.is_finite()).collect();
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();
        let counts = (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Record one sample. Negative and NaN samples are recorded as 0.
    pub fn observe(&self, value: f64) {
        let value = value.max(0.0);
        let slot = self.bounds.partition_point(|bound| *bound < value);
        self.counts[slot].fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self
                .sum
                .compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duration in seconds.
    pub fn observe_duration(&self, elapsed: Duration) {
        self.observe(elapsed.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count();
        let sum = self.sum();
        let mut cumulative = 0u64;
        let buckets = self
            .bounds
            .iter()
            .zip(&self.counts)
            .map(|(bound, slot)| {
                cumulative += slot.load(Ordering::Relaxed);
                Bucket {
                    le: *bound,
                    count: cumulative,
                }
            })
            .collect();
        HistogramSnapshot { count, sum, buckets }
    }
}

/// Instruments of one kind that share a name, help text and constant labels,
/// split by the value of one extra label. Members appear on first use.
pub struct Family<M> {
    label: String,
    members: Mutex<HashMap<String, Arc<M>>>,
    make: Box<dyn Fn() -> M + Send + Sync>,
}

impl<M> Family<M> {
    fn new(label: impl Into<String>, make: impl Fn() -> M + Send + Sync + 'static) -> Self {
        Self {
            label: label.into(),
            members: Mutex::new(HashMap::new()),
            make: Box::new(make),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The member for `value`, created the first time the value is seen.
    pub fn with_label(&self, value: &str) -> Arc<M> {
        let mut members = self.lock();
        if let Some(member) = members.get(value) {
            return Arc::clone(member);
        }
        let member = Arc::new((self.make)());
        members.insert(value.to_owned(), Arc::clone(&member));
        member
    }

    /// Every member, ordered by label value.
    pub fn members(&self) -> Vec<(String, Arc<M>)> {
        let mut members: Vec<(String, Arc<M>)> = self
            .lock()
            .iter()
            .map(|(value, member)| (value.clone(), Arc::clone(member)))
            .collect();
        members.sort_by(|a, b| a.0.cmp(&b.0));
        members
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<M>>> {
        self.members.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Snapshots ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Bucket {
    pub le: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    /// Cumulative counts for each finite bound; +Inf equals `count`.
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SampleValue {
    Counter { value: u64 },
    Gauge { value: i64 },
    Histogram(HistogramSnapshot),
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub help: String,
    pub labels: Vec<(String, String)>,
    #[serde(flatten)]
    pub value: SampleValue,
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Fixed identity of an instrument: name, help text, constant labels.
#[derive(Debug, Clone)]
pub struct Opts {
    pub name: String,
    pub help: String,
    pub labels: Vec<(String, String)>,
}

impl Opts {
    pub fn new(name: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            labels: Vec::new(),
        }
    }

    pub fn labels(mut self, labels: &[(String, String)]) -> Self {
        self.labels = labels.to_vec();
        self
    }
}

#[derive(Clone)]
enum Instrument {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
    CounterFamily(Arc<Family<Counter>>),
    HistogramFamily(Arc<Family<Histogram>>),
}

impl Instrument {
    fn kind(&self) -> &'static str {
        match self {
            Instrument::Counter(_) | Instrument::CounterFamily(_) => "counter",
            Instrument::Gauge(_) => "gauge",
            Instrument::Histogram(_) | Instrument::HistogramFamily(_) => "histogram",
        }
    }

    fn family_label(&self) -> Option<&str> {
        match self {
            Instrument::CounterFamily(f) => Some(f.label()),
            Instrument::HistogramFamily(f) => Some(f.label()),
            _ => None,
        }
    }
}

struct Entry {
    opts: Opts,
    instrument: Instrument,
}

/// Set of registered instruments, in registration order.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(&self, opts: Opts) -> Result<Arc<Counter>, RegistryError> {
        let counter = Arc::new(Counter::default());
        self.register(opts, Instrument::Counter(Arc::clone(&counter)))?;
        Ok(counter)
    }

    pub fn register_gauge(&self, opts: Opts) -> Result<Arc<Gauge>, RegistryError> {
        let gauge = Arc::new(Gauge::default());
        self.register(opts, Instrument::Gauge(Arc::clone(&gauge)))?;
        Ok(gauge)
    }

    pub fn register_histogram(
        &self,
        opts: Opts,
        bounds: &[f64],
    ) -> Result<Arc<Histogram>, RegistryError> {
        let histogram = Arc::new(Histogram::new(bounds));
        self.register(opts, Instrument::Histogram(Arc::clone(&histogram)))?;
        Ok(histogram)
    }

    /// Counter split by `label`, e.g. one series per request path.
    pub fn register_counter_family(
        &self,
        opts: Opts,
        label: &str,
    ) -> Result<Arc<Family<Counter>>, RegistryError> {
        let family = Arc::new(Family::new(label, Counter::default));
        self.register(opts, Instrument::CounterFamily(Arc::clone(&family)))?;
        Ok(family)
    }

    /// Histogram split by `label`; every member uses the same bounds.
    pub fn register_histogram_family(
        &self,
        opts: Opts,
        label: &str,
        bounds: &[f64],
    ) -> Result<Arc<Family<Histogram>>, RegistryError> {
        let bounds = bounds.to_vec();
        let family = Arc::new(Family::new(label, move || Histogram::new(&bounds)));
        self.register(opts, Instrument::HistogramFamily(Arc::clone(&family)))?;
        Ok(family)
    }

    fn register(&self, mut opts: Opts, instrument: Instrument) -> Result<(), RegistryError> {
        if !valid_metric_name(&opts.name) {
            return Err(RegistryError::InvalidName(opts.name));
        }
        opts.labels.sort();

        let mut names: Vec<&str> = opts.labels.iter().map(|(k, _)| k.as_str()).collect();
        names.extend(instrument.family_label());
        for (i, &label) in names.iter().enumerate() {
            let metric = opts.name.clone();
            if !valid_label_name(label) {
                let label = label.to_string();
                return Err(RegistryError::InvalidLabel { metric, label });
            }
            if instrument.kind() == "histogram" && label == "le" {
                let label = label.to_string();
                return Err(RegistryError::ReservedLabel { metric, label });
            }
            if names[..i].contains(&label) {
                let label = label.to_string();
                return Err(RegistryError::DuplicateLabel { metric, label });
            }
        }

        let mut entries = self.lock();
        for entry in entries.iter().filter(|e| e.opts.name == opts.name) {
            if entry.instrument.kind() != instrument.kind() {
                return Err(RegistryError::TypeConflict {
                    name: opts.name,
                    existing: entry.instrument.kind(),
                });
            }
            if entry.opts.labels == opts.labels {
                return Err(RegistryError::Duplicate(opts.name));
            }
        }
        entries.push(Entry { opts, instrument });
        Ok(())
    }

    /// Point-in-time view of every instrument. Each instrument is read
    /// independently, so values may skew across instruments under load.
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let entries: Vec<(Opts, Instrument)> = self
            .lock()
            .iter()
            .map(|e| (e.opts.clone(), e.instrument.clone()))
            .collect();

        let mut out = Vec::with_capacity(entries.len());
        for (opts, instrument) in entries {
            match instrument {
                Instrument::Counter(c) => {
                    out.push(sample(&opts, None, SampleValue::Counter { value: c.get() }));
                }
                Instrument::Gauge(g) => {
                    out.push(sample(&opts, None, SampleValue::Gauge { value: g.get() }));
                }
                Instrument::Histogram(h) => {
                    out.push(sample(&opts, None, SampleValue::Histogram(h.snapshot())));
                }
                Instrument::CounterFamily(family) => {
                    for (value, c) in family.members() {
                        let label = Some((family.label(), value));
                        out.push(sample(&opts, label, SampleValue::Counter { value: c.get() }));
                    }
                }
                Instrument::HistogramFamily(family) => {
                    for (value, h) in family.members() {
                        let label = Some((family.label(), value));
                        out.push(sample(&opts, label, SampleValue::Histogram(h.snapshot())));
                    }
                }
            }
        }
        out
    }

    /// Prometheus text exposition format (0.0.4).
    pub fn render(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::with_capacity(2048);

        // Group by name, keeping first-registration order.
        let mut order: Vec<&str> = Vec::new();
        let mut groups: HashMap<&str, Vec<&MetricSnapshot>> = HashMap::new();
        for metric in &snapshot {
            groups
                .entry(metric.name.as_str())
                .or_insert_with(|| {
                    order.push(metric.name.as_str());
                    Vec::new()
                })
                .push(metric);
        }

        for name in order {
            let family = &groups[name];
            let first = family[0];
            let kind = match first.value {
                SampleValue::Counter { .. } => "counter",
                SampleValue::Gauge { .. } => "gauge",
                SampleValue::Histogram(_) => "histogram",
            };
            let _ = writeln!(out, "# HELP {name} {}", escape_help(&first.help));
            let _ = writeln!(out, "# TYPE {name} {kind}");

            for metric in family {
                let labels = format_labels(&metric.labels);
                match &metric.value {
                    SampleValue::Counter { value } => push_sample(&mut out, name, &labels, value),
                    SampleValue::Gauge { value } => push_sample(&mut out, name, &labels, value),
                    SampleValue::Histogram(h) => {
                        let bucket_name = format!("{name}_bucket");
                        for bucket in &h.buckets {
                            let le = join_labels(&labels, &format!("le=\"{}\"", bucket.le));
                            push_sample(&mut out, &bucket_name, &le, bucket.count);
                        }
                        let inf = join_labels(&labels, "le=\"+Inf\"");
                        push_sample(&mut out, &bucket_name, &inf, h.count);
                        push_sample(&mut out, &format!("{name}_sum"), &labels, h.sum);
                        push_sample(&mut out, &format!("{name}_count"), &labels, h.count);
                    }
                }
            }
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        // Entries are only appended; a poisoned lock still holds a valid list.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sample(opts: &Opts, extra: Option<(&str, String)>, value: SampleValue) -> MetricSnapshot {
    let mut labels = opts.labels.clone();
    if let Some((name, value)) = extra {
        labels.push((name.to_string(), value));
        labels.sort();
    }
    MetricSnapshot {
        name: opts.name.clone(),
        help: opts.help.clone(),
        labels,
        value,
    }
}

fn push_sample(out: &mut String, name: &str, labels: &str, value: impl std::fmt::Display) {
    if labels.is_empty() {
        let _ = writeln!(out, "{name} {value}");
    } else {
        let _ = writeln!(out, "{name}{{{labels}}} {value}");
    }
}

fn format_labels(labels: &[(String, String)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn join_labels(labels: &str, extra: &str) -> String {
    if labels.is_empty() {
        extra.to_string()
    } else {
        format!("{labels},{extra}")
    }
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn escape_help(v: &str) -> String {
    v.replace('\\', "\\\\").replace('\n', "\\n")
}

pub fn valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

pub fn valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─── Tests ──────────────────────────────────────────────────────────────────
