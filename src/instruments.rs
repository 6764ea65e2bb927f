//! Service instruments — the four metrics every request updates.
//!
//! Built once at startup from a `Registry`. When the counter-only instrument
//! set is configured, the optional instruments are never registered and their
//! updates become no-ops. With `path_label` on, the request counter and the
//! latency histogram carry one series per request path.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, InstrumentSet};
use crate::metrics::{
    exponential_buckets, Counter, Family, Gauge, Histogram, Opts, Registry, RegistryError,
    DEFAULT_LATENCY_BUCKETS,
};

/// Label carrying the request path when per-path series are enabled.
pub const PATH_LABEL: &str = "endpoint";

/// An instrument that is either one series or one series per request path.
pub enum Series<M> {
    Single(Arc<M>),
    PerPath(Arc<Family<M>>),
}

impl<M> Clone for Series<M> {
    fn clone(&self) -> Self {
        match self {
            Series::Single(m) => Series::Single(Arc::clone(m)),
            Series::PerPath(f) => Series::PerPath(Arc::clone(f)),
        }
    }
}

impl<M> Series<M> {
    /// The series a request for `path` updates.
    pub fn for_path(&self, path: &str) -> Arc<M> {
        match self {
            Series::Single(m) => Arc::clone(m),
            Series::PerPath(family) => family.with_label(path),
        }
    }

    fn all(&self) -> Vec<Arc<M>> {
        match self {
            Series::Single(m) => vec![Arc::clone(m)],
            Series::PerPath(family) => family.members().into_iter().map(|(_, m)| m).collect(),
        }
    }
}

impl Series<Counter> {
    /// Total across every path.
    pub fn get(&self) -> u64 {
        self.all().iter().map(|c| c.get()).sum()
    }
}

impl Series<Histogram> {
    pub fn count(&self) -> u64 {
        self.all().iter().map(|h| h.count()).sum()
    }

    pub fn sum(&self) -> f64 {
        self.all().iter().map(|h| h.sum()).sum()
    }
}

pub struct ServiceMetrics {
    pub requests: Series<Counter>,
    pub latency: Option<Series<Histogram>>,
    pub active: Option<Arc<Gauge>>,
    pub response_size: Option<Arc<Histogram>>,
}

impl ServiceMetrics {
    /// Register the configured instrument set. Any error here is fatal.
    pub fn register(registry: &Registry, config: &Config) -> Result<Self, RegistryError> {
        let prefix = &config.metric_prefix;
        let labels = &config.metric_labels;

        let opts = Opts::new(
            format!("{prefix}_requests_total"),
            "Total number of requests received",
        )
        .labels(labels);
        let requests = if config.path_label {
            Series::PerPath(registry.register_counter_family(opts, PATH_LABEL)?)
        } else {
            Series::Single(registry.register_counter(opts)?)
        };

        if config.instruments == InstrumentSet::Counter {
            return Ok(Self {
                requests,
                latency: None,
                active: None,
                response_size: None,
            });
        }

        let opts = Opts::new(
            format!("{prefix}_response_time_seconds"),
            "Response time in seconds",
        )
        .labels(labels);
        let latency = if config.path_label {
            Series::PerPath(registry.register_histogram_family(
                opts,
                PATH_LABEL,
                &DEFAULT_LATENCY_BUCKETS,
            )?)
        } else {
            Series::Single(registry.register_histogram(opts, &DEFAULT_LATENCY_BUCKETS)?)
        };
        let active = registry.register_gauge(
            Opts::new(
                format!("{prefix}_active_requests"),
                "Requests currently being processed",
            )
            .labels(labels),
        )?;
        let response_size = registry.register_histogram(
            Opts::new(
                format!("{prefix}_response_size_bytes"),
                "Response body size in bytes",
            )
            .labels(labels),
            &exponential_buckets(16.0, 2.0, 8),
        )?;

        Ok(Self {
            requests,
            latency: Some(latency),
            active: Some(active),
            response_size: Some(response_size),
        })
    }

    pub fn count_request(&self, path: &str) {
        self.requests.for_path(path).inc();
    }

    /// Mark a request as in flight until the returned guard is dropped.
    pub fn track_active(&self) -> ActiveRequest {
        if let Some(gauge) = &self.active {
            gauge.inc();
        }
        ActiveRequest {
            gauge: self.active.clone(),
        }
    }

    pub fn observe_response(&self, path: &str, elapsed: Duration, body_len: usize) {
        if let Some(latency) = &self.latency {
            latency.for_path(path).observe_duration(elapsed);
        }
        if let Some(size) = &self.response_size {
            size.observe(body_len as f64);
        }
    }
}

/// RAII guard that decrements the active-request gauge on drop, including
/// when the owning task is cancelled or panics.
pub struct ActiveRequest {
    gauge: Option<Arc<Gauge>>,
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        if let Some(gauge) = &self.gauge {
            gauge.dec();
        }
    }
}
