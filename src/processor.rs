//! Request Processor — one inbound request in, one response body out.
//!
//! Per request: count it, mark it active, borrow a buffer, sleep for a random
//! slice of the configured delay range, write the greeting into the buffer,
//! observe latency and size, and hand the buffer itself out as the body. The
//! buffer returns to the pool, and the request stops counting as active, once
//! the transport has written the body and dropped it.

use bytes::Bytes;
use rand::Rng;
use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::instruments::{ActiveRequest, ServiceMetrics};
use crate::pool::{BufferPool, PooledBuffer};

const BODY_PREFIX: &str = "Hello, world! Processed in ";
const BODY_SUFFIX: &str = "\n";

/// Inclusive range of simulated work time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Uniform sample in `[min, max]`, at nanosecond resolution.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        let lo = self.min.as_nanos() as u64;
        let hi = self.max.as_nanos() as u64;
        Duration::from_nanos(rng.gen_range(lo..=hi))
    }
}

/// What a request holds until its response bytes are released.
struct RequestContext {
    buffer: PooledBuffer,
    _active: ActiveRequest,
}

impl AsRef<[u8]> for RequestContext {
    fn as_ref(&self) -> &[u8] {
        &self.buffer[..]
    }
}

pub struct Processor {
    metrics: Arc<ServiceMetrics>,
    pool: Arc<BufferPool>,
    delay: DelayRange,
}

impl Processor {
    pub fn new(metrics: Arc<ServiceMetrics>, pool: Arc<BufferPool>, delay: DelayRange) -> Self {
        Self {
            metrics,
            pool,
            delay,
        }
    }

    pub fn delay(&self) -> DelayRange {
        self.delay
    }

    /// Process one request and return the response body. Infallible: the
    /// only failure mode (client gone) happens after this returns.
    ///
    /// The returned `Bytes` is backed by the pooled buffer, not a copy.
    pub async fn process(&self, path: &str) -> Bytes {
        let started = Instant::now();
        self.metrics.count_request(path);

        let mut ctx = RequestContext {
            _active: self.metrics.track_active(),
            buffer: self.pool.acquire(),
        };

        let pause = self.delay.sample(&mut rand::thread_rng());
        tokio::time::sleep(pause).await;

        let elapsed = started.elapsed();
        // Infallible: BytesMut grows as needed.
        let _ = write!(
            &mut *ctx.buffer,
            "{BODY_PREFIX}{}{BODY_SUFFIX}",
            HumanDuration(elapsed)
        );

        self.metrics.observe_response(path, elapsed, ctx.buffer.len());
        info!(path = %path, elapsed = %HumanDuration(elapsed), "processed request");

        Bytes::from_owner(ctx)
    }
}

/// Duration formatted like `42.123456ms`, `1.5µs`, `1m30s`.
#[derive(Debug, Clone, Copy)]
pub struct HumanDuration(pub Duration);

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }
        if nanos < 1_000 {
            return write!(f, "{nanos}ns");
        }
        if nanos < 1_000_000 {
            return write_scaled(f, nanos, 1_000, "µs");
        }
        if nanos < 1_000_000_000 {
            return write_scaled(f, nanos, 1_000_000, "ms");
        }

        let total_secs = self.0.as_secs();
        let hours = total_secs / 3600;
        let minutes = (total_secs % 3600) / 60;
        let secs = u128::from(total_secs % 60);
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        let rest = secs * 1_000_000_000 + u128::from(self.0.subsec_nanos());
        write_scaled(f, rest, 1_000_000_000, "s")
    }
}

/// Write `value / unit` with the fractional part trimmed of trailing zeros.
fn write_scaled(f: &mut fmt::Formatter<'_>, value: u128, unit: u128, suffix: &str) -> fmt::Result {
    let whole = value / unit;
    let mut frac = value % unit;
    if frac == 0 {
        return write!(f, "{whole}{suffix}");
    }
    let mut width = unit.ilog10() as usize;
    while frac % 10 == 0 {
        frac /= 10;
        width -= 1;
    }
    write!(f, "{whole}.{frac:0width$}{suffix}")
}

// ─── Tests ──────────────────────────────────────────────────────────────────
