//! Process-wide context: registry, instruments, buffer pool, processor.
//!
//! Built once in `server::run` and cloned into every handler. Tests build
//! their own so each gets an isolated registry and pool.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::instruments::ServiceMetrics;
use crate::metrics::{Registry, RegistryError};
use crate::pool::BufferPool;
use crate::processor::{DelayRange, Processor};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub metrics: Arc<ServiceMetrics>,
    pub pool: Arc<BufferPool>,
    pub processor: Arc<Processor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self, RegistryError> {
        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(ServiceMetrics::register(&registry, config)?);
        let pool = Arc::new(BufferPool::new(config.buffer_capacity, config.pool_max_idle));
        let (min, max) = config.delay_range();
        let processor = Arc::new(Processor::new(
            Arc::clone(&metrics),
            Arc::clone(&pool),
            DelayRange::new(min, max),
        ));
        Ok(Self {
            registry,
            metrics,
            pool,
            processor,
            started_at: Instant::now(),
        })
    }
}
