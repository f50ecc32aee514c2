//! Read/write token buckets
//!
//! Every request through the gateway holds one permit from the bucket
//! matching its direction for the whole request-plus-response, including
//! retries. Permits are RAII; release on error paths is the drop.

use glidesync_core::InstanceConfig;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Which bucket a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// GET and HEAD are reads; everything else mutates.
    pub fn of(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD => Direction::Read,
            _ => Direction::Write,
        }
    }
}

/// Two independent token buckets gating transport calls.
pub struct RateLimiter {
    read: Arc<Semaphore>,
    write: Arc<Semaphore>,
    read_limit: usize,
    write_limit: usize,
}

impl RateLimiter {
    pub fn new(read_limit: usize, write_limit: usize) -> Self {
        Self {
            read: Arc::new(Semaphore::new(read_limit)),
            write: Arc::new(Semaphore::new(write_limit)),
            read_limit,
            write_limit,
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(config.read_concurrency, config.write_concurrency)
    }

    /// Acquire one permit, suspending while the bucket is saturated.
    pub async fn acquire(&self, direction: Direction) -> OwnedSemaphorePermit {
        let bucket = match direction {
            Direction::Read => self.read.clone(),
            Direction::Write => self.write.clone(),
        };
        // The semaphores are never closed, so acquisition only fails if
        // the limiter itself is torn down mid-flight.
        bucket
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("rate limiter semaphore closed"))
    }

    /// Live count of in-flight requests for a direction.
    pub fn in_flight(&self, direction: Direction) -> usize {
        match direction {
            Direction::Read => self.read_limit - self.read.available_permits(),
            Direction::Write => self.write_limit - self.write.available_permits(),
        }
    }
}
