//! Tracker configuration.
//!
//! Values come from [`TrackerConfig::default`], builder-style `with_*`
//! setters, serde (e.g. a JSON config section) or `DIAL9_CONTEXT_*`
//! environment variables.

use crate::context::alloc::{Allocator, HeapAllocator};
use crate::context::encoder::{DATA_CHUNK_HEADER_LEN, FIXED_PROLOGUE_LEN};
use crate::context::error::{Error, Result};
use crate::context::leb128::MAX_VARINT_LEN;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const ENV_MAX_SIZE: &str = "DIAL9_CONTEXT_MAX_SIZE";
pub const ENV_MAX_THREADS: &str = "DIAL9_CONTEXT_MAX_THREADS";
pub const ENV_CHUNK_SIZE: &str = "DIAL9_CONTEXT_CHUNK_SIZE";
pub const ENV_MEMORY_LIMIT: &str = "DIAL9_CONTEXT_MEMORY_LIMIT";
pub const ENV_ALLOCATOR: &str = "DIAL9_CONTEXT_ALLOCATOR";
pub const ENV_INACTIVITY_MS: &str = "DIAL9_CONTEXT_INACTIVITY_MS";
pub const ENV_GRANULARITY_MS: &str = "DIAL9_CONTEXT_GRANULARITY_MS";
pub const ENV_EXPIRATION_CAPACITY: &str = "DIAL9_CONTEXT_EXPIRATION_CAPACITY";
pub const ENV_MAX_IN_FLIGHT: &str = "DIAL9_CONTEXT_MAX_IN_FLIGHT";

/// Largest possible empty blob: fixed prologue, base and multiplier varints
/// of any width, a one-byte thread count and the bitmap offset.
pub const MIN_BLOB_LEN: usize =
    FIXED_PROLOGUE_LEN + 2 * MAX_VARINT_LEN + 1 + DATA_CHUNK_HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    #[default]
    Heap,
    /// Anonymous memory mapping outside of the Rust heap (unix only).
    Direct,
}

impl FromStr for AllocatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heap" => Ok(AllocatorKind::Heap),
            "direct" => Ok(AllocatorKind::Direct),
            other => Err(Error::invalid_config(format!("unknown allocator '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Hard cap in bytes on one persisted blob.
    pub max_data_size: usize,
    /// Distinct threads a single tracker accepts.
    pub max_threads: usize,
    pub chunk_size: usize,
    /// Capacity of the shared chunk pool in bytes.
    pub memory_limit: usize,
    pub allocator: AllocatorKind,
    /// Inactivity window after which a tracker is released. Zero disables it.
    #[serde(deserialize_with = "millis")]
    pub inactivity_timeout: Duration,
    #[serde(deserialize_with = "millis")]
    pub expiration_granularity: Duration,
    /// Total number of trackers the expiration ring can hold.
    pub expiration_capacity: usize,
    /// Live trackers per factory, 0 means unbounded.
    pub max_in_flight: usize,
}

fn millis<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_data_size: 5000,
            max_threads: 64,
            chunk_size: 512,
            memory_limit: 32 * 1024 * 1024,
            allocator: AllocatorKind::Heap,
            inactivity_timeout: Duration::from_secs(120),
            expiration_granularity: Duration::from_secs(1),
            expiration_capacity: 65536,
            max_in_flight: 0,
        }
    }
}

impl TrackerConfig {
    pub fn with_max_data_size(mut self, bytes: usize) -> Self {
        self.max_data_size = bytes;
        self
    }

    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_allocator(mut self, kind: AllocatorKind) -> Self {
        self.allocator = kind;
        self
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn with_expiration_granularity(mut self, granularity: Duration) -> Self {
        self.expiration_granularity = granularity;
        self
    }

    pub fn with_expiration_capacity(mut self, capacity: usize) -> Self {
        self.expiration_capacity = capacity;
        self
    }

    pub fn with_max_in_flight(mut self, trackers: usize) -> Self {
        self.max_in_flight = trackers;
        self
    }

    /// Defaults overridden by the `DIAL9_CONTEXT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| Error::invalid_config(format!("{key}: cannot parse '{raw}'")))
        }

        let mut config = Self::default();
        if let Some(v) = lookup(ENV_MAX_SIZE) {
            config.max_data_size = parse(ENV_MAX_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_THREADS) {
            config.max_threads = parse(ENV_MAX_THREADS, &v)?;
        }
        if let Some(v) = lookup(ENV_CHUNK_SIZE) {
            config.chunk_size = parse(ENV_CHUNK_SIZE, &v)?;
        }
        if let Some(v) = lookup(ENV_MEMORY_LIMIT) {
            config.memory_limit = parse(ENV_MEMORY_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_ALLOCATOR) {
            config.allocator = v.parse()?;
        }
        if let Some(v) = lookup(ENV_INACTIVITY_MS) {
            config.inactivity_timeout = Duration::from_millis(parse(ENV_INACTIVITY_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_GRANULARITY_MS) {
            config.expiration_granularity = Duration::from_millis(parse(ENV_GRANULARITY_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_EXPIRATION_CAPACITY) {
            config.expiration_capacity = parse(ENV_EXPIRATION_CAPACITY, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_IN_FLIGHT) {
            config.max_in_flight = parse(ENV_MAX_IN_FLIGHT, &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size % 8 != 0 {
            return Err(Error::invalid_config(format!(
                "chunk size {} is not a positive multiple of 8",
                self.chunk_size
            )));
        }
        if self.memory_limit < self.chunk_size {
            return Err(Error::invalid_config(format!(
                "memory limit {} is smaller than one chunk ({})",
                self.memory_limit, self.chunk_size
            )));
        }
        if self.max_data_size < MIN_BLOB_LEN {
            return Err(Error::invalid_config(format!(
                "max data size {} cannot hold an empty blob",
                self.max_data_size
            )));
        }
        if self.expiration_granularity.is_zero() {
            return Err(Error::invalid_config("expiration granularity is zero"));
        }
        if !self.inactivity_timeout.is_zero()
            && self.expiration_granularity >= self.inactivity_timeout
        {
            return Err(Error::invalid_config(format!(
                "expiration granularity {:?} is not smaller than the inactivity timeout {:?}",
                self.expiration_granularity, self.inactivity_timeout
            )));
        }
        Ok(())
    }

    /// Build the chunk allocator this configuration describes.
    pub fn build_allocator(&self) -> Result<Arc<dyn Allocator>> {
        match self.allocator {
            AllocatorKind::Heap => Ok(Arc::new(HeapAllocator::new(
                self.memory_limit,
                self.chunk_size,
            )?)),
            #[cfg(unix)]
            AllocatorKind::Direct => Ok(Arc::new(crate::context::alloc::DirectAllocator::new(
                self.memory_limit,
                self.chunk_size,
            )?)),
            #[cfg(not(unix))]
            AllocatorKind::Direct => Err(Error::invalid_config(
                "direct allocator is only available on unix",
            )),
        }
    }
}
