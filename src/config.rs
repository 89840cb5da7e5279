//! Configuration
//!
//! Settings for the entity registry and the cleanup coordinator. Every field
//! has a default, so a config file only needs to name what it changes.
//!
//! ```yaml
//! registry:
//!   forward_map: entity-registry.forward
//!   write_lock_timeout_ms: 2000
//! coordinator:
//!   min_interval_ms: 1000
//!   max_interval_ms: 60000
//!   max_batch: 100
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Registry Configuration
// =============================================================================

/// Configuration for the dual-index entity registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Shared map holding the forward index (entity type → qualified names)
    pub forward_map: String,
    /// Shared map holding the reverse index (node id → records)
    pub clustering_map: String,
    /// Timeout for the forward index write lock
    pub write_lock_timeout_ms: u64,
    /// Compare-and-swap attempts before a reverse index write gives up
    pub cas_max_attempts: u32,
    /// Event channel capacity
    pub event_channel_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            forward_map: "entity-registry.forward".to_string(),
            clustering_map: "entity-registry.clustering".to_string(),
            write_lock_timeout_ms: 2_000,
            cas_max_attempts: 64,
            event_channel_capacity: 1024,
        }
    }
}

impl RegistryConfig {
    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.forward_map.is_empty() || self.clustering_map.is_empty() {
            return Err(Error::Configuration("registry map names must not be empty".into()));
        }
        if self.forward_map == self.clustering_map {
            return Err(Error::Configuration(format!(
                "forward and clustering maps must differ (both {})",
                self.forward_map
            )));
        }
        if self.cas_max_attempts == 0 {
            return Err(Error::Configuration("cas_max_attempts must be at least 1".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Configuration("event_channel_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Coordinator Configuration
// =============================================================================

/// Configuration for the cleanup coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Cluster-wide lock serializing cleanup cycles
    pub lock_name: String,
    /// How long a cycle waits for the cleanup lock
    pub lock_timeout_ms: u64,
    /// Lower bound of the adaptive interval
    pub min_interval_ms: u64,
    /// Upper bound of the adaptive interval
    pub max_interval_ms: u64,
    /// Interval of the first cycle
    pub initial_interval_ms: u64,
    /// Smallest random delay added to each cycle
    pub jitter_min_ms: u64,
    /// Largest random delay added to each cycle
    pub jitter_max_ms: u64,
    /// Stale nodes removed per cycle at most
    pub max_batch: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_name: "entity-registry.cleanup".to_string(),
            lock_timeout_ms: 500,
            min_interval_ms: 1_000,
            max_interval_ms: 60_000,
            initial_interval_ms: 5_000,
            jitter_min_ms: 0,
            jitter_max_ms: 1_000,
            max_batch: 100,
        }
    }
}

impl CoordinatorConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_name.is_empty() {
            return Err(Error::Configuration("coordinator lock_name must not be empty".into()));
        }
        if self.min_interval_ms == 0 {
            return Err(Error::Configuration("min_interval_ms must be positive".into()));
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err(Error::Configuration(format!(
                "min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if !(self.min_interval_ms..=self.max_interval_ms).contains(&self.initial_interval_ms) {
            return Err(Error::Configuration(format!(
                "initial_interval_ms ({}) outside [{}, {}]",
                self.initial_interval_ms, self.min_interval_ms, self.max_interval_ms
            )));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(Error::Configuration(format!(
                "jitter_min_ms ({}) exceeds jitter_max_ms ({})",
                self.jitter_min_ms, self.jitter_max_ms
            )));
        }
        if self.max_batch == 0 {
            return Err(Error::Configuration("max_batch must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Cluster Configuration
// =============================================================================

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub registry: RegistryConfig,
    pub coordinator: CoordinatorConfig,
}

impl ClusterConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.coordinator.validate()
    }
}
