//! Entity Registry Module
//!
//! Replicated multimap registries with pluggable write strategies, and the
//! dual-index entity registry built on top of them.

pub mod entity;
pub mod events;
pub mod local;
pub mod multimap;
pub mod strategy;

pub use entity::{EntityRegistry, RegistryStats, RegistryStatsSnapshot};
pub use events::RegistryEvent;
pub use local::LocalEntityRegistry;
pub use multimap::{ExclusiveWrite, Registry, RegistryValue};
pub use strategy::{NonLocking, StrategyKind, WriteLock, WriteSafe, WriteStrategy};
