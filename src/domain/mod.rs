//! Domain layer - Registry types and cluster ports
//!
//! Node and registration types plus the traits the registry consumes
//! (shared maps, locks, membership) and offers (directory, node awareness,
//! lifecycle).

pub mod ports;

pub use ports::*;
