//! graphgate-core: Shared types, configuration, and error handling for graphgate.
//!
//! This crate provides the foundational types used across the access layer:
//! - Entity, relationship, and mutation types passed in by the calling pipeline
//! - Cache tier identifiers and their fixed lock / eviction orders
//! - The immutable access configuration and its validation
//! - The error taxonomy surfaced to callers

pub mod config;
pub mod error;
pub mod types;

pub use config::{AccessConfig, ThresholdConfig, TierConfig, TierConfigs};
pub use error::{AccessError, Result};
pub use types::{
    Entity, EntityId, Mutation, Relationship, SearchRequest, TierKind, TraversalRequest,
};
