//! Gantry Core
//!
//! Core types and abstractions for the Gantry CI runner.
//!
//! This crate contains:
//! - Domain types: Core business entities (jobs, variables, stages, runners)
//! - DTOs: Data transfer objects exchanged with the coordinator
//! - Feature flags: Known flags with defaults, resolved per runner

pub mod domain;
pub mod dto;
pub mod features;
