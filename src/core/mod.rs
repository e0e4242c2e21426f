//! Core types: configuration, errors, runtime orchestration.

pub mod config;
pub mod error;
pub mod runtime;
