//! Core modules for boardstack's control plane.
//!
//! Shared primitives live here: configuration, the store handle, the DB
//! broker, schema definitions, and error types.

pub mod assets;
pub mod broker;
pub mod config;
pub mod db;
pub mod env;
pub mod error;
pub mod schemas;
pub mod store;
pub mod time;
