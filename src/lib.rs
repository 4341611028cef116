//! Schema Router Library
//!
//! Namespace routing and migration-journal consistency for services that
//! share one PostgreSQL database, each in its own schema.

pub mod catalog;
pub mod config;
pub mod error;
pub mod ident;
pub mod pool;
pub mod registry;
pub mod schema;
