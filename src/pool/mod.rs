//! Connection routing
//!
//! Search-order computation, migrate authorization and the pools that carry
//! a service's search order on every connection.

mod configurator;
mod manager;
mod router;

pub use configurator::{ConnectionConfigurator, SearchOrder};
pub use manager::PoolManager;
pub use router::RoutingDecisionEngine;
