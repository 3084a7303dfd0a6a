//! Optimistic-update query cache for a product catalog, together with the
//! mock catalog API it talks to.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod mutation;
pub mod query;
pub mod server;
