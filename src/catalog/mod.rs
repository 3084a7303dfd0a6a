//! Product catalog client.
//!
//! - `CatalogApi`: the HTTP surface, implemented by `CatalogClient`
//! - `CachedCatalog`: cached reads plus optimistic favorite/create
//! - `CatalogKey`: query keys for product lists and product details

mod api;
mod cache;
mod cached_client;
mod client;
mod error;
mod mutations;
mod types;

pub use api::CatalogApi;
pub use cache::CatalogKey;
pub use cached_client::CachedCatalog;
pub use client::CatalogClient;
pub use error::ApiError;
pub use mutations::{CreateProduct, ToggleFavorite};
pub use types::{CreateProductInput, Product};
