//! Caching implementations for catalog types.

use crate::cache::{Cacheable, QueryKey};

use super::types::Product;

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for Product {
  fn cache_key(&self) -> String {
    self.id.clone()
  }
}

// ============================================================================
// Query key types
// ============================================================================

const PRODUCTS: &str = "products";
const PRODUCT: &str = "product";

/// Query key types for catalog API calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogKey {
  /// Product list filtered by a search term
  Products { search: String },
  /// A single product by id
  Product { id: String },
}

impl CatalogKey {
  pub fn products(search: &str) -> Self {
    Self::Products {
      search: search.to_string(),
    }
  }

  pub fn product(id: &str) -> Self {
    Self::Product { id: id.to_string() }
  }

  /// Prefix matching every product list regardless of search term.
  pub fn all_products() -> QueryKey {
    QueryKey::new(PRODUCTS)
  }

  pub fn query_key(&self) -> QueryKey {
    match self {
      Self::Products { search } => QueryKey::new(PRODUCTS).with(normalize_search(search)),
      Self::Product { id } => QueryKey::new(PRODUCT).with(id.as_str()),
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Products { search } if search.trim().is_empty() => "all products".to_string(),
      Self::Products { search } => format!("products matching '{}'", search.trim()),
      Self::Product { id } => format!("product {}", id),
    }
  }
}

impl From<CatalogKey> for QueryKey {
  fn from(key: CatalogKey) -> Self {
    key.query_key()
  }
}

/// Normalize a search term for consistent keys.
/// The server trims and matches case-insensitively, so the cache does too.
fn normalize_search(search: &str) -> String {
  search.trim().to_lowercase()
}
