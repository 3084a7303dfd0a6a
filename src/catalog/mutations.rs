//! Optimistic catalog mutations.

use chrono::Utc;

use crate::cache::{CacheData, QueryKey};
use crate::mutation::OptimisticMutation;

use super::api::CatalogApi;
use super::cache::CatalogKey;
use super::error::ApiError;
use super::types::{CreateProductInput, Product};

/// Flip `favorite` on one product.
///
/// Touches the list for the current search and the product's detail entry.
pub struct ToggleFavorite<A> {
  api: A,
  id: String,
  search: String,
}

impl<A: CatalogApi> ToggleFavorite<A> {
  pub fn new(api: A, id: &str, search: &str) -> Self {
    Self {
      api,
      id: id.to_string(),
      search: search.to_string(),
    }
  }
}

impl<A: CatalogApi> OptimisticMutation<Product> for ToggleFavorite<A> {
  type Output = Product;
  type Error = ApiError;

  fn name(&self) -> &'static str {
    "toggle_favorite"
  }

  fn affected_keys(&self) -> Vec<QueryKey> {
    vec![
      CatalogKey::products(&self.search).query_key(),
      CatalogKey::product(&self.id).query_key(),
    ]
  }

  fn invalidation_keys(&self) -> Vec<QueryKey> {
    vec![
      CatalogKey::all_products(),
      CatalogKey::product(&self.id).query_key(),
    ]
  }

  fn speculate(&self, _key: &QueryKey, data: &mut CacheData<Product>) {
    data.update_item(&self.id, |product| product.favorite = !product.favorite);
  }

  async fn execute(&self) -> Result<Product, ApiError> {
    self.api.toggle_favorite(&self.id).await
  }
}

/// Create a product, showing it in the current list under a temporary id
/// until the server assigns the real one.
pub struct CreateProduct<A> {
  api: A,
  input: CreateProductInput,
  search: String,
  temp_id: String,
}

impl<A: CatalogApi> CreateProduct<A> {
  pub fn new(api: A, input: CreateProductInput, search: &str) -> Self {
    Self {
      api,
      input,
      search: search.to_string(),
      temp_id: format!("temp-{}", Utc::now().timestamp_millis()),
    }
  }

  /// Id of the provisional record appended to the list.
  pub fn temp_id(&self) -> &str {
    &self.temp_id
  }
}

impl<A: CatalogApi> OptimisticMutation<Product> for CreateProduct<A> {
  type Output = Product;
  type Error = ApiError;

  fn name(&self) -> &'static str {
    "create_product"
  }

  fn affected_keys(&self) -> Vec<QueryKey> {
    vec![CatalogKey::products(&self.search).query_key()]
  }

  fn invalidation_keys(&self) -> Vec<QueryKey> {
    vec![CatalogKey::all_products()]
  }

  fn speculate(&self, _key: &QueryKey, data: &mut CacheData<Product>) {
    data.push(Product {
      id: self.temp_id.clone(),
      name: self.input.name.clone(),
      price: self.input.price,
      favorite: false,
    });
  }

  async fn execute(&self) -> Result<Product, ApiError> {
    self.api.create_product(&self.input).await
  }
}
