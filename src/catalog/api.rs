use std::future::Future;

use super::error::ApiError;
use super::types::{CreateProductInput, Product};

/// The catalog HTTP surface as seen by the client.
///
/// [`super::CatalogClient`] talks to a real server; tests substitute
/// in-process implementations to force outcomes.
pub trait CatalogApi: Clone + Send + Sync + 'static {
  /// `GET /products?search=`
  fn list_products(&self, search: &str)
    -> impl Future<Output = Result<Vec<Product>, ApiError>> + Send;

  /// `GET /products/:id`
  fn get_product(&self, id: &str) -> impl Future<Output = Result<Product, ApiError>> + Send;

  /// `POST /products/:id/favorite`
  fn toggle_favorite(&self, id: &str) -> impl Future<Output = Result<Product, ApiError>> + Send;

  /// `POST /products`
  fn create_product(
    &self,
    input: &CreateProductInput,
  ) -> impl Future<Output = Result<Product, ApiError>> + Send;
}
