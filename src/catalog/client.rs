use color_eyre::{eyre::eyre, Result};
use reqwest::Response;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;

use super::api::CatalogApi;
use super::error::ApiError;
use super::types::{CreateProductInput, Product};

/// Catalog API client wrapper
#[derive(Clone)]
pub struct CatalogClient {
  http: reqwest::Client,
  base_url: Url,
}

impl CatalogClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_base_url(
      &config.api.base_url,
      Duration::from_millis(config.api.timeout_ms),
    )
  }

  /// Create a client for the API rooted at `base_url` (e.g. `http://localhost:3001/api`).
  pub fn with_base_url(base_url: &str, timeout: Duration) -> Result<Self> {
    let mut url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;
    if url.cannot_be_a_base() {
      return Err(eyre!("Invalid API base URL {}: not a hierarchical URL", base_url));
    }
    // Drop any trailing slash so segments can be pushed uniformly
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Invalid API base URL {}", base_url))?
      .pop_if_empty();

    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url: url,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  /// Build `<base>/<segments...>`.
  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.extend(segments);
    }
    url
  }

  /// Check the status and decode the JSON body.
  async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
      return Err(ApiError::from_status(status.as_u16(), &body));
    }

    serde_json::from_str(&body).map_err(|e| ApiError::MalformedResponse(e.to_string()))
  }
}

impl CatalogApi for CatalogClient {
  async fn list_products(&self, search: &str) -> Result<Vec<Product>, ApiError> {
    let mut url = self.endpoint(&["products"]);
    url.query_pairs_mut().append_pair("search", search);
    debug!(url = %url, "GET products");

    let response = self.http.get(url).send().await?;
    Self::decode(response).await
  }

  async fn get_product(&self, id: &str) -> Result<Product, ApiError> {
    let url = self.endpoint(&["products", id]);
    debug!(url = %url, "GET product");

    let response = self.http.get(url).send().await?;
    Self::decode(response).await
  }

  async fn toggle_favorite(&self, id: &str) -> Result<Product, ApiError> {
    let url = self.endpoint(&["products", id, "favorite"]);
    debug!(url = %url, "POST favorite");

    let response = self.http.post(url).send().await?;
    Self::decode(response).await
  }

  async fn create_product(&self, input: &CreateProductInput) -> Result<Product, ApiError> {
    let url = self.endpoint(&["products"]);
    debug!(url = %url, name = %input.name, "POST product");

    let response = self.http.post(url).json(input).send().await?;
    Self::decode(response).await
  }
}
