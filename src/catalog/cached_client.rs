//! Cached catalog client that wraps a [`CatalogApi`] with transparent caching
//! and optimistic mutations.

use color_eyre::{eyre::eyre, Report, Result};
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{fetcher, CacheData, CacheLayer, Fetcher, QueryStore};
use crate::config::Config;
use crate::mutation::{MutationCoordinator, MutationOutcome};
use crate::query::Query;

use super::api::CatalogApi;
use super::cache::CatalogKey;
use super::client::CatalogClient;
use super::error::ApiError;
use super::mutations::{CreateProduct, ToggleFavorite};
use super::types::{CreateProductInput, Product};

/// Catalog client with transparent caching support.
///
/// Reads go through the cache layer; `toggle_favorite` and `create_product`
/// edit the cache before the request is sent and roll back if it fails.
#[derive(Clone)]
pub struct CachedCatalog<A: CatalogApi> {
  api: A,
  cache: CacheLayer<Product>,
  mutations: MutationCoordinator<Product>,
}

impl CachedCatalog<CatalogClient> {
  /// Create a cached HTTP client from configuration.
  pub fn from_config(config: &Config) -> Result<Self> {
    let api = CatalogClient::new(config)?;
    let stale_time =
      chrono::Duration::milliseconds(i64::try_from(config.cache.stale_time_ms).unwrap_or(i64::MAX));
    let cache = CacheLayer::new(QueryStore::new())
      .with_stale_time(stale_time)
      .with_retry(
        config.cache.retry,
        Duration::from_millis(config.cache.retry_delay_ms),
      );

    Ok(Self::new(api, cache).with_serialized_mutations(config.mutations.serialize))
  }
}

impl<A: CatalogApi> CachedCatalog<A> {
  pub fn new(api: A, cache: CacheLayer<Product>) -> Self {
    let mutations = MutationCoordinator::new(cache.clone());
    Self {
      api,
      cache,
      mutations,
    }
  }

  /// Queue mutations on the same keys (default) or let them interleave.
  pub fn with_serialized_mutations(mut self, serialize: bool) -> Self {
    self.mutations = self.mutations.with_serialization(serialize);
    self
  }

  pub fn cache(&self) -> &CacheLayer<Product> {
    &self.cache
  }

  fn products_fetcher(&self, search: &str) -> Fetcher<Product> {
    let api = self.api.clone();
    let search = search.to_string();
    fetcher(move || {
      let api = api.clone();
      let search = search.clone();
      async move {
        api
          .list_products(&search)
          .await
          .map(CacheData::Many)
          .map_err(Report::new)
      }
    })
  }

  fn product_fetcher(&self, id: &str) -> Fetcher<Product> {
    let api = self.api.clone();
    let id = id.to_string();
    fetcher(move || {
      let api = api.clone();
      let id = id.clone();
      async move {
        api
          .get_product(&id)
          .await
          .map(CacheData::One)
          .map_err(Report::new)
      }
    })
  }

  /// Products matching `search`, with caching.
  pub async fn products(&self, search: &str) -> Result<Vec<Product>> {
    let key = CatalogKey::products(search).query_key();
    let result = self
      .cache
      .fetch_with(&key, self.products_fetcher(search))
      .await?;

    Ok(result.data.into_vec())
  }

  /// A single product by id, with caching.
  pub async fn product(&self, id: &str) -> Result<Product> {
    let key = CatalogKey::product(id).query_key();
    let result = self.cache.fetch_with(&key, self.product_fetcher(id)).await?;

    result
      .data
      .into_one()
      .ok_or_else(|| eyre!("Cache entry {} does not hold a single product", key))
  }

  /// The list record for `id` under the current search, if cached.
  ///
  /// Shown while the product's own entry loads.
  pub fn placeholder(&self, id: &str, search: &str) -> Result<Option<Product>> {
    let key = CatalogKey::products(search).query_key();
    Ok(
      self
        .cache
        .store()
        .read(&key)?
        .and_then(|data| data.find(id).cloned()),
    )
  }

  /// Observe the product list for `search`.
  pub fn products_query(&self, search: &str) -> Result<Query<Product>> {
    Query::new(
      self.cache.clone(),
      CatalogKey::products(search).query_key(),
      self.products_fetcher(search),
    )
  }

  /// Observe one product, using its list record as placeholder data.
  pub fn product_query(&self, id: &str, search: &str) -> Result<Query<Product>> {
    let placeholder = self.placeholder(id, search)?.map(CacheData::One);
    let query = Query::new(
      self.cache.clone(),
      CatalogKey::product(id).query_key(),
      self.product_fetcher(id),
    )?;

    Ok(query.with_placeholder(placeholder))
  }

  /// Flip the favorite flag on `id`, optimistically.
  pub async fn toggle_favorite(&self, id: &str, search: &str) -> MutationOutcome<Product, ApiError> {
    let mutation = ToggleFavorite::new(self.api.clone(), id, search);
    let outcome = self.mutations.mutate(&mutation).await;

    match &outcome.result {
      Ok(product) => info!(id = %product.id, favorite = product.favorite, "favorite toggled"),
      Err(e) => warn!(%id, error = %e, "favorite toggle rolled back"),
    }
    outcome
  }

  /// Create a product, optimistically appending it to the list for `search`.
  pub async fn create_product(
    &self,
    input: CreateProductInput,
    search: &str,
  ) -> MutationOutcome<Product, ApiError> {
    let mutation = CreateProduct::new(self.api.clone(), input, search);
    let outcome = self.mutations.mutate(&mutation).await;

    match &outcome.result {
      Ok(product) => info!(
        id = %product.id,
        temp_id = mutation.temp_id(),
        "product created"
      ),
      Err(e) => warn!(temp_id = mutation.temp_id(), error = %e, "product creation rolled back"),
    }
    outcome
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::QueryKey;
  use crate::mutation::MutationError;
  use crate::server::{AlwaysFail, FaultInjector, NoFaults, Operation, ProductDb};
  use std::sync::{Arc, Mutex};
  use tokio::sync::Notify;

  /// In-process catalog backed by the mock server's product table.
  #[derive(Clone)]
  struct FakeCatalog {
    db: Arc<Mutex<ProductDb>>,
    faults: Arc<dyn FaultInjector>,
    gate: Option<Arc<Notify>>,
    list_delay: Duration,
  }

  impl FakeCatalog {
    async fn hold(&self) {
      if let Some(gate) = &self.gate {
        gate.notified().await;
      }
    }
  }

  impl CatalogApi for FakeCatalog {
    async fn list_products(&self, search: &str) -> Result<Vec<Product>, ApiError> {
      if !self.list_delay.is_zero() {
        tokio::time::sleep(self.list_delay).await;
      }
      let products = self.db.lock().unwrap().search(search);
      Ok(products)
    }

    async fn get_product(&self, id: &str) -> Result<Product, ApiError> {
      let product = self.db.lock().unwrap().get(id).cloned();
      product.ok_or_else(|| ApiError::NotFound("Not found".to_string()))
    }

    async fn toggle_favorite(&self, id: &str) -> Result<Product, ApiError> {
      self.hold().await;
      if self.faults.should_fail(Operation::ToggleFavorite) {
        return Err(ApiError::TransientServerFault {
          status: 500,
          message: "Random server error".to_string(),
        });
      }
      let product = self.db.lock().unwrap().toggle_favorite(id);
      product.ok_or_else(|| ApiError::NotFound("Not found".to_string()))
    }

    async fn create_product(&self, input: &CreateProductInput) -> Result<Product, ApiError> {
      self.hold().await;
      if self.faults.should_fail(Operation::CreateProduct) {
        return Err(ApiError::TransientServerFault {
          status: 500,
          message: "Failed to create product".to_string(),
        });
      }
      let product = self.db.lock().unwrap().create(input.clone());
      product.ok_or_else(|| ApiError::InvalidInput("Invalid input".to_string()))
    }
  }

  fn catalog(
    faults: impl FaultInjector + 'static,
    gate: Option<Arc<Notify>>,
  ) -> CachedCatalog<FakeCatalog> {
    slow_catalog(faults, gate, Duration::ZERO)
  }

  fn slow_catalog(
    faults: impl FaultInjector + 'static,
    gate: Option<Arc<Notify>>,
    list_delay: Duration,
  ) -> CachedCatalog<FakeCatalog> {
    let api = FakeCatalog {
      db: Arc::new(Mutex::new(ProductDb::seeded())),
      faults: Arc::new(faults),
      gate,
      list_delay,
    };
    CachedCatalog::new(
      api,
      CacheLayer::new(QueryStore::new()).with_retry(0, Duration::ZERO),
    )
  }

  fn list_key(search: &str) -> QueryKey {
    CatalogKey::products(search).query_key()
  }

  fn cached(catalog: &CachedCatalog<FakeCatalog>, key: &QueryKey) -> Option<CacheData<Product>> {
    catalog.cache().store().read(key).unwrap()
  }

  fn favorite_in(data: &CacheData<Product>, id: &str) -> bool {
    data.find(id).unwrap().favorite
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
  }

  #[tokio::test]
  async fn test_reads_populate_cache() {
    let catalog = catalog(NoFaults, None);

    let products = catalog.products("Bracket").await.unwrap();
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].id, "p1");
    assert!(cached(&catalog, &list_key("bracket")).is_some());

    let product = catalog.product("p2").await.unwrap();
    assert!(product.favorite);

    assert!(catalog.product("p99").await.is_err());
  }

  #[tokio::test]
  async fn test_mutation_during_first_load_keeps_loading() {
    let gate = Arc::new(Notify::new());
    let catalog = slow_catalog(NoFaults, Some(gate.clone()), Duration::from_millis(50));

    let mut query = catalog.products_query("").unwrap();
    query.fetch();
    let reader = {
      let catalog = catalog.clone();
      tokio::spawn(async move { catalog.products("").await })
    };
    settle().await;

    let task = {
      let catalog = catalog.clone();
      tokio::spawn(async move {
        let input = CreateProductInput {
          name: "Cleco".to_string(),
          price: 3.0,
        };
        catalog.create_product(input, "").await
      })
    };
    settle().await;

    // The cancelled first load restarts instead of failing
    query.poll();
    assert!(query.is_loading());
    assert!(!reader.is_finished());

    gate.notify_one();
    assert!(task.await.unwrap().is_confirmed());

    let products = reader.await.unwrap().unwrap();
    assert!(!products.is_empty());

    catalog
      .cache()
      .wait_idle(&CatalogKey::all_products())
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();
    assert!(query.is_success());
  }

  #[tokio::test]
  async fn test_toggle_success_survives_refetch() {
    let catalog = catalog(NoFaults, None);
    catalog.products("Bracket").await.unwrap();
    let _query = catalog.products_query("Bracket").unwrap();

    let outcome = catalog.toggle_favorite("p1", "Bracket").await;
    assert!(outcome.is_confirmed());
    assert!(outcome.result.unwrap().favorite);

    // Settlement refetches the observed list from the server
    catalog
      .cache()
      .wait_idle(&CatalogKey::all_products())
      .await
      .unwrap();
    let entry = catalog
      .cache()
      .store()
      .entry(&list_key("Bracket"))
      .unwrap()
      .unwrap();
    assert!(!entry.invalidated);
    assert!(favorite_in(&entry.data, "p1"));
  }

  #[tokio::test]
  async fn test_forced_failure_rolls_back() {
    let gate = Arc::new(Notify::new());
    let catalog = catalog(AlwaysFail, Some(gate.clone()));
    catalog.products("Bracket").await.unwrap();
    let mut query = catalog.products_query("Bracket").unwrap();

    let task = {
      let catalog = catalog.clone();
      tokio::spawn(async move { catalog.toggle_favorite("p1", "Bracket").await })
    };
    settle().await;

    let during = cached(&catalog, &list_key("Bracket")).unwrap();
    assert!(favorite_in(&during, "p1"));
    assert!(query.poll());
    assert!(favorite_in(query.data().unwrap(), "p1"));

    gate.notify_one();
    let outcome = task.await.unwrap();
    assert!(outcome.is_rolled_back());
    assert!(matches!(
      outcome.result,
      Err(MutationError::Rejected(ApiError::TransientServerFault { status: 500, .. }))
    ));

    let after = cached(&catalog, &list_key("Bracket")).unwrap();
    assert!(!favorite_in(&after, "p1"));
    // Never-fetched detail stays absent
    assert!(cached(&catalog, &CatalogKey::product("p1").query_key()).is_none());
  }

  #[tokio::test]
  async fn test_invalid_create_restores_list_exactly() {
    let gate = Arc::new(Notify::new());
    let catalog = catalog(NoFaults, Some(gate.clone()));
    catalog.products("").await.unwrap();
    let before = cached(&catalog, &list_key("")).unwrap();

    let task = {
      let catalog = catalog.clone();
      tokio::spawn(async move {
        let input = CreateProductInput {
          name: "Cleco".to_string(),
          price: 0.0,
        };
        catalog.create_product(input, "").await
      })
    };
    settle().await;

    let during = cached(&catalog, &list_key("")).unwrap();
    assert_eq!(during.len(), before.len() + 1);
    let temp = during.as_many().unwrap().last().unwrap();
    assert!(temp.id.starts_with("temp-"));
    assert_eq!(temp.name, "Cleco");

    gate.notify_one();
    let outcome = task.await.unwrap();
    assert!(outcome.is_rolled_back());
    assert_eq!(
      outcome.result.unwrap_err().rejection(),
      Some(&ApiError::InvalidInput("Invalid input".to_string()))
    );
    assert_eq!(cached(&catalog, &list_key("")), Some(before));
  }

  #[tokio::test]
  async fn test_create_replaces_temporary_record() {
    let catalog = catalog(NoFaults, None);
    catalog.products("").await.unwrap();
    let _query = catalog.products_query("").unwrap();

    let input = CreateProductInput {
      name: "Cleco Pliers".to_string(),
      price: 12.0,
    };
    let outcome = catalog.create_product(input, "").await;
    assert_eq!(outcome.result.unwrap().id, "p6");

    catalog
      .cache()
      .wait_idle(&CatalogKey::all_products())
      .await
      .unwrap();
    let list = cached(&catalog, &list_key("")).unwrap().into_vec();
    assert_eq!(list.len(), 6);
    assert!(list.iter().any(|p| p.id == "p6"));
    assert!(list.iter().all(|p| !p.id.starts_with("temp-")));
  }

  #[tokio::test]
  async fn test_detail_placeholder_from_list() {
    let catalog = catalog(NoFaults, None);
    catalog.products("Bracket").await.unwrap();

    let mut listed = catalog.product_query("p1", "Bracket").unwrap();
    listed.fetch();
    assert!(listed.is_placeholder());
    assert_eq!(listed.data().unwrap().as_one().unwrap().id, "p1");

    // p3 is not in the bracket list
    let mut unlisted = catalog.product_query("p3", "Bracket").unwrap();
    unlisted.fetch();
    assert_eq!(unlisted.state(), &crate::query::QueryState::Loading);

    settle().await;
    assert!(listed.poll());
    assert!(listed.is_success());
    assert!(unlisted.poll());
    assert_eq!(unlisted.data().unwrap().as_one().unwrap().id, "p3");
  }

  #[tokio::test]
  async fn test_toggle_edits_list_and_detail() {
    let gate = Arc::new(Notify::new());
    let catalog = catalog(NoFaults, Some(gate.clone()));
    catalog.products("").await.unwrap();
    catalog.product("p2").await.unwrap();
    let detail_key = CatalogKey::product("p2").query_key();

    let task = {
      let catalog = catalog.clone();
      tokio::spawn(async move { catalog.toggle_favorite("p2", "").await })
    };
    settle().await;

    assert!(!favorite_in(&cached(&catalog, &list_key("")).unwrap(), "p2"));
    assert!(!favorite_in(&cached(&catalog, &detail_key).unwrap(), "p2"));
    // Untouched records keep their value
    assert!(!favorite_in(&cached(&catalog, &list_key("")).unwrap(), "p1"));

    gate.notify_one();
    assert!(task.await.unwrap().is_confirmed());
    assert!(!favorite_in(&cached(&catalog, &detail_key).unwrap(), "p2"));
    assert!(catalog.cache().store().entry(&detail_key).unwrap().unwrap().invalidated);
  }
}
