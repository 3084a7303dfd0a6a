use axum::routing::post;
use axum::{Json, Router};
use catalog_cache::cache::{CacheEvent, CacheLayer, QueryStore};
use catalog_cache::catalog::{
  ApiError, CachedCatalog, CatalogApi, CatalogClient, CatalogKey, CreateProductInput, Product,
};
use catalog_cache::mutation::{MutationError, MutationPhase};
use catalog_cache::server::{
  self, seed_products, AlwaysFail, FaultInjector, NoFaults, ProductDb, ScriptedFaults, ServerState,
};
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;

async fn spawn_router(router: Router) -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    axum::serve(listener, router).await.unwrap();
  });
  format!("http://{}/api", addr)
}

async fn spawn_server(faults: impl FaultInjector + 'static) -> (String, ServerState) {
  let state = ServerState::new(ProductDb::seeded(), faults);
  let base = spawn_router(server::router(state.clone())).await;
  (base, state)
}

fn client(base: &str) -> CatalogClient {
  CatalogClient::with_base_url(base, Duration::from_secs(5)).unwrap()
}

fn cached(api: CatalogClient) -> CachedCatalog<CatalogClient> {
  CachedCatalog::new(
    api,
    CacheLayer::new(QueryStore::new()).with_retry(0, Duration::ZERO),
  )
}

#[tokio::test]
async fn test_client_against_server() {
  let (base, _state) = spawn_server(NoFaults).await;
  let api = client(&base);

  assert_eq!(api.list_products("").await.unwrap(), seed_products());

  let bracket = api.list_products("Bracket").await.unwrap();
  assert_eq!(bracket.len(), 1);
  assert_eq!(bracket[0].id, "p1");

  assert_eq!(
    api.get_product("p99").await,
    Err(ApiError::NotFound("Not found".to_string()))
  );

  let invalid = CreateProductInput {
    name: "Cleco".to_string(),
    price: 0.0,
  };
  assert_eq!(
    api.create_product(&invalid).await,
    Err(ApiError::InvalidInput("Invalid input".to_string()))
  );

  let valid = CreateProductInput {
    name: "Cleco".to_string(),
    price: 3.25,
  };
  let created = api.create_product(&valid).await.unwrap();
  assert_eq!(created.id, "p6");
  assert!(!created.favorite);
}

#[tokio::test]
async fn test_toggle_round_trip() {
  let (base, state) = spawn_server(NoFaults).await;
  let catalog = cached(client(&base));

  catalog.products("Bracket").await.unwrap();
  let _query = catalog.products_query("Bracket").unwrap();

  let outcome = catalog.toggle_favorite("p1", "Bracket").await;
  assert_eq!(
    outcome.transitions.last(),
    Some(&MutationPhase::Settled)
  );
  assert!(outcome.result.unwrap().favorite);

  catalog
    .cache()
    .wait_idle(&CatalogKey::all_products())
    .await
    .unwrap();
  let list = catalog.products("Bracket").await.unwrap();
  assert!(list[0].favorite);
  assert!(state.products()[0].favorite);
}

#[tokio::test(flavor = "current_thread")]
async fn test_mutation_with_list_watcher_on_single_thread() {
  // Same shape as the CLI: a spawned task follows list updates while the
  // mutation runs on the one runtime thread
  let (base, _state) = spawn_server(NoFaults).await;
  let catalog = cached(client(&base));
  catalog.products("").await.unwrap();
  let _list = catalog.products_query("").unwrap();

  let key = CatalogKey::products("").query_key();
  let mut events = catalog.cache().subscribe();
  let watcher = tokio::spawn(async move {
    let mut updates = 0;
    while let Ok(event) = events.recv().await {
      if event == CacheEvent::Updated(key.clone()) {
        updates += 1;
        if updates == 2 {
          break;
        }
      }
    }
    updates
  });

  let input = CreateProductInput {
    name: "Cleco".to_string(),
    price: 3.0,
  };
  let outcome = catalog.create_product(input, "").await;
  assert!(outcome.is_confirmed());
  catalog
    .cache()
    .wait_idle(&CatalogKey::all_products())
    .await
    .unwrap();

  // Speculative insert, then the settlement refetch
  let updates = tokio::time::timeout(Duration::from_secs(5), watcher)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(updates, 2);
  let list = catalog.products("").await.unwrap();
  assert_eq!(list.len(), 6);
}

#[tokio::test]
async fn test_server_fault_rolls_back() {
  let (base, state) = spawn_server(AlwaysFail).await;
  let catalog = cached(client(&base));
  let before = catalog.products("").await.unwrap();

  let outcome = catalog.toggle_favorite("p1", "").await;
  assert!(outcome.is_rolled_back());
  assert!(matches!(
    outcome.result,
    Err(MutationError::Rejected(ApiError::TransientServerFault { status: 500, .. }))
  ));

  let store = catalog.cache().store();
  let after = store
    .read(&CatalogKey::products("").query_key())
    .unwrap()
    .unwrap()
    .into_vec();
  assert_eq!(after, before);
  assert!(store
    .read(&CatalogKey::product("p1").query_key())
    .unwrap()
    .is_none());
  assert_eq!(state.products(), seed_products());
}

#[tokio::test]
async fn test_scripted_faults() {
  let (base, _state) = spawn_server(ScriptedFaults::new([true, false])).await;
  let catalog = cached(client(&base));
  catalog.products("").await.unwrap();

  let input = CreateProductInput {
    name: "Edge Deburrer".to_string(),
    price: 18.0,
  };
  let first = catalog.create_product(input.clone(), "").await;
  assert!(first.is_rolled_back());
  assert_eq!(
    catalog
      .cache()
      .store()
      .read(&CatalogKey::products("").query_key())
      .unwrap()
      .unwrap()
      .len(),
    5
  );

  let second = catalog.create_product(input, "").await;
  assert!(second.is_confirmed());
  assert_eq!(second.result.unwrap().id, "p6");
}

#[tokio::test]
async fn test_malformed_response_rolls_back() {
  // Lists normally but answers the toggle with an incomplete record
  let db = ProductDb::seeded();
  let products = db.all().to_vec();
  let router = Router::new()
    .route(
      "/api/products",
      axum::routing::get(move || {
        let products = products.clone();
        async move { Json(products) }
      }),
    )
    .route(
      "/api/products/:id/favorite",
      post(|| async { Json(json!({ "id": "p1" })) }),
    );
  let base = spawn_router(router).await;
  let catalog = cached(client(&base));
  let before = catalog.products("").await.unwrap();

  let outcome = catalog.toggle_favorite("p1", "").await;
  assert!(outcome.is_rolled_back());
  assert!(matches!(
    outcome.result,
    Err(MutationError::Rejected(ApiError::MalformedResponse(_)))
  ));

  let after: Vec<Product> = catalog
    .cache()
    .store()
    .read(&CatalogKey::products("").query_key())
    .unwrap()
    .unwrap()
    .into_vec();
  assert_eq!(after, before);
}

#[tokio::test]
async fn test_unreachable_server() {
  // Bind and drop to get a port nobody listens on
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  drop(listener);

  let api = client(&format!("http://{}/api", addr));
  assert!(matches!(
    api.list_products("").await,
    Err(ApiError::NetworkFailure(_))
  ));
}
