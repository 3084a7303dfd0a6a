//! Mock catalog API server.
//!
//! Five endpoints over an in-memory product table. The two mutating
//! endpoints consult a [`FaultInjector`] before doing anything, so tests can
//! force failures deterministically while the binary uses random ones.

mod db;
mod faults;

pub use db::{seed_products, ProductDb};
pub use faults::{AlwaysFail, FaultInjector, NoFaults, Operation, RandomFaults, ScriptedFaults};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::catalog::{CreateProductInput, Product};
use crate::config::ServerConfig;

/// Shared handler state.
#[derive(Clone)]
pub struct ServerState {
  db: Arc<Mutex<ProductDb>>,
  faults: Arc<dyn FaultInjector>,
  latency: Duration,
}

impl ServerState {
  pub fn new(db: ProductDb, faults: impl FaultInjector + 'static) -> Self {
    Self {
      db: Arc::new(Mutex::new(db)),
      faults: Arc::new(faults),
      latency: Duration::ZERO,
    }
  }

  pub fn from_config(config: &ServerConfig) -> Self {
    Self::new(ProductDb::seeded(), RandomFaults::new(config.failure_rate))
      .with_latency(Duration::from_millis(config.latency_ms))
  }

  /// Delay every response by `latency`.
  pub fn with_latency(mut self, latency: Duration) -> Self {
    self.latency = latency;
    self
  }

  /// Current contents of the product table.
  pub fn products(&self) -> Vec<Product> {
    self
      .db
      .lock()
      .map(|db| db.all().to_vec())
      .unwrap_or_default()
  }

  fn db(&self) -> Result<MutexGuard<'_, ProductDb>, Response> {
    self
      .db
      .lock()
      .map_err(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "Database unavailable"))
  }

  async fn delay(&self) {
    if !self.latency.is_zero() {
      tokio::time::sleep(self.latency).await;
    }
  }
}

/// Build the API router.
pub fn router(state: ServerState) -> Router {
  Router::new()
    .route("/api/products", get(list_products).post(create_product))
    .route("/api/products/:id", get(get_product))
    .route("/api/products/:id/favorite", post(toggle_favorite))
    .with_state(state)
}

/// Serve the API on an already bound listener.
pub async fn serve(listener: TcpListener, state: ServerState) -> Result<()> {
  axum::serve(listener, router(state))
    .await
    .map_err(|e| eyre!("Server error: {}", e))
}

/// Bind to the configured address and serve until the process exits.
pub async fn run(config: &ServerConfig) -> Result<()> {
  let listener = TcpListener::bind(&config.bind)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", config.bind, e))?;
  let addr = listener
    .local_addr()
    .map_err(|e| eyre!("Failed to read bound address: {}", e))?;

  info!(
    %addr,
    failure_rate = config.failure_rate,
    latency_ms = config.latency_ms,
    "catalog API listening on http://{}/api/products",
    addr
  );

  serve(listener, ServerState::from_config(config)).await
}

fn error_response(status: StatusCode, message: &str) -> Response {
  (status, Json(json!({ "error": message }))).into_response()
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
  #[serde(default)]
  search: String,
}

async fn list_products(
  State(state): State<ServerState>,
  Query(params): Query<SearchParams>,
) -> Response {
  state.delay().await;

  let db = match state.db() {
    Ok(db) => db,
    Err(response) => return response,
  };
  let products = db.search(&params.search);
  info!(search = %params.search, count = products.len(), "GET /api/products");
  Json(products).into_response()
}

async fn get_product(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
  state.delay().await;

  let db = match state.db() {
    Ok(db) => db,
    Err(response) => return response,
  };
  match db.get(&id) {
    Some(product) => Json(product.clone()).into_response(),
    None => error_response(StatusCode::NOT_FOUND, "Not found"),
  }
}

async fn toggle_favorite(State(state): State<ServerState>, Path(id): Path<String>) -> Response {
  state.delay().await;

  if state.faults.should_fail(Operation::ToggleFavorite) {
    warn!(%id, "injected fault on favorite toggle");
    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Random server error");
  }

  let mut db = match state.db() {
    Ok(db) => db,
    Err(response) => return response,
  };
  match db.toggle_favorite(&id) {
    Some(product) => {
      info!(%id, favorite = product.favorite, "toggled favorite");
      Json(product).into_response()
    }
    None => error_response(StatusCode::NOT_FOUND, "Not found"),
  }
}

async fn create_product(State(state): State<ServerState>, body: Bytes) -> Response {
  state.delay().await;

  if state.faults.should_fail(Operation::CreateProduct) {
    warn!("injected fault on create");
    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create product");
  }

  let created = parse_create(&body).and_then(|input| match state.db() {
    Ok(mut db) => db.create(input).map(Ok),
    Err(response) => Some(Err(response)),
  });

  match created {
    Some(Ok(product)) => {
      info!(id = %product.id, name = %product.name, "created product");
      (StatusCode::CREATED, Json(product)).into_response()
    }
    Some(Err(response)) => response,
    None => error_response(StatusCode::BAD_REQUEST, "Invalid input"),
  }
}

/// Accept `{name, price}` only when `name` is a string and `price` a number.
fn parse_create(body: &[u8]) -> Option<CreateProductInput> {
  let value: Value = serde_json::from_slice(body).ok()?;
  let name = value.get("name")?.as_str()?;
  let price = value.get("price")?.as_f64()?;
  Some(CreateProductInput {
    name: name.to_string(),
    price,
  })
}
