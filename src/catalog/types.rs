use serde::{Deserialize, Serialize};

/// A catalog product as served by the API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub id: String,
  pub name: String,
  pub price: f64,
  pub favorite: bool,
}

/// Body of a create request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateProductInput {
  pub name: String,
  pub price: f64,
}
