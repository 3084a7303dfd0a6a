//! In-memory product table backing the mock server.

use crate::catalog::{CreateProductInput, Product};

/// Products the server starts with.
pub fn seed_products() -> Vec<Product> {
  [
    ("p1", "Aluminum Bracket", 29.99, false),
    ("p2", "Steel Gusset", 14.5, true),
    ("p3", "M6 Flanged Nut", 0.49, false),
    ("p4", "Rivnut Tool", 64.0, false),
    ("p5", "Dimple Die 1in", 24.75, false),
  ]
  .into_iter()
  .map(|(id, name, price, favorite)| Product {
    id: id.to_string(),
    name: name.to_string(),
    price,
    favorite,
  })
  .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ProductDb {
  products: Vec<Product>,
}

impl ProductDb {
  pub fn new(products: Vec<Product>) -> Self {
    Self { products }
  }

  pub fn seeded() -> Self {
    Self::new(seed_products())
  }

  pub fn all(&self) -> &[Product] {
    &self.products
  }

  /// Case-insensitive substring match on name. Blank search matches everything.
  pub fn search(&self, search: &str) -> Vec<Product> {
    let needle = search.trim().to_lowercase();
    self
      .products
      .iter()
      .filter(|p| p.name.to_lowercase().contains(&needle))
      .cloned()
      .collect()
  }

  pub fn get(&self, id: &str) -> Option<&Product> {
    self.products.iter().find(|p| p.id == id)
  }

  /// Flip `favorite` and return the updated product.
  pub fn toggle_favorite(&mut self, id: &str) -> Option<Product> {
    let product = self.products.iter_mut().find(|p| p.id == id)?;
    product.favorite = !product.favorite;
    Some(product.clone())
  }

  /// Insert a new product with the next `p<N>` id.
  ///
  /// Returns `None` when the name is empty or the price is not positive.
  pub fn create(&mut self, input: CreateProductInput) -> Option<Product> {
    if input.name.is_empty() || !input.price.is_finite() || input.price <= 0.0 {
      return None;
    }

    let product = Product {
      id: self.next_id(),
      name: input.name,
      price: input.price,
      favorite: false,
    };
    self.products.push(product.clone());
    Some(product)
  }

  /// One past the largest numeric suffix among ids of the form `p<digits>`.
  fn next_id(&self) -> String {
    let max = self
      .products
      .iter()
      .filter_map(|p| p.id.strip_prefix('p'))
      .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
      .filter_map(|digits| digits.parse::<u64>().ok())
      .max()
      .unwrap_or(0);
    format!("p{}", max + 1)
  }
}
