//! Composite cache keys.

use std::fmt;

/// Composite key addressing a cache entry: a resource name followed by
/// zero or more parameters.
///
/// Keys are compared part by part, so `["products"]` is a prefix of
/// `["products", "bracket"]` but not of `["product", "p1"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
  parts: Vec<String>,
}

impl QueryKey {
  /// Key for a resource with no parameters. Also usable as a prefix.
  pub fn new(resource: impl Into<String>) -> Self {
    Self {
      parts: vec![resource.into()],
    }
  }

  /// Append a parameter.
  pub fn with(mut self, part: impl Into<String>) -> Self {
    self.parts.push(part.into());
    self
  }

  /// True if `prefix` matches the leading parts of this key.
  pub fn matches(&self, prefix: &QueryKey) -> bool {
    self.parts.starts_with(&prefix.parts)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}]", self.parts.join(", "))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_prefix_matching() {
    let list = QueryKey::new("products").with("bracket");
    let detail = QueryKey::new("product").with("p1");
    let prefix = QueryKey::new("products");

    assert!(list.matches(&prefix));
    assert!(prefix.matches(&prefix));
    assert!(!detail.matches(&prefix));
    assert!(!prefix.matches(&list));
  }

  #[test]
  fn test_empty_parameter_is_distinct() {
    let all = QueryKey::new("products").with("");
    assert_ne!(all, QueryKey::new("products"));
    assert!(all.matches(&QueryKey::new("products")));
  }

  #[test]
  fn test_display() {
    let key = QueryKey::new("product").with("p1");
    assert_eq!(key.to_string(), "[product, p1]");
  }
}
