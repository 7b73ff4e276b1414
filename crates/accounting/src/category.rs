//! Product categories. Every category owns exactly one bucket.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A product category offered by a provider, e.g. `cpu-hours` at `hpc`.
///
/// Ordering is by provider first so scans walk providers one at a time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductCategoryId {
    pub provider: String,
    pub name: String,
}

impl ProductCategoryId {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ProductCategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_provider_then_name() {
        let mut categories = vec![
            ProductCategoryId::new("storage", "b"),
            ProductCategoryId::new("cpu", "b"),
            ProductCategoryId::new("gpu", "a"),
        ];
        categories.sort();
        assert_eq!(
            categories,
            vec![
                ProductCategoryId::new("gpu", "a"),
                ProductCategoryId::new("cpu", "b"),
                ProductCategoryId::new("storage", "b"),
            ]
        );
    }

    #[test]
    fn display() {
        assert_eq!(ProductCategoryId::new("cpu", "hpc").to_string(), "cpu/hpc");
    }
}
