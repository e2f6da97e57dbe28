//! The function catalog a worker reports during its handshake.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Ordered list of RPC function names; a name's position is its 8-bit
/// call index. The catalog is immutable for the lifetime of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    names: Vec<String>,
    index: HashMap<String, u8>,
}

impl Catalog {
    /// Builds a catalog from the decoded name list. The 8-bit function
    /// field bounds the catalog to 256 entries; an empty catalog is a
    /// broken worker.
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() || names.len() > 256 {
            return Err(Error::CatalogSize(names.len()));
        }

        let index = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx as u8))
            .collect();

        Ok(Self { names, index })
    }

    /// The largest valid function index.
    pub fn last_idx(&self) -> u8 {
        (self.names.len() - 1) as u8
    }

    /// Looks up a function index by name in constant time. `None` means
    /// absent; index 0 is a regular index, not a sentinel.
    pub fn lookup(&self, name: &str) -> Option<u8> {
        self.index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// A copy of the full name-to-index map.
    pub fn funcs_map(&self) -> HashMap<String, u8> {
        self.index.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Catalog {
        Catalog::new(vec![
            "rpc_funcs".to_string(),
            "test_crash".to_string(),
            "test_error".to_string(),
            "swe_version".to_string(),
        ])
        .unwrap()
    }

    #[test]
    fn test_last_idx() {
        assert_eq!(catalog().last_idx(), 3);
    }

    #[test]
    fn test_lookup_present() {
        let c = catalog();
        assert_eq!(c.lookup("rpc_funcs"), Some(0));
        assert_eq!(c.lookup("swe_version"), Some(3));
    }

    #[test]
    fn test_lookup_absent() {
        assert_eq!(catalog().lookup("nope"), None);
    }

    #[test]
    fn test_index_zero_is_not_a_sentinel() {
        let c = catalog();
        assert_eq!(c.lookup("rpc_funcs"), Some(0));
        assert!(c.lookup("rpc_funcs").is_some());
        assert!(c.lookup("missing").is_none());
    }

    #[test]
    fn test_funcs_map() {
        let m = catalog().funcs_map();
        assert_eq!(m.len(), 4);
        assert_eq!(m["test_error"], 2);
    }

    #[test]
    fn test_empty_catalog_rejected() {
        assert!(matches!(Catalog::new(Vec::new()), Err(Error::CatalogSize(0))));
    }

    #[test]
    fn test_full_catalog_accepted() {
        let names: Vec<String> = (0..256).map(|i| format!("fn_{}", i)).collect();
        let c = Catalog::new(names).unwrap();
        assert_eq!(c.last_idx(), 255);
        assert_eq!(c.lookup("fn_255"), Some(255));
    }

    #[test]
    fn test_oversized_catalog_rejected() {
        let names: Vec<String> = (0..257).map(|i| format!("fn_{}", i)).collect();
        assert!(matches!(Catalog::new(names), Err(Error::CatalogSize(257))));
    }
}
