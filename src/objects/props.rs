//! Properties Container
//!
//! Ordered string map attached to an object; every key is persisted as its
//! own row under the container's path.

use crate::error::{Error, Result};
use crate::transaction::{DbOp, ObjectKind, Transaction, TransactionObject, TxMap};
use std::collections::BTreeMap;

const MAX_KEY_LEN: usize = 512;

#[derive(Debug)]
pub struct Props {
    path: String,
    map: TxMap<String, String>,
}

impl Props {
    pub(crate) fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            map: TxMap::new(),
        }
    }

    /// Container with preloaded entries, as mirrored from the controller
    pub(crate) fn with_entries(path: impl Into<String>, entries: BTreeMap<String, String>) -> Self {
        Self {
            path: path.into(),
            map: TxMap::from_map(entries),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn row(&self, key: &str) -> String {
        format!("{}:{}", self.path, key)
    }

    fn check_key(key: &str) -> Result<()> {
        if key.is_empty() || key.len() > MAX_KEY_LEN || key.starts_with('/') {
            return Err(Error::InvalidName {
                kind: "property key",
                name: key.to_string(),
                reason: format!("must be 1..={} characters, not starting with '/'", MAX_KEY_LEN),
            });
        }
        Ok(())
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.map.get(&key.to_string())
    }

    pub(crate) fn entries(&self) -> BTreeMap<String, String> {
        self.map.to_map()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn set(&self, tx: &mut Transaction, key: &str, value: &str) -> Result<Option<String>> {
        Self::check_key(key)?;
        let old = self.map.insert(tx, key.to_string(), value.to_string())?;
        tx.journal(DbOp::update(ObjectKind::Props, self.row(key), "value"))?;
        Ok(old)
    }

    /// Copy every entry of `entries` into this container
    pub(crate) fn set_all(&self, tx: &mut Transaction, entries: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in entries {
            self.set(tx, key, value)?;
        }
        Ok(())
    }

    pub(crate) fn remove(&self, tx: &mut Transaction, key: &str) -> Result<Option<String>> {
        let old = self.map.remove(tx, &key.to_string())?;
        if old.is_some() {
            tx.journal(DbOp::delete(ObjectKind::Props, self.row(key)))?;
        }
        Ok(old)
    }

    /// Drop every entry and the container's rows
    pub(crate) fn delete(&self, tx: &mut Transaction) -> Result<()> {
        if !self.map.is_empty() {
            self.map.clear(tx)?;
        }
        tx.journal(DbOp::delete(ObjectKind::Props, self.path.clone()))
    }
}

impl TransactionObject for Props {
    fn is_dirty(&self) -> bool {
        self.map.is_dirty()
    }

    fn commit(&self) {
        self.map.commit()
    }

    fn rollback(&self) {
        self.map.rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::MemoryDriver;
    use std::sync::Arc;

    #[test]
    fn test_props_rows() {
        let driver = Arc::new(MemoryDriver::new());
        let props = Props::new("/nodes/ALPHA");
        let mut tx = Transaction::new(driver.clone());

        props.set(&mut tx, "Aux/site", "east").unwrap();
        props.set(&mut tx, "Aux/rack", "r1").unwrap();
        assert_eq!(props.remove(&mut tx, "Aux/rack").unwrap(), Some("r1".to_string()));
        assert_eq!(props.remove(&mut tx, "missing").unwrap(), None);
        tx.commit().unwrap();

        assert!(driver.contains(ObjectKind::Props, "/nodes/ALPHA:Aux/site"));
        assert!(!driver.contains(ObjectKind::Props, "/nodes/ALPHA:Aux/rack"));
        assert_eq!(props.get("Aux/site").as_deref(), Some("east"));
    }

    #[test]
    fn test_props_key_validation() {
        let props = Props::new("/nodes/ALPHA");
        let mut tx = Transaction::new(Arc::new(MemoryDriver::new()));

        assert!(props.set(&mut tx, "", "x").is_err());
        assert!(props.set(&mut tx, "/abs", "x").is_err());
        assert_eq!(props.len(), 0);
    }

    #[test]
    fn test_props_delete() {
        let driver = Arc::new(MemoryDriver::new());
        let props = Props::new("/resources/ALPHA/DATA");
        let mut tx = Transaction::new(driver.clone());
        props.set(&mut tx, "key", "value").unwrap();
        tx.commit().unwrap();

        let mut tx = Transaction::new(driver.clone());
        props.delete(&mut tx).unwrap();
        tx.commit().unwrap();

        assert!(props.entries().is_empty());
        assert_eq!(driver.row_count(ObjectKind::Props), 0);
    }
}
