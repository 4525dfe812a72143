//! Dense function keys.
//!
//! The runtime indexes its per-function tables by key, so keys are handed
//! out densely from 0 in first-encounter order. They are only meaningful
//! within one compilation.
use std::collections::BTreeMap;

/// Key of an instrumented function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FunctionKey(pub u32);

impl std::fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default, Clone)]
pub struct FunctionKeyRegistry {
    keys: BTreeMap<String, FunctionKey>,
    names: Vec<String>,
}

impl FunctionKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of `name`, assigning the next free key on first use.
    pub fn key_for(&mut self, name: &str) -> FunctionKey {
        if let Some(key) = self.keys.get(name) {
            return *key;
        }
        let key = FunctionKey(self.names.len() as u32);
        self.keys.insert(name.to_string(), key);
        self.names.push(name.to_string());
        key
    }

    pub fn get(&self, name: &str) -> Option<FunctionKey> {
        self.keys.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// `(key, name)` pairs in key order.
    pub fn table(&self) -> impl Iterator<Item = (FunctionKey, &str)> + '_ {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (FunctionKey(i as u32), name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_dense_and_idempotent() {
        let mut keys = FunctionKeyRegistry::new();
        assert!(keys.is_empty());

        let main = keys.key_for("main");
        let foo = keys.key_for("foo");
        assert_eq!(main, FunctionKey(0));
        assert_eq!(foo, FunctionKey(1));
        assert_eq!(keys.key_for("main"), main);
        assert_eq!(keys.get("bar"), None);

        let table: Vec<_> = keys.table().collect();
        assert_eq!(table, vec![(FunctionKey(0), "main"), (FunctionKey(1), "foo")]);
        assert_eq!(keys.len(), 2);
    }
}
