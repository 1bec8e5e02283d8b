use std::collections::BTreeSet;

/// Payment transaction ids submitted but not yet seen on chain.
#[derive(Debug, Default, Clone)]
pub struct TxWatchPool {
    ids: BTreeSet<String>,
}

impl TxWatchPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.ids.contains(txid)
    }

    pub fn remove(&mut self, txid: &str) -> bool {
        self.ids.remove(txid)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_set_like() {
        let mut pool = TxWatchPool::new();
        pool.add(["a", "b", "a"]);
        assert_eq!(pool.len(), 2);
        assert!(pool.remove("a"));
        assert!(!pool.remove("a"));
        assert_eq!(pool.ids(), vec!["b".to_string()]);
    }
}
