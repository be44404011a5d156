//! Asset metadata: sids, asset records, exchanges, and the ordered symbol map.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Dense integer security identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sid(pub u32);

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a symbol trades as an equity or is a computed index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    Equity,
    Index,
}

/// One row of the asset metadata table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub symbol: String,
    pub sid: Sid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub exchange: String,
    pub auto_close_date: NaiveDate,
}

/// One row of the exchanges lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub exchange: String,
    pub canonical_name: String,
    pub country_code: String,
}

/// Deterministic content hash of a prepared bundle (BLAKE3 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetHash(pub String);

impl fmt::Display for DatasetHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Insertion-ordered `symbol -> sid` map.
///
/// Iteration order is part of the contract: entries come back in the order
/// they were assigned, which is also ascending sid order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolMap {
    entries: Vec<(String, Sid)>,
    index: HashMap<String, usize>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the sid for `symbol`, assigning the next one if unseen.
    pub fn assign(&mut self, symbol: &str) -> Sid {
        if let Some(&pos) = self.index.get(symbol) {
            return self.entries[pos].1;
        }
        let sid = Sid(self.entries.len() as u32);
        self.index.insert(symbol.to_string(), self.entries.len());
        self.entries.push((symbol.to_string(), sid));
        sid
    }

    pub fn get(&self, symbol: &str) -> Option<Sid> {
        self.index.get(symbol).map(|&pos| self.entries[pos].1)
    }

    pub fn symbol(&self, sid: Sid) -> Option<&str> {
        self.entries.get(sid.0 as usize).map(|(s, _)| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Sid)> {
        self.entries.iter().map(|(s, sid)| (s.as_str(), *sid))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_dense_sids_in_first_encounter_order() {
        let mut map = SymbolMap::new();
        assert_eq!(map.assign("ZETA"), Sid(0));
        assert_eq!(map.assign("ACME"), Sid(1));
        assert_eq!(map.assign("ZETA"), Sid(0));
        assert_eq!(map.len(), 2);

        let order: Vec<&str> = map.iter().map(|(s, _)| s).collect();
        assert_eq!(order, vec!["ZETA", "ACME"]);
    }

    #[test]
    fn reverse_lookup_by_sid() {
        let mut map = SymbolMap::new();
        map.assign("ACME");
        map.assign("NIFTY50");
        assert_eq!(map.symbol(Sid(1)), Some("NIFTY50"));
        assert_eq!(map.symbol(Sid(5)), None);
        assert_eq!(map.get("ACME"), Some(Sid(0)));
        assert_eq!(map.get("MISSING"), None);
    }
}
