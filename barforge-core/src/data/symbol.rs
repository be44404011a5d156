//! Symbol normalization and equity/index classification.
//!
//! File-mode symbols come from file stems such as `acme_minute` or
//! `NIFTY 50_1min`; store-mode symbols come straight from the table. Both go
//! through the same rules so fragments for one instrument merge.

use crate::domain::AssetKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Normalization rules, usually loaded from the `[symbols]` config table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolRules {
    /// Suffixes removed (case-insensitively) from raw names, repeatedly.
    pub strip_suffixes: Vec<String>,
    /// Raw index names mapped to their canonical symbol. Targets are indices.
    pub index_aliases: BTreeMap<String, String>,
    /// Additional canonical symbols classified as indices.
    pub index_symbols: BTreeSet<String>,
}

impl Default for SymbolRules {
    fn default() -> Self {
        let index_aliases = [("NIFTY 50", "NIFTY50"), ("NIFTY BANK", "BANKNIFTY")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            strip_suffixes: ["_MINUTE", "_1MIN", "-EQ", ".NS"]
                .into_iter()
                .map(String::from)
                .collect(),
            index_aliases,
            index_symbols: BTreeSet::new(),
        }
    }
}

impl SymbolRules {
    /// Canonical form of a raw symbol or file stem.
    pub fn normalize(&self, raw: &str) -> String {
        let mut name = raw.trim().to_uppercase();
        loop {
            let before = name.len();
            for suffix in &self.strip_suffixes {
                let suffix = suffix.to_uppercase();
                if name.len() > suffix.len() && name.ends_with(&suffix) {
                    name.truncate(name.len() - suffix.len());
                    name = name.trim_end().to_string();
                }
            }
            if name.len() == before {
                break;
            }
        }

        if let Some(target) = self
            .index_aliases
            .iter()
            .find(|(alias, _)| alias.to_uppercase() == name)
            .map(|(_, target)| target)
        {
            return target.to_uppercase();
        }

        name.split_whitespace().collect::<Vec<_>>().join("_")
    }

    /// Classify an already-normalized symbol.
    pub fn classify(&self, symbol: &str) -> AssetKind {
        let is_alias_target = self
            .index_aliases
            .values()
            .any(|t| t.eq_ignore_ascii_case(symbol));
        let is_listed = self
            .index_symbols
            .iter()
            .any(|s| s.eq_ignore_ascii_case(symbol));
        if is_alias_target || is_listed {
            AssetKind::Index
        } else {
            AssetKind::Equity
        }
    }
}
