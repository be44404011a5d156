//! Asset metadata: sids, date ranges, exchange buckets.

use crate::config::{ExchangeNames, PipelineConfig};
use barforge_core::data::SymbolRules;
use barforge_core::domain::{AssetKind, AssetRecord, DailyBar, ExchangeRecord, Sid, SymbolMap};
use chrono::Days;
use serde::Serialize;

/// Everything the asset side of a bundle needs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetTable {
    /// Ascending by sid.
    pub assets: Vec<AssetRecord>,
    pub exchanges: Vec<ExchangeRecord>,
    pub symbol_map: SymbolMap,
}

impl AssetTable {
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn get(&self, sid: Sid) -> Option<&AssetRecord> {
        self.assets.get(sid.0 as usize)
    }

    /// Exchange bucket counts, for the run summary.
    pub fn summary(&self) -> Vec<ExchangeCount> {
        self.exchanges
            .iter()
            .map(|e| ExchangeCount {
                exchange: e.exchange.clone(),
                assets: self
                    .assets
                    .iter()
                    .filter(|a| a.exchange == e.exchange)
                    .count(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeCount {
    pub exchange: String,
    pub assets: usize,
}

/// Builds asset records in sid order as surviving symbols are registered.
#[derive(Debug, Clone)]
pub struct AssetMetadataBuilder {
    rules: SymbolRules,
    exchanges: ExchangeNames,
    symbol_map: SymbolMap,
    assets: Vec<AssetRecord>,
}

impl AssetMetadataBuilder {
    pub fn new(rules: SymbolRules, exchanges: ExchangeNames) -> Self {
        Self {
            rules,
            exchanges,
            symbol_map: SymbolMap::new(),
            assets: Vec::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.symbols.clone(), config.exchanges.clone())
    }

    pub fn exchange_for(&self, symbol: &str) -> &str {
        match self.rules.classify(symbol) {
            AssetKind::Equity => &self.exchanges.equity,
            AssetKind::Index => &self.exchanges.index,
        }
    }

    /// Register a surviving symbol. Sids follow registration order; a symbol
    /// with no daily bars gets none. Re-registering returns the existing sid.
    pub fn add(&mut self, symbol: &str, daily: &[DailyBar]) -> Option<Sid> {
        if let Some(sid) = self.symbol_map.get(symbol) {
            return Some(sid);
        }
        let (first, last) = (daily.first()?, daily.last()?);
        let exchange = self.exchange_for(symbol).to_string();
        let sid = self.symbol_map.assign(symbol);
        self.assets.push(AssetRecord {
            symbol: symbol.to_string(),
            sid,
            start_date: first.date,
            end_date: last.date,
            exchange,
            auto_close_date: last.date + Days::new(1),
        });
        Some(sid)
    }

    pub fn build(self) -> AssetTable {
        let exchange = |name: &str| ExchangeRecord {
            exchange: name.to_string(),
            canonical_name: name.to_string(),
            country_code: self.exchanges.country_code.clone(),
        };
        let exchanges = vec![exchange(&self.exchanges.equity), exchange(&self.exchanges.index)];
        AssetTable {
            assets: self.assets,
            exchanges,
            symbol_map: self.symbol_map,
        }
    }
}
