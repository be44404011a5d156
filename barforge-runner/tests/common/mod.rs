//! Shared fixtures for the runner's integration tests.

#![allow(dead_code)]

use barforge_core::domain::{AssetRecord, ExchangeRecord, Sid};
use barforge_core::ExchangeCalendar;
use barforge_runner::{
    BundleManifest, BundleWriter, CorporateActions, FrameStream, PipelineError, SymbolFrame,
};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn xnse() -> Arc<ExchangeCalendar> {
    Arc::new(ExchangeCalendar::xnse())
}

/// One CSV line: IST wall clock, OHLC, volume.
pub type Row<'a> = (&'a str, f64, f64, f64, f64, u64);

pub fn write_csv(dir: &Path, name: &str, rows: &[Row<'_>]) -> PathBuf {
    let mut body = String::from("datetime,open,high,low,close,volume\n");
    for (ts, o, h, l, c, v) in rows {
        body.push_str(&format!("{ts},{o},{h},{l},{c},{v}\n"));
    }
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Flat bar with all prices equal.
pub fn flat<'a>(ts: &'a str, price: f64, volume: u64) -> Row<'a> {
    (ts, price, price, price, price, volume)
}

/// A `BundleWriter` that keeps everything in memory and logs call order.
#[derive(Default)]
pub struct RecordingWriter {
    pub calls: Vec<&'static str>,
    pub minute: Vec<SymbolFrame>,
    pub daily: Vec<SymbolFrame>,
    pub assets: Option<Vec<AssetRecord>>,
    pub exchanges: Vec<ExchangeRecord>,
    pub manifest: Option<BundleManifest>,
    pub aborted: bool,
}

impl RecordingWriter {
    pub fn minute_for(&self, sid: u32) -> &DataFrame {
        &self
            .minute
            .iter()
            .find(|f| f.sid == Sid(sid))
            .unwrap()
            .frame
    }

    pub fn daily_for(&self, sid: u32) -> &DataFrame {
        &self
            .daily
            .iter()
            .find(|f| f.sid == Sid(sid))
            .unwrap()
            .frame
    }

    pub fn symbols(&self) -> Vec<(String, Sid)> {
        self.assets
            .iter()
            .flatten()
            .map(|a| (a.symbol.clone(), a.sid))
            .collect()
    }
}

impl BundleWriter for RecordingWriter {
    fn write_minute_bars(&mut self, bars: &mut FrameStream<'_>) -> Result<usize, PipelineError> {
        self.calls.push("minute");
        let mut rows = 0;
        for frame in bars {
            let frame = frame?;
            rows += frame.frame.height();
            self.minute.push(frame);
        }
        Ok(rows)
    }

    fn write_daily_bars(&mut self, bars: &mut FrameStream<'_>) -> Result<usize, PipelineError> {
        self.calls.push("daily");
        let mut rows = 0;
        for frame in bars {
            let frame = frame?;
            rows += frame.frame.height();
            self.daily.push(frame);
        }
        Ok(rows)
    }

    fn write_asset_metadata(
        &mut self,
        assets: &[AssetRecord],
        exchanges: &[ExchangeRecord],
    ) -> Result<(), PipelineError> {
        self.calls.push("assets");
        self.assets = Some(assets.to_vec());
        self.exchanges = exchanges.to_vec();
        Ok(())
    }

    fn write_corporate_actions(
        &mut self,
        _actions: &CorporateActions,
    ) -> Result<(), PipelineError> {
        self.calls.push("corporate_actions");
        Ok(())
    }

    fn commit(&mut self, manifest: &BundleManifest) -> Result<(), PipelineError> {
        self.calls.push("commit");
        self.manifest = Some(manifest.clone());
        Ok(())
    }

    fn abort(&mut self) {
        self.calls.push("abort");
        self.aborted = true;
    }
}

pub fn f64s(df: &DataFrame, name: &str) -> Vec<f64> {
    df.column(name).unwrap().f64().unwrap().into_iter().flatten().collect()
}

pub fn u64s(df: &DataFrame, name: &str) -> Vec<u64> {
    df.column(name).unwrap().u64().unwrap().into_iter().flatten().collect()
}
