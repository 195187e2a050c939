//! Kraken v2 `ohlc` channel as a [`CandleFeed`].

use algo_pipeline_core::{Candle, CandleFeed};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

use crate::websocket::{KrakenWebSocket, WsEvent};

/// One entry of an `ohlc` message's `data` array. Extra fields (`trades`,
/// `vwap`, `interval`, `timestamp`) are ignored.
#[derive(Debug, Deserialize)]
struct KrakenOhlc {
    symbol: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    interval_begin: DateTime<Utc>,
}

impl From<KrakenOhlc> for Candle {
    fn from(ohlc: KrakenOhlc) -> Self {
        Self {
            symbol: ohlc.symbol,
            interval_begin: ohlc.interval_begin,
            open: ohlc.open,
            high: ohlc.high,
            low: ohlc.low,
            close: ohlc.close,
            volume: ohlc.volume,
        }
    }
}

/// Builds the v2 subscribe request for the OHLC channel.
#[must_use]
pub fn ohlc_subscription(symbols: &[String], interval_mins: u32) -> serde_json::Value {
    serde_json::json!({
        "method": "subscribe",
        "params": {
            "channel": "ohlc",
            "symbol": symbols,
            "interval": interval_mins,
            "snapshot": false
        }
    })
}

/// Extracts the candles carried by one Kraken message.
///
/// Heartbeats, status updates, pongs and successful acks carry no candles.
/// Malformed `ohlc` entries are logged and skipped; the rest of the message
/// is kept.
///
/// # Errors
/// Returns an error if the server rejected a subscription.
pub fn parse_message(message: &serde_json::Value) -> Result<Vec<Candle>> {
    if message.get("success").and_then(serde_json::Value::as_bool) == Some(false) {
        let method = message
            .get("method")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown");
        let error = message
            .get("error")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("no reason given");
        bail!("Kraken rejected {method} request: {error}");
    }

    if message.get("channel").and_then(serde_json::Value::as_str) != Some("ohlc") {
        return Ok(Vec::new());
    }

    let Some(data) = message.get("data") else {
        return Ok(Vec::new());
    };

    let Some(entries) = data.as_array() else {
        tracing::warn!(%data, "Skipping ohlc message whose data is not an array");
        return Ok(Vec::new());
    };

    Ok(entries
        .iter()
        .filter_map(|entry| match KrakenOhlc::deserialize(entry) {
            Ok(ohlc) => Some(Candle::from(ohlc)),
            Err(e) => {
                tracing::warn!(%entry, error = %e, "Skipping malformed ohlc entry");
                None
            }
        })
        .collect())
}

/// Longest a single `next_batch` waits for a frame.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub struct KrakenCandleFeed {
    ws: KrakenWebSocket,
    read_timeout: Duration,
}

impl KrakenCandleFeed {
    #[must_use]
    pub fn new(ws_url: String) -> Self {
        Self {
            ws: KrakenWebSocket::new(ws_url),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }
}

#[async_trait]
impl CandleFeed for KrakenCandleFeed {
    async fn subscribe(&mut self, symbols: &[String], interval_mins: u32) -> Result<()> {
        if !self.ws.is_connected() {
            self.ws.connect().await?;
        }

        self.ws
            .subscribe(ohlc_subscription(symbols, interval_mins))
            .await?;
        tracing::info!(?symbols, interval_mins, "Subscribed to Kraken OHLC");
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Option<Vec<Candle>>> {
        let message = match self.ws.next_event(self.read_timeout).await? {
            WsEvent::Message(message) => message,
            WsEvent::Idle => return Ok(Some(Vec::new())),
            WsEvent::Ended => return Ok(None),
        };

        let candles = parse_message(&message)?;
        if !candles.is_empty() {
            tracing::trace!(count = candles.len(), "Received candles");
        }
        Ok(Some(candles))
    }

    async fn close(&mut self) -> Result<()> {
        self.ws.close().await
    }
}
